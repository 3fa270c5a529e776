// rust/runtime-core/src/collective/mod.rs

//! Collective gradient aggregation.
//!
//! - [`CollectiveChannel`]: per-step all-reduce with timeout, abort on peer
//!   loss and step-skew detection
//! - [`Transport`]: pluggable point-to-point delivery, with an in-process
//!   [`LocalMesh`] and a [`TcpTransport`]
//! - Deterministic reduction in ascending worker order
//!
//! # Example
//!
//! ```
//! use synctrain_core::collective::{reduce, ReduceOp};
//! use synctrain_core::state::{Gradients, Tensor};
//!
//! let mut a = Gradients::new();
//! a.insert("w".to_string(), Tensor::vector(vec![1.0, 2.0]));
//! let mut b = Gradients::new();
//! b.insert("w".to_string(), Tensor::vector(vec![3.0, 4.0]));
//!
//! let mean = reduce(ReduceOp::Mean, [(0, &a), (1, &b)]).unwrap();
//! assert_eq!(mean["w"].data, vec![2.0, 3.0]);
//! ```

mod channel;
mod local;
mod message;
mod reduce;
mod round;
mod tcp;
mod transport;

pub use channel::CollectiveChannel;
pub use local::{LocalMesh, LocalTransport};
pub use message::{decode_body, encode_frame, frame_len, Contribution, Origin, PeerMessage, MAX_FRAME_SIZE};
pub use reduce::{reduce, ReduceOp};
pub use round::{CollectiveRound, RoundPhase};
pub use tcp::TcpTransport;
pub use transport::{EventReceiver, Transport, TransportEvent};
