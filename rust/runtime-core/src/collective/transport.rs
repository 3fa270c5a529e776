// rust/runtime-core/src/collective/transport.rs

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::message::PeerMessage;
use crate::error::Result;

/// Something that happened on the links to other workers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(PeerMessage),
    /// The connection from `peer` closed or reset. `incarnation` names the
    /// process that was on the other end, when the transport knows it.
    Disconnected {
        peer: usize,
        incarnation: Option<Uuid>,
    },
}

/// Receiving half of a transport, handed out when the transport is built.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Point-to-point message delivery between workers.
///
/// Delivery is best effort: a message to a dead or unreachable peer is
/// dropped without an error. Liveness is the failure monitor's concern, and
/// the collective channel re-sends on retry.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_index(&self) -> usize;

    fn worker_count(&self) -> usize;

    /// Sends `message` to `peer`.
    ///
    /// # Errors
    ///
    /// Only for misuse (unknown peer, unencodable message); never because
    /// the peer is down.
    async fn send(&self, peer: usize, message: PeerMessage) -> Result<()>;

    /// Sends `message` to every other worker.
    async fn broadcast(&self, message: PeerMessage) -> Result<()> {
        let local = self.local_index();
        for peer in (0..self.worker_count()).filter(|&p| p != local) {
            self.send(peer, message.clone()).await?;
        }
        Ok(())
    }
}
