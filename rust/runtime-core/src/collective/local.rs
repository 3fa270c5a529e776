// rust/runtime-core/src/collective/local.rs

//! In-process transport for single-process clusters and tests.
//!
//! Every endpoint owns an unbounded tokio channel. An endpoint can be
//! silenced, which drops all traffic to and from it like a hung process or
//! a partitioned host, and later reconnected with a fresh receiver, which
//! is how a restarted worker rejoins.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::message::PeerMessage;
use super::transport::{EventReceiver, Transport, TransportEvent};
use crate::error::{Result, RuntimeError};

struct Endpoint {
    sender: mpsc::UnboundedSender<TransportEvent>,
    silenced: bool,
}

struct MeshInner {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl MeshInner {
    fn deliver(&self, from: usize, to: usize, event: TransportEvent) -> Result<()> {
        let endpoints = self.endpoints.read();
        let count = endpoints.len();
        let target = endpoints.get(to).ok_or_else(|| {
            RuntimeError::transport(format!("peer {to} out of range for a mesh of {count}"))
        })?;
        if endpoints[from].silenced || target.silenced {
            return Ok(());
        }
        // A closed receiver is a dead worker; drop like the network would.
        let _ = target.sender.send(event);
        Ok(())
    }
}

/// Shared in-process network of `n` endpoints.
#[derive(Clone)]
pub struct LocalMesh {
    inner: Arc<MeshInner>,
}

impl LocalMesh {
    /// Creates a mesh and returns the receiver of every endpoint, by index.
    pub fn new(worker_count: usize) -> (Self, Vec<EventReceiver>) {
        let mut endpoints = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (sender, receiver) = mpsc::unbounded_channel();
            endpoints.push(Endpoint {
                sender,
                silenced: false,
            });
            receivers.push(receiver);
        }

        let mesh = Self {
            inner: Arc::new(MeshInner {
                endpoints: RwLock::new(endpoints),
            }),
        };
        (mesh, receivers)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.endpoints.read().len()
    }

    /// Sending half for worker `index`.
    pub fn transport(&self, index: usize) -> Result<Arc<LocalTransport>> {
        let worker_count = self.worker_count();
        if index >= worker_count {
            return Err(RuntimeError::transport(format!(
                "endpoint {index} out of range for a mesh of {worker_count}"
            )));
        }
        Ok(Arc::new(LocalTransport {
            inner: Arc::clone(&self.inner),
            index,
            worker_count,
        }))
    }

    /// Drops all traffic to and from `index` until restored.
    pub fn silence(&self, index: usize) {
        if let Some(endpoint) = self.inner.endpoints.write().get_mut(index) {
            endpoint.silenced = true;
        }
    }

    pub fn restore(&self, index: usize) {
        if let Some(endpoint) = self.inner.endpoints.write().get_mut(index) {
            endpoint.silenced = false;
        }
    }

    pub fn is_silenced(&self, index: usize) -> bool {
        self.inner
            .endpoints
            .read()
            .get(index)
            .map_or(false, |e| e.silenced)
    }

    /// Silences `index` and tells every other endpoint its connection
    /// dropped, like a process crash with a connection reset.
    pub fn disconnect(&self, index: usize) {
        self.silence(index);
        let endpoints = self.inner.endpoints.read();
        for (i, endpoint) in endpoints.iter().enumerate() {
            if i != index {
                let _ = endpoint.sender.send(TransportEvent::Disconnected {
                    peer: index,
                    incarnation: None,
                });
            }
        }
    }

    /// Replaces the channel of `index` and lifts any silence. The old
    /// receiver sees its channel close. Returns the new receiver.
    pub fn reconnect(&self, index: usize) -> Result<EventReceiver> {
        let mut endpoints = self.inner.endpoints.write();
        let count = endpoints.len();
        let endpoint = endpoints.get_mut(index).ok_or_else(|| {
            RuntimeError::transport(format!("endpoint {index} out of range for a mesh of {count}"))
        })?;
        let (sender, receiver) = mpsc::unbounded_channel();
        endpoint.sender = sender;
        endpoint.silenced = false;
        Ok(receiver)
    }
}

/// One worker's view of a [`LocalMesh`].
pub struct LocalTransport {
    inner: Arc<MeshInner>,
    index: usize,
    worker_count: usize,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_index(&self) -> usize {
        self.index
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }

    async fn send(&self, peer: usize, message: PeerMessage) -> Result<()> {
        self.inner
            .deliver(self.index, peer, TransportEvent::Message(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::message::Origin;
    use uuid::Uuid;

    fn heartbeat(from: usize, step: u64) -> PeerMessage {
        PeerMessage::Heartbeat {
            origin: Origin {
                worker: from,
                fingerprint: 1,
                incarnation: Uuid::nil(),
            },
            step,
        }
    }

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let (mesh, mut receivers) = LocalMesh::new(3);
        let t0 = mesh.transport(0).unwrap();

        t0.send(2, heartbeat(0, 1)).await.unwrap();
        assert_eq!(
            receivers[2].recv().await,
            Some(TransportEvent::Message(heartbeat(0, 1)))
        );

        t0.broadcast(heartbeat(0, 2)).await.unwrap();
        assert!(receivers[1].try_recv().is_ok());
        assert!(receivers[2].try_recv().is_ok());
        // nothing sent to self
        assert!(receivers[0].try_recv().is_err());

        assert!(t0.send(3, heartbeat(0, 3)).await.is_err());
        assert!(mesh.transport(3).is_err());
    }

    #[tokio::test]
    async fn test_silence_drops_both_directions() {
        let (mesh, mut receivers) = LocalMesh::new(2);
        let t0 = mesh.transport(0).unwrap();
        let t1 = mesh.transport(1).unwrap();

        mesh.silence(1);
        assert!(mesh.is_silenced(1));
        t0.send(1, heartbeat(0, 1)).await.unwrap();
        t1.send(0, heartbeat(1, 1)).await.unwrap();
        assert!(receivers[0].try_recv().is_err());
        assert!(receivers[1].try_recv().is_err());

        mesh.restore(1);
        t1.send(0, heartbeat(1, 2)).await.unwrap();
        assert!(receivers[0].try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_receiver() {
        let (mesh, mut receivers) = LocalMesh::new(2);
        let t0 = mesh.transport(0).unwrap();

        mesh.silence(1);
        let mut fresh = mesh.reconnect(1).unwrap();
        assert!(!mesh.is_silenced(1));

        // the old receiver is closed once its sender is replaced
        assert!(receivers[1].recv().await.is_none());

        t0.send(1, heartbeat(0, 5)).await.unwrap();
        assert_eq!(fresh.recv().await, Some(TransportEvent::Message(heartbeat(0, 5))));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_peers() {
        let (mesh, mut receivers) = LocalMesh::new(3);
        mesh.disconnect(2);

        for r in receivers.iter_mut().take(2) {
            assert_eq!(
                r.recv().await,
                Some(TransportEvent::Disconnected {
                    peer: 2,
                    incarnation: None
                })
            );
        }
        assert!(mesh.is_silenced(2));
    }
}
