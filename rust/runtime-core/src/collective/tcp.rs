// rust/runtime-core/src/collective/tcp.rs

//! TCP transport.
//!
//! Each worker listens on its own cluster address and keeps one outbound
//! connection per peer, owned by a writer task that reconnects with
//! exponential backoff. Inbound connections announce themselves with a
//! `Hello`; when an identified inbound connection closes, a `Disconnected`
//! event is emitted for that peer and incarnation.
//!
//! Messages queued while a link was broken are discarded on reconnect.
//! They would reach the peer late, by which time it may have resumed from
//! a checkpoint and would see them as step skew.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::message::{decode_body, encode_frame, frame_len, Origin, PeerMessage};
use super::transport::{EventReceiver, Transport, TransportEvent};
use crate::cluster::ClusterDescriptor;
use crate::error::{Result, RuntimeError};
use crate::retry::{retry_async, RetryConfig, RetryResult};
use crate::shutdown;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct TcpTransport {
    local_index: usize,
    worker_count: usize,
    local_addr: SocketAddr,
    writers: Vec<Option<mpsc::UnboundedSender<PeerMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Binds the local cluster address and starts the accept loop and one
    /// writer per peer.
    pub async fn bind(
        descriptor: Arc<ClusterDescriptor>,
        origin: Origin,
        step: Arc<AtomicU64>,
        retry: RetryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, EventReceiver)> {
        let address = descriptor.local_address().to_string();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            RuntimeError::transport_with_source(format!("failed to bind {address}"), e)
        })?;
        Self::from_listener(listener, descriptor, origin, step, retry, shutdown)
    }

    /// Same as [`bind`](Self::bind) with an already bound listener.
    pub fn from_listener(
        listener: TcpListener,
        descriptor: Arc<ClusterDescriptor>,
        origin: Origin,
        step: Arc<AtomicU64>,
        retry: RetryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, EventReceiver)> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::transport_with_source("listener has no local address", e))?;
        let local_index = descriptor.local_index();
        let worker_count = descriptor.worker_count();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(worker_count);
        tasks.push(tokio::spawn(accept_loop(
            listener,
            local_index,
            worker_count,
            events_tx,
            shutdown.clone(),
        )));

        let mut writers = Vec::with_capacity(worker_count);
        for peer in 0..worker_count {
            if peer == local_index {
                writers.push(None);
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let address = descriptor.address(peer).unwrap_or_default().to_string();
            let link = PeerLink {
                peer,
                address,
                origin,
                step: Arc::clone(&step),
                retry: retry.clone(),
            };
            tasks.push(tokio::spawn(link.run(rx, shutdown.clone())));
            writers.push(Some(tx));
        }

        tracing::info!(
            worker = local_index,
            address = %local_addr,
            peers = worker_count - 1,
            "TCP transport listening"
        );

        let transport = Arc::new(Self {
            local_index,
            worker_count,
            local_addr,
            writers,
            tasks: Mutex::new(tasks),
        });
        Ok((transport, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops every background task of this transport.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_index(&self) -> usize {
        self.local_index
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }

    async fn send(&self, peer: usize, message: PeerMessage) -> Result<()> {
        let writer = self
            .writers
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                RuntimeError::transport(format!(
                    "no link from worker {} to worker {peer}",
                    self.local_index
                ))
            })?;
        // The writer only stops on shutdown.
        let _ = writer.send(message);
        Ok(())
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<PeerMessage> {
    let mut prefix = [0u8; 4];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| RuntimeError::transport_with_source("failed to read frame length", e))?;
    let len = frame_len(prefix)?;
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| RuntimeError::transport_with_source("failed to read frame body", e))?;
    decode_body(&body)
}

async fn write_message(stream: &mut TcpStream, message: &PeerMessage) -> Result<()> {
    let frame = encode_frame(message)?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| RuntimeError::transport_with_source("failed to write frame", e))
}

async fn accept_loop(
    listener: TcpListener,
    local_index: usize,
    worker_count: usize,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(read_loop(
                        stream,
                        remote,
                        local_index,
                        worker_count,
                        events.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept peer connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            _ = shutdown::requested(&mut shutdown_rx) => break,
        }
    }
}

async fn read_loop(
    mut stream: TcpStream,
    remote: SocketAddr,
    local_index: usize,
    worker_count: usize,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut identified: Option<Origin> = None;

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stream) => frame,
            _ = shutdown::requested(&mut shutdown_rx) => return,
        };

        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(remote = %remote, error = %e, "Peer connection closed");
                break;
            }
        };

        let origin = *message.origin();
        if origin.worker >= worker_count || origin.worker == local_index {
            tracing::warn!(
                remote = %remote,
                claimed = origin.worker,
                "Dropping connection from a peer with an invalid worker index"
            );
            break;
        }
        match identified {
            None if matches!(message, PeerMessage::Hello { .. }) => identified = Some(origin),
            None => {
                tracing::warn!(remote = %remote, "First frame was not a hello; dropping connection");
                break;
            }
            Some(known) if known.worker != origin.worker || known.incarnation != origin.incarnation => {
                tracing::warn!(
                    remote = %remote,
                    expected = known.worker,
                    claimed = origin.worker,
                    "Peer identity changed mid-connection; dropping connection"
                );
                break;
            }
            Some(_) => {}
        }

        if events.send(TransportEvent::Message(message)).is_err() {
            return;
        }
    }

    if let Some(origin) = identified {
        let _ = events.send(TransportEvent::Disconnected {
            peer: origin.worker,
            incarnation: Some(origin.incarnation),
        });
    }
}

struct PeerLink {
    peer: usize,
    address: String,
    origin: Origin,
    step: Arc<AtomicU64>,
    retry: RetryConfig,
}

impl PeerLink {
    fn hello(&self) -> PeerMessage {
        PeerMessage::Hello {
            origin: self.origin,
            step: self.step.load(Ordering::Relaxed),
        }
    }

    async fn connect(&self) -> std::result::Result<TcpStream, std::io::Error> {
        retry_async(&self.retry, |attempt| {
            let address = self.address.clone();
            let peer = self.peer;
            async move {
                match TcpStream::connect(&address).await {
                    Ok(stream) => RetryResult::Ok(stream),
                    Err(e) => {
                        if attempt > 0 && attempt % 50 == 0 {
                            tracing::debug!(peer, address = %address, attempt, error = %e, "Still connecting to peer");
                        }
                        RetryResult::Retry(e)
                    }
                }
            }
        })
        .await
    }

    async fn run(
        self,
        mut outbox: mpsc::UnboundedReceiver<PeerMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut reconnecting = false;

        'connect: loop {
            let mut stream = tokio::select! {
                connected = self.connect() => match connected {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(peer = self.peer, address = %self.address, error = %e, "Giving up on peer link");
                        return;
                    }
                },
                _ = shutdown::requested(&mut shutdown_rx) => return,
            };
            let _ = stream.set_nodelay(true);

            if reconnecting {
                let mut dropped = 0usize;
                while outbox.try_recv().is_ok() {
                    dropped += 1;
                }
                tracing::info!(peer = self.peer, address = %self.address, dropped, "Reconnected to peer");
            } else {
                tracing::debug!(peer = self.peer, address = %self.address, "Connected to peer");
            }

            if let Err(e) = write_message(&mut stream, &self.hello()).await {
                tracing::debug!(peer = self.peer, error = %e, "Hello failed; reconnecting");
                reconnecting = true;
                continue 'connect;
            }

            loop {
                let message = tokio::select! {
                    message = outbox.recv() => match message {
                        Some(message) => message,
                        None => return,
                    },
                    _ = shutdown::requested(&mut shutdown_rx) => return,
                };

                let frame = match encode_frame(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(peer = self.peer, error = %e, "Dropping unencodable message");
                        continue;
                    }
                };
                if let Err(e) = stream.write_all(&frame).await {
                    tracing::warn!(
                        peer = self.peer,
                        address = %self.address,
                        kind = message.kind(),
                        error = %e,
                        "Lost link to peer; reconnecting"
                    );
                    reconnecting = true;
                    continue 'connect;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Gradients, Tensor};
    use uuid::Uuid;

    async fn cluster(n: usize) -> (Vec<TcpListener>, Vec<String>) {
        let mut listeners = Vec::new();
        let mut addresses = Vec::new();
        for _ in 0..n {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addresses.push(listener.local_addr().unwrap().to_string());
            listeners.push(listener);
        }
        (listeners, addresses)
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: None,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    async fn next_message(rx: &mut EventReceiver) -> PeerMessage {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event channel closed");
            if let TransportEvent::Message(message) = event {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_two_workers_exchange_messages() {
        let (listeners, addresses) = cluster(2).await;
        let (_tx, shutdown_rx) = watch::channel(false);

        let mut transports = Vec::new();
        let mut receivers = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let descriptor = Arc::new(ClusterDescriptor::new(addresses.clone(), i).unwrap());
            let origin = Origin {
                worker: i,
                fingerprint: descriptor.fingerprint(),
                incarnation: Uuid::new_v4(),
            };
            let (transport, rx) = TcpTransport::from_listener(
                listener,
                descriptor,
                origin,
                Arc::new(AtomicU64::new(0)),
                fast_retry(),
                shutdown_rx.clone(),
            )
            .unwrap();
            transports.push((transport, origin));
            receivers.push(rx);
        }

        // The first frame on every link is a hello.
        let hello = next_message(&mut receivers[1]).await;
        assert!(matches!(hello, PeerMessage::Hello { origin, .. } if origin.worker == 0));

        let mut gradients = Gradients::new();
        gradients.insert("w".to_string(), Tensor::vector(vec![0.5, 1.5]));
        let contribution = PeerMessage::Contribution {
            origin: transports[0].1,
            timeline: 1,
            step: 3,
            gradients,
        };
        transports[0].0.send(1, contribution.clone()).await.unwrap();

        loop {
            let message = next_message(&mut receivers[1]).await;
            if matches!(message, PeerMessage::Contribution { .. }) {
                assert_eq!(message, contribution);
                break;
            }
        }

        assert!(transports[0].0.send(0, contribution.clone()).await.is_err());
        assert!(transports[0].0.send(5, contribution).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_reported_when_peer_closes() {
        let (listeners, addresses) = cluster(2).await;
        let mut listeners = listeners.into_iter();
        let (_tx0, shutdown0) = watch::channel(false);
        let (tx1, shutdown1) = watch::channel(false);

        let d0 = Arc::new(ClusterDescriptor::new(addresses.clone(), 0).unwrap());
        let d1 = Arc::new(ClusterDescriptor::new(addresses, 1).unwrap());
        let o0 = Origin { worker: 0, fingerprint: d0.fingerprint(), incarnation: Uuid::new_v4() };
        let o1 = Origin { worker: 1, fingerprint: d1.fingerprint(), incarnation: Uuid::new_v4() };

        let (_t0, mut rx0) = TcpTransport::from_listener(
            listeners.next().unwrap(), d0, o0, Arc::new(AtomicU64::new(0)), fast_retry(), shutdown0,
        )
        .unwrap();
        let (t1, _rx1) = TcpTransport::from_listener(
            listeners.next().unwrap(), d1, o1, Arc::new(AtomicU64::new(0)), fast_retry(), shutdown1,
        )
        .unwrap();

        let hello = next_message(&mut rx0).await;
        assert_eq!(hello.origin().incarnation, o1.incarnation);

        tx1.send(true).unwrap();
        t1.close();
        drop(t1);

        let event = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx0.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, TransportEvent::Disconnected { .. }) {
                break event;
            }
        };
        assert_eq!(
            event,
            TransportEvent::Disconnected { peer: 1, incarnation: Some(o1.incarnation) }
        );
    }

    #[tokio::test]
    async fn test_non_hello_first_frame_is_rejected() {
        let (listeners, addresses) = cluster(2).await;
        let mut listeners = listeners.into_iter();
        let (_tx, shutdown_rx) = watch::channel(false);

        let d0 = Arc::new(ClusterDescriptor::new(addresses.clone(), 0).unwrap());
        let o0 = Origin { worker: 0, fingerprint: d0.fingerprint(), incarnation: Uuid::new_v4() };
        let (_t0, mut rx0) = TcpTransport::from_listener(
            listeners.next().unwrap(), d0, o0, Arc::new(AtomicU64::new(0)), fast_retry(), shutdown_rx,
        )
        .unwrap();

        // A raw client that skips the hello.
        let mut raw = TcpStream::connect(&addresses[0]).await.unwrap();
        let bogus = PeerMessage::Heartbeat {
            origin: Origin { worker: 1, fingerprint: 0, incarnation: Uuid::new_v4() },
            step: 0,
        };
        write_message(&mut raw, &bogus).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf)).await.unwrap();
        // connection closed by the server
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(rx0.try_recv().is_err());
    }
}
