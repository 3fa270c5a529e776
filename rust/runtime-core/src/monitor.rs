// rust/runtime-core/src/monitor.rs

//! Peer liveness tracking.
//!
//! Every inbound message is evidence that its sender is alive. Peers that
//! stay silent longer than the peer timeout, or whose connection drops,
//! are marked lost and the change is published on a watch channel. The
//! collective channel and the coordinator subscribe to it.
//!
//! Membership is static: a lost peer is expected to come back at the same
//! index, possibly as a new process (a new incarnation).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cluster::ClusterDescriptor;
use crate::collective::{Contribution, EventReceiver, Origin, PeerMessage, Transport, TransportEvent};
use crate::config::MonitorConfig;
use crate::error::{Result, RuntimeError};
use crate::shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Never heard from.
    Pending,
    Live,
    Lost,
}

/// Snapshot of what the monitor knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer: usize,
    pub state: PeerState,
    pub last_seen: Option<Instant>,
    pub last_seen_time: Option<DateTime<Utc>>,
    pub incarnation: Option<Uuid>,
    pub last_step: Option<u64>,
}

/// Liveness of every peer, published on each change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterHealth {
    pub live: BTreeSet<usize>,
    pub lost: BTreeSet<usize>,
    pub pending: BTreeSet<usize>,
}

impl ClusterHealth {
    pub fn all_live(&self) -> bool {
        self.lost.is_empty() && self.pending.is_empty()
    }

    /// Lowest lost peer, if any.
    pub fn first_lost(&self) -> Option<usize> {
        self.lost.iter().next().copied()
    }

    /// Peers that are not live, ascending.
    pub fn unavailable(&self) -> Vec<usize> {
        self.lost.union(&self.pending).copied().collect()
    }
}

#[derive(Debug, Clone)]
struct PeerRecord {
    state: PeerState,
    last_seen: Option<Instant>,
    last_seen_time: Option<DateTime<Utc>>,
    incarnation: Option<Uuid>,
    last_step: Option<u64>,
}

impl PeerRecord {
    fn pending() -> Self {
        Self {
            state: PeerState::Pending,
            last_seen: None,
            last_seen_time: None,
            incarnation: None,
            last_step: None,
        }
    }

    fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.map_or(false, |seen| seen.elapsed() > timeout)
    }
}

pub struct FailureMonitor {
    descriptor: Arc<ClusterDescriptor>,
    origin: Origin,
    peer_timeout: Duration,
    peers: Mutex<Vec<PeerRecord>>,
    health: watch::Sender<ClusterHealth>,
    local_step: Arc<AtomicU64>,
}

impl FailureMonitor {
    /// Creates a monitor with every peer pending. `incarnation` identifies
    /// this process in outgoing messages.
    pub fn new(descriptor: Arc<ClusterDescriptor>, config: &MonitorConfig, incarnation: Uuid) -> Self {
        let origin = Origin {
            worker: descriptor.local_index(),
            fingerprint: descriptor.fingerprint(),
            incarnation,
        };
        let peers = vec![PeerRecord::pending(); descriptor.worker_count()];
        let health = ClusterHealth {
            pending: descriptor.peers().collect(),
            ..Default::default()
        };
        let (health, _) = watch::channel(health);

        Self {
            descriptor,
            origin,
            peer_timeout: config.peer_timeout(),
            peers: Mutex::new(peers),
            health,
            local_step: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn descriptor(&self) -> &Arc<ClusterDescriptor> {
        &self.descriptor
    }

    /// Records that a message from `origin` arrived. Returns false when the
    /// message is not from a member of this cluster.
    pub fn observe(&self, origin: &Origin, step: u64) -> bool {
        let peer = origin.worker;
        if peer >= self.descriptor.worker_count() || peer == self.origin.worker {
            tracing::warn!(peer, "Ignoring message with an invalid sender index");
            return false;
        }
        if origin.fingerprint != self.origin.fingerprint {
            tracing::warn!(
                peer,
                expected = format!("{:016x}", self.origin.fingerprint),
                got = format!("{:016x}", origin.fingerprint),
                "Rejecting peer from a different cluster"
            );
            return false;
        }

        let mut peers = self.peers.lock();
        let record = &mut peers[peer];

        if record.incarnation != Some(origin.incarnation) {
            if let Some(previous) = record.incarnation {
                tracing::info!(
                    peer,
                    previous = %previous,
                    incarnation = %origin.incarnation,
                    step,
                    "Peer rejoined as a new process"
                );
            }
            record.incarnation = Some(origin.incarnation);
        }
        match record.state {
            PeerState::Lost => tracing::info!(peer, step, "Peer is live again"),
            PeerState::Pending => tracing::debug!(peer, step, "Peer is live"),
            PeerState::Live => {}
        }

        record.state = PeerState::Live;
        record.last_seen = Some(Instant::now());
        record.last_seen_time = Some(Utc::now());
        record.last_step = Some(step);
        self.publish(&peers);
        true
    }

    /// Marks `peer` lost after its connection dropped. When `incarnation`
    /// is given and no longer matches the peer's current process, the event
    /// is stale and ignored.
    pub fn mark_lost(&self, peer: usize, incarnation: Option<Uuid>) {
        let mut peers = self.peers.lock();
        let Some(record) = peers.get_mut(peer) else {
            return;
        };
        if peer == self.origin.worker {
            return;
        }
        if incarnation.is_some() && incarnation != record.incarnation {
            tracing::debug!(peer, "Ignoring disconnect of a previous incarnation");
            return;
        }
        if record.state != PeerState::Live {
            return;
        }

        record.state = PeerState::Lost;
        tracing::warn!(peer, last_step = ?record.last_step, "Peer lost: connection closed");
        self.publish(&peers);
    }

    /// Marks live peers that have been silent longer than the peer timeout
    /// as lost. Returns the newly lost peers.
    pub fn sweep(&self) -> Vec<usize> {
        let mut peers = self.peers.lock();
        let mut newly_lost = Vec::new();

        for (peer, record) in peers.iter_mut().enumerate() {
            if record.state == PeerState::Live && record.is_timed_out(self.peer_timeout) {
                record.state = PeerState::Lost;
                tracing::warn!(
                    peer,
                    timeout_ms = self.peer_timeout.as_millis() as u64,
                    last_step = ?record.last_step,
                    "Peer lost: heartbeat timeout"
                );
                newly_lost.push(peer);
            }
        }

        if !newly_lost.is_empty() {
            self.publish(&peers);
        }
        newly_lost
    }

    fn publish(&self, peers: &[PeerRecord]) {
        let local = self.origin.worker;
        let mut health = ClusterHealth::default();
        for (peer, record) in peers.iter().enumerate().filter(|(p, _)| *p != local) {
            let set = match record.state {
                PeerState::Pending => &mut health.pending,
                PeerState::Live => &mut health.live,
                PeerState::Lost => &mut health.lost,
            };
            set.insert(peer);
        }
        self.health.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterHealth> {
        self.health.subscribe()
    }

    pub fn health(&self) -> ClusterHealth {
        self.health.borrow().clone()
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        let local = self.origin.worker;
        self.peers
            .lock()
            .iter()
            .enumerate()
            .filter(|(peer, _)| *peer != local)
            .map(|(peer, record)| PeerStatus {
                peer,
                state: record.state,
                last_seen: record.last_seen,
                last_seen_time: record.last_seen_time,
                incarnation: record.incarnation,
                last_step: record.last_step,
            })
            .collect()
    }

    /// Waits until every peer is live.
    ///
    /// # Errors
    ///
    /// `ClusterUnavailable` when `max_wait` elapses first.
    pub async fn wait_all_live(&self, max_wait: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        let started = Instant::now();

        let all_live = tokio::time::timeout(max_wait, async {
            loop {
                if rx.borrow_and_update().all_live() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match all_live {
            Ok(true) => Ok(()),
            _ => Err(RuntimeError::ClusterUnavailable {
                waited_ms: started.elapsed().as_millis() as u64,
                unavailable: self.health().unavailable(),
            }),
        }
    }

    pub fn set_local_step(&self, step: u64) {
        self.local_step.store(step, Ordering::Relaxed);
    }

    pub fn local_step(&self) -> u64 {
        self.local_step.load(Ordering::Relaxed)
    }

    /// Shared counter the transport reads when it sends a hello.
    pub fn step_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.local_step)
    }
}

/// Background task broadcasting heartbeats while the worker is active.
pub struct HeartbeatTask {
    monitor: Arc<FailureMonitor>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl HeartbeatTask {
    pub fn new(
        monitor: Arc<FailureMonitor>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            monitor,
            transport,
            interval,
            shutdown,
        }
    }

    /// Sends a hello, then a heartbeat every interval until shutdown.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut announced = false;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let origin = self.monitor.origin();
                    let step = self.monitor.local_step();
                    let message = if announced {
                        PeerMessage::Heartbeat { origin, step }
                    } else {
                        announced = true;
                        PeerMessage::Hello { origin, step }
                    };
                    if let Err(e) = self.transport.broadcast(message).await {
                        tracing::warn!("Heartbeat failed: {}", e);
                    }
                }
                _ = shutdown::requested(&mut self.shutdown) => break,
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Periodically sweeps for silent peers.
pub fn spawn_sweeper(
    monitor: Arc<FailureMonitor>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    monitor.sweep();
                }
                _ = shutdown::requested(&mut shutdown_rx) => break,
            }
        }
    })
}

/// Routes transport events: every message feeds the monitor, contributions
/// from cluster members go on to the collective inbox, and disconnects
/// mark the peer lost.
pub fn spawn_router(
    mut events: EventReceiver,
    monitor: Arc<FailureMonitor>,
    inbox: mpsc::UnboundedSender<Contribution>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown::requested(&mut shutdown_rx) => break,
            };

            match event {
                TransportEvent::Message(message) => {
                    if !monitor.observe(message.origin(), message.step()) {
                        continue;
                    }
                    if let Some(contribution) = Contribution::from_message(message) {
                        if inbox.send(contribution).is_err() {
                            break;
                        }
                    }
                }
                TransportEvent::Disconnected { peer, incarnation } => {
                    monitor.mark_lost(peer, incarnation);
                }
            }
        }
        tracing::debug!(worker = monitor.origin().worker, "Transport event router stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalMesh;
    use crate::state::Gradients;

    fn descriptor(n: usize, index: usize) -> Arc<ClusterDescriptor> {
        let workers = (0..n).map(|i| format!("127.0.0.1:{}", 7000 + i)).collect();
        Arc::new(ClusterDescriptor::new(workers, index).unwrap())
    }

    fn config(peer_timeout_ms: u64) -> MonitorConfig {
        MonitorConfig {
            heartbeat_interval_ms: 10,
            peer_timeout_ms,
            max_pause_ms: 1000,
        }
    }

    fn origin_of(d: &ClusterDescriptor, worker: usize, incarnation: Uuid) -> Origin {
        Origin {
            worker,
            fingerprint: d.fingerprint(),
            incarnation,
        }
    }

    #[test]
    fn test_peers_start_pending() {
        let d = descriptor(3, 1);
        let monitor = FailureMonitor::new(d, &config(100), Uuid::new_v4());
        let health = monitor.health();
        assert_eq!(health.pending, BTreeSet::from([0, 2]));
        assert!(!health.all_live());
        assert_eq!(health.unavailable(), vec![0, 2]);
        assert_eq!(monitor.status().len(), 2);
    }

    #[test]
    fn test_single_worker_is_always_live() {
        let monitor = FailureMonitor::new(descriptor(1, 0), &config(100), Uuid::new_v4());
        assert!(monitor.health().all_live());
    }

    #[test]
    fn test_observe_and_fingerprint_check() {
        let d = descriptor(2, 0);
        let monitor = FailureMonitor::new(Arc::clone(&d), &config(100), Uuid::new_v4());
        let peer = origin_of(&d, 1, Uuid::new_v4());

        let foreign = Origin {
            fingerprint: d.fingerprint() ^ 1,
            ..peer
        };
        assert!(!monitor.observe(&foreign, 0));
        assert!(!monitor.health().all_live());

        assert!(monitor.observe(&peer, 4));
        assert!(monitor.health().all_live());
        let status = &monitor.status()[0];
        assert_eq!(status.state, PeerState::Live);
        assert_eq!(status.last_step, Some(4));
        assert_eq!(status.incarnation, Some(peer.incarnation));

        // own index is never a peer
        assert!(!monitor.observe(&origin_of(&d, 0, Uuid::new_v4()), 0));
    }

    #[test]
    fn test_sweep_marks_silent_peers_lost() {
        let d = descriptor(2, 0);
        let monitor = FailureMonitor::new(Arc::clone(&d), &config(20), Uuid::new_v4());
        monitor.observe(&origin_of(&d, 1, Uuid::new_v4()), 0);

        assert!(monitor.sweep().is_empty());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(monitor.sweep(), vec![1]);
        assert_eq!(monitor.health().first_lost(), Some(1));
        // already lost
        assert!(monitor.sweep().is_empty());
    }

    #[test]
    fn test_stale_disconnect_is_ignored() {
        let d = descriptor(2, 0);
        let monitor = FailureMonitor::new(Arc::clone(&d), &config(1000), Uuid::new_v4());
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();

        monitor.observe(&origin_of(&d, 1, old), 3);
        monitor.observe(&origin_of(&d, 1, new), 0);

        monitor.mark_lost(1, Some(old));
        assert!(monitor.health().all_live());

        monitor.mark_lost(1, Some(new));
        assert_eq!(monitor.health().lost, BTreeSet::from([1]));

        // rejoin
        monitor.observe(&origin_of(&d, 1, new), 0);
        assert!(monitor.health().all_live());
    }

    #[tokio::test]
    async fn test_wait_all_live() {
        let d = descriptor(2, 0);
        let monitor = Arc::new(FailureMonitor::new(Arc::clone(&d), &config(1000), Uuid::new_v4()));

        let err = monitor.wait_all_live(Duration::from_millis(20)).await.unwrap_err();
        match err {
            RuntimeError::ClusterUnavailable { unavailable, .. } => assert_eq!(unavailable, vec![1]),
            other => panic!("unexpected error: {other}"),
        }

        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.wait_all_live(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.observe(&origin_of(&d, 1, Uuid::new_v4()), 0);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_background_tasks_over_local_mesh() {
        let d0 = descriptor(2, 0);
        let d1 = Arc::new(d0.with_local_index(1).unwrap());
        let (mesh, mut receivers) = LocalMesh::new(2);
        let rx1 = receivers.pop().unwrap();
        let rx0 = receivers.pop().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let m0 = Arc::new(FailureMonitor::new(d0, &config(200), Uuid::new_v4()));
        let m1 = Arc::new(FailureMonitor::new(d1, &config(200), Uuid::new_v4()));
        let (inbox0, mut contributions0) = mpsc::unbounded_channel();
        let (inbox1, _contributions1) = mpsc::unbounded_channel();

        let t0: Arc<dyn Transport> = mesh.transport(0).unwrap();
        let t1: Arc<dyn Transport> = mesh.transport(1).unwrap();

        let mut tasks = vec![
            spawn_router(rx0, Arc::clone(&m0), inbox0, shutdown_rx.clone()),
            spawn_router(rx1, Arc::clone(&m1), inbox1, shutdown_rx.clone()),
            spawn_sweeper(Arc::clone(&m0), Duration::from_millis(10), shutdown_rx.clone()),
        ];
        tasks.push(
            HeartbeatTask::new(Arc::clone(&m0), Arc::clone(&t0), Duration::from_millis(10), shutdown_rx.clone())
                .spawn(),
        );
        tasks.push(
            HeartbeatTask::new(Arc::clone(&m1), Arc::clone(&t1), Duration::from_millis(10), shutdown_rx.clone())
                .spawn(),
        );

        m0.wait_all_live(Duration::from_secs(5)).await.unwrap();
        m1.wait_all_live(Duration::from_secs(5)).await.unwrap();

        t1.send(
            0,
            PeerMessage::Contribution {
                origin: m1.origin(),
                timeline: 1,
                step: 2,
                gradients: Gradients::new(),
            },
        )
        .await
        .unwrap();
        let contribution = tokio::time::timeout(Duration::from_secs(5), contributions0.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contribution.from, 1);
        assert_eq!(contribution.step, 2);

        // a silenced peer stops heartbeating and is swept
        let mut health = m0.subscribe();
        mesh.silence(1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !health.borrow_and_update().lost.contains(&1) {
                health.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
