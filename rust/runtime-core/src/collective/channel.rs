// rust/runtime-core/src/collective/channel.rs

//! Per-step gradient all-reduce across the cluster.
//!
//! Every worker broadcasts its contribution to every peer and reduces
//! locally once all contributions for the step are in, so no worker acts
//! as a relay. Reduction happens in ascending worker order on every worker,
//! which makes the aggregates bit-identical.
//!
//! Contributions carry a timeline counter. A worker moves to a new timeline
//! every time it resynchronizes from a checkpoint, and a contribution is
//! only ever reduced together with contributions from the same timeline.
//! Seeing a peer on a newer timeline makes this worker resynchronize too;
//! contributions from older timelines are dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::message::{Contribution, Origin, PeerMessage};
use super::reduce::ReduceOp;
use super::round::{CollectiveRound, RoundPhase};
use super::transport::Transport;
use crate::config::CollectiveConfig;
use crate::error::{Result, RuntimeError};
use crate::monitor::ClusterHealth;
use crate::state::Gradients;

pub struct CollectiveChannel {
    transport: Arc<dyn Transport>,
    origin: Origin,
    worker_count: usize,
    inbox: mpsc::UnboundedReceiver<Contribution>,
    health: watch::Receiver<ClusterHealth>,
    op: ReduceOp,
    timeout: Duration,
    rounds: BTreeMap<u64, CollectiveRound>,
    /// This worker's own contribution to the most recently completed step.
    last_completed: Option<(u64, Gradients)>,
    timeline: u64,
    /// Set when a peer's newer timeline was adopted; the next reset keeps
    /// it instead of starting another one.
    adopted: bool,
}

impl CollectiveChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        origin: Origin,
        inbox: mpsc::UnboundedReceiver<Contribution>,
        health: watch::Receiver<ClusterHealth>,
        config: &CollectiveConfig,
    ) -> Self {
        let worker_count = transport.worker_count();
        Self {
            transport,
            origin,
            worker_count,
            inbox,
            health,
            op: config.reduce_op,
            timeout: config.timeout(),
            rounds: BTreeMap::new(),
            last_completed: None,
            timeline: 0,
            adopted: false,
        }
    }

    pub fn reduce_op(&self) -> ReduceOp {
        self.op
    }

    pub fn timeline(&self) -> u64 {
        self.timeline
    }

    /// Phase of the round for `step`, if one is tracked.
    pub fn round_phase(&self, step: u64) -> Option<RoundPhase> {
        self.rounds.get(&step).map(CollectiveRound::phase)
    }

    /// Contributes `value` for `step` and waits for the aggregate.
    ///
    /// Calling again for the same step after a timeout re-sends the value
    /// recorded by the first call; the new `value` is ignored.
    ///
    /// # Errors
    ///
    /// * `Timeout` when not every worker contributed in time. The round
    ///   stays open so the call can be retried.
    /// * `PeerLost` when the failure monitor reports a lost peer. The round
    ///   is aborted.
    /// * `StepSkew` when a peer contributes for a step this worker cannot
    ///   reconcile, or from a newer timeline. The caller must resume from
    ///   the latest checkpoint and call [`reset`](Self::reset).
    pub async fn contribute(&mut self, step: u64, value: Gradients) -> Result<Gradients> {
        let local = self.origin.worker;
        let worker_count = self.worker_count;

        let round = self
            .rounds
            .entry(step)
            .or_insert_with(|| CollectiveRound::new(step, worker_count));
        if matches!(round.phase(), RoundPhase::Aborted | RoundPhase::Closed) {
            *round = CollectiveRound::new(step, worker_count);
        }
        if !round.contribute(local, value) {
            tracing::debug!(step, "Re-sending the original contribution for a retried step");
        }
        let outgoing = round.contribution(local).cloned().unwrap_or_default();

        if self.round_complete(step) {
            return self.finish(step);
        }

        self.check_health(step)?;
        self.transport
            .broadcast(PeerMessage::Contribution {
                origin: self.origin,
                timeline: self.timeline,
                step,
                gradients: outgoing,
            })
            .await?;

        let deadline = Instant::now() + self.timeout;
        let mut health_open = true;

        loop {
            if self.round_complete(step) {
                return self.finish(step);
            }

            tokio::select! {
                received = self.inbox.recv() => match received {
                    Some(contribution) => self.accept(step, contribution).await?,
                    None => {
                        return Err(RuntimeError::transport("collective inbox closed"));
                    }
                },
                changed = self.health.changed(), if health_open => {
                    if changed.is_err() {
                        health_open = false;
                    } else {
                        self.check_health(step)?;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let missing = self
                        .rounds
                        .get(&step)
                        .map(CollectiveRound::missing)
                        .unwrap_or_default();
                    tracing::warn!(
                        step,
                        ?missing,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Collective round timed out"
                    );
                    return Err(RuntimeError::Timeout { step, missing });
                }
            }
        }
    }

    /// Drops all round state before resuming at `step` and returns the
    /// timeline the channel continues on.
    ///
    /// Moves to a fresh timeline, unless a peer's newer timeline was adopted
    /// since the last reset. Queued contributions survive only if they are
    /// for `step` or later and come from the current timeline.
    pub fn reset(&mut self, step: u64) -> u64 {
        if std::mem::take(&mut self.adopted) {
            self.rounds.retain(|s, _| *s >= step);
        } else {
            self.timeline += 1;
            self.rounds.clear();
        }
        self.last_completed = None;
        self.health.borrow_and_update();

        let mut kept = 0usize;
        let mut dropped = 0usize;
        while let Ok(contribution) = self.inbox.try_recv() {
            if !self.is_peer(contribution.from) || contribution.timeline < self.timeline {
                dropped += 1;
                continue;
            }
            if contribution.timeline > self.timeline {
                // the peer resynchronized from the same checkpoint already
                self.timeline = contribution.timeline;
                self.rounds.clear();
            }
            if contribution.step >= step {
                self.record(contribution);
                kept += 1;
            } else {
                dropped += 1;
            }
        }
        tracing::debug!(step, timeline = self.timeline, kept, dropped, "Collective channel reset");
        self.timeline
    }

    fn record(&mut self, contribution: Contribution) -> bool {
        let worker_count = self.worker_count;
        self.rounds
            .entry(contribution.step)
            .or_insert_with(|| CollectiveRound::new(contribution.step, worker_count))
            .contribute(contribution.from, contribution.gradients)
    }

    fn is_peer(&self, worker: usize) -> bool {
        worker < self.worker_count && worker != self.origin.worker
    }

    fn round_complete(&self, step: u64) -> bool {
        self.rounds.get(&step).map_or(false, CollectiveRound::is_complete)
    }

    fn finish(&mut self, step: u64) -> Result<Gradients> {
        let local = self.origin.worker;
        let round = self
            .rounds
            .get_mut(&step)
            .ok_or_else(|| RuntimeError::collective(format!("no round for step {step}")))?;
        let own = round.contribution(local).cloned().unwrap_or_default();
        let aggregate = round.take_aggregate(self.op)?;

        self.last_completed = Some((step, own));
        self.rounds.retain(|s, _| *s > step);
        Ok(aggregate)
    }

    fn check_health(&mut self, step: u64) -> Result<()> {
        let lost = self.health.borrow_and_update().first_lost();
        match lost {
            Some(peer) => {
                if let Some(round) = self.rounds.get_mut(&step) {
                    round.abort();
                }
                tracing::warn!(step, peer, "Aborting collective round: peer lost");
                Err(RuntimeError::PeerLost { peer, step })
            }
            None => Ok(()),
        }
    }

    async fn accept(&mut self, step: u64, contribution: Contribution) -> Result<()> {
        let from = contribution.from;
        let peer_step = contribution.step;

        if !self.is_peer(from) {
            tracing::warn!(from, step = peer_step, "Ignoring contribution with an invalid sender");
            return Ok(());
        }

        if contribution.timeline < self.timeline {
            tracing::debug!(
                from,
                step = peer_step,
                timeline = contribution.timeline,
                local_timeline = self.timeline,
                "Dropping contribution from an abandoned timeline"
            );
            // show the peer where the cluster is so it resynchronizes
            let own = self
                .rounds
                .get(&step)
                .and_then(|round| round.contribution(self.origin.worker))
                .cloned();
            if let Some(gradients) = own {
                let message = PeerMessage::Contribution {
                    origin: self.origin,
                    timeline: self.timeline,
                    step,
                    gradients,
                };
                return self.transport.send(from, message).await;
            }
            return Ok(());
        }

        if contribution.timeline > self.timeline {
            tracing::warn!(
                peer = from,
                peer_step,
                timeline = contribution.timeline,
                local_timeline = self.timeline,
                "Peer resynchronized; following it"
            );
            self.timeline = contribution.timeline;
            self.adopted = true;
            self.rounds.clear();
            self.last_completed = None;
            self.record(contribution);
            return Err(RuntimeError::StepSkew {
                local_step: step,
                peer: from,
                peer_step,
            });
        }

        if peer_step == step || peer_step == step + 1 {
            if !self.record(contribution) {
                tracing::debug!(from, step = peer_step, "Ignoring duplicate contribution");
            } else if peer_step != step {
                tracing::debug!(from, step = peer_step, "Buffered contribution for the next step");
            }
            return Ok(());
        }

        if peer_step + 1 == step {
            if let Some((completed, own)) = &self.last_completed {
                if *completed == peer_step {
                    tracing::debug!(peer = from, step = peer_step, "Peer is retrying the previous step; re-sending");
                    let message = PeerMessage::Contribution {
                        origin: self.origin,
                        timeline: self.timeline,
                        step: peer_step,
                        gradients: own.clone(),
                    };
                    return self.transport.send(from, message).await;
                }
            }
        }

        tracing::warn!(local_step = step, peer = from, peer_step, "Step skew detected");
        Err(RuntimeError::StepSkew {
            local_step: step,
            peer: from,
            peer_step,
        })
    }
}
