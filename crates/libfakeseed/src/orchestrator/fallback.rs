use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};
use tracker_comms::AnnounceEvent;

use crate::{tracker::MAX_RETRY_DELAY, trackers::Tier};

use super::{
    OrchestratorStatus, StopRequest, TorrentAnnouncer, announce_stop,
    tier::{TierLoopHandle, TierReport, TierState, start_tier_loop},
};

/// How long to wait before moving on from a tier whose loop can't be started.
const TIER_SETTLE_DELAY: Duration = Duration::from_secs(5);

enum Slot {
    Idle(Tier),
    Running(TierLoopHandle),
    /// The tier loop died and took the tier with it.
    Lost,
}

struct PendingTier {
    tier: usize,
    at: Instant,
}

/// Announces to one tier at a time. A dead tier hands over to the next one; once a tier
/// other than the first is alive, the first tier gets another chance after an interval.
pub struct FallbackOrchestrator {
    tiers: Vec<Tier>,
}

struct FallbackRun {
    slots: Vec<Slot>,
    active: usize,
    generation: u64,
    succeeded_once: bool,
    pending: Option<PendingTier>,
    announcer: Arc<dyn TorrentAnnouncer>,
    reports_tx: mpsc::UnboundedSender<TierReport>,
    status_tx: watch::Sender<OrchestratorStatus>,
}

impl FallbackOrchestrator {
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub(crate) async fn run(
        self,
        announcer: Arc<dyn TorrentAnnouncer>,
        mut control_rx: mpsc::Receiver<StopRequest>,
        status_tx: watch::Sender<OrchestratorStatus>,
    ) -> anyhow::Result<()> {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let mut run = FallbackRun {
            slots: self.tiers.into_iter().map(Slot::Idle).collect(),
            active: 0,
            generation: 0,
            succeeded_once: false,
            pending: None,
            announcer,
            reports_tx,
            status_tx,
        };
        if run.slots.is_empty() {
            anyhow::bail!("no tiers to announce to");
        }
        run.start_tier(0);

        loop {
            let pending_at = run.pending.as_ref().map(|p| p.at);
            tokio::select! {
                req = control_rx.recv() => {
                    let deadline = req
                        .as_ref()
                        .map(|r| r.deadline)
                        .unwrap_or_else(|| Instant::now() + super::STOP_ANNOUNCE_TIMEOUT);
                    run.shutdown(deadline).await;
                    if let Some(req) = req {
                        let _ = req.ack.send(());
                    }
                    return Ok(());
                }
                Some(report) = reports_rx.recv() => run.on_report(report).await,
                _ = tokio::time::sleep_until(pending_at.unwrap_or_else(Instant::now)), if pending_at.is_some() => {
                    if let Some(p) = run.pending.take() {
                        run.start_tier(p.tier);
                    }
                }
            }
        }
    }
}

impl FallbackRun {
    fn set_status(&self, status: OrchestratorStatus) {
        debug!(?status, "orchestrator status");
        let _ = self.status_tx.send(status);
    }

    fn start_tier(&mut self, pos: usize) {
        match std::mem::replace(&mut self.slots[pos], Slot::Lost) {
            Slot::Idle(tier) => {
                self.generation += 1;
                let event = if self.succeeded_once {
                    AnnounceEvent::None
                } else {
                    AnnounceEvent::Started
                };
                debug!(tier = tier.index(), position = pos, %event, "starting tier");
                self.slots[pos] = Slot::Running(start_tier_loop(
                    tier,
                    pos,
                    self.generation,
                    event,
                    self.announcer.clone(),
                    self.reports_tx.clone(),
                ));
                self.active = pos;
                self.set_status(OrchestratorStatus::Announcing { tier: pos });
            }
            running @ Slot::Running(_) => self.slots[pos] = running,
            Slot::Lost => {
                let next = (pos + 1) % self.slots.len();
                warn!(position = pos, next, "tier is gone, skipping it");
                self.active = pos;
                self.pending = Some(PendingTier {
                    tier: next,
                    at: Instant::now() + TIER_SETTLE_DELAY,
                });
                self.set_status(OrchestratorStatus::WaitingForTier { current: pos, next });
            }
        }
    }

    /// Stops the tier loop at `pos` and parks the tier. Returns its last known interval.
    async fn stop_tier(&mut self, pos: usize) -> Duration {
        match std::mem::replace(&mut self.slots[pos], Slot::Lost) {
            Slot::Running(handle) => match handle.stop().await {
                Some(tier) => {
                    let interval = tier.last_known_interval();
                    self.slots[pos] = Slot::Idle(tier);
                    interval
                }
                None => {
                    warn!(position = pos, "tier loop was already dead");
                    Duration::ZERO
                }
            },
            Slot::Idle(tier) => {
                let interval = tier.last_known_interval();
                self.slots[pos] = Slot::Idle(tier);
                interval
            }
            Slot::Lost => Duration::ZERO,
        }
    }

    async fn on_report(&mut self, report: TierReport) {
        if report.generation != self.generation || report.tier != self.active {
            return;
        }
        match report.state {
            TierState::Alive => {
                self.succeeded_once = true;
                if self.active == 0 {
                    return;
                }
                let current = self.active;
                let interval = self.stop_tier(current).await.min(MAX_RETRY_DELAY);
                info!(position = current, ?interval, "tier alive, going back to the first tier");
                self.pending = Some(PendingTier {
                    tier: 0,
                    at: Instant::now() + interval,
                });
                self.set_status(OrchestratorStatus::WaitingForTier { current, next: 0 });
            }
            TierState::Dead => {
                let current = self.active;
                let interval = self.stop_tier(current).await.min(MAX_RETRY_DELAY);
                let next = (current + 1) % self.slots.len();
                if next == 0 {
                    info!(position = current, ?interval, "every tier is dead, starting over");
                    self.pending = Some(PendingTier {
                        tier: 0,
                        at: Instant::now() + interval,
                    });
                    self.set_status(OrchestratorStatus::WaitingForTier { current, next });
                } else {
                    info!(position = current, next, "tier dead, moving on");
                    self.start_tier(next);
                }
            }
        }
    }

    async fn shutdown(&mut self, deadline: Instant) {
        self.pending = None;
        let active = self.active;
        if tokio::time::timeout_at(deadline, self.stop_tier(active))
            .await
            .is_err()
        {
            warn!(position = active, "timed out stopping tier loop");
        }
        let started = self
            .slots
            .iter()
            .filter_map(|s| match s {
                Slot::Idle(tier) => Some(tier.started_trackers()),
                _ => None,
            })
            .flatten()
            .collect();
        announce_stop(&self.announcer, started).await;
        self.set_status(OrchestratorStatus::Stopped);
    }
}
