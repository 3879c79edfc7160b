use std::sync::Arc;

use futures::future::join_all;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, warn};
use tracker_comms::AnnounceEvent;

use crate::trackers::Tier;

use super::{
    OrchestratorStatus, StopRequest, TorrentAnnouncer, announce_stop,
    tier::{TierLoopHandle, TierState, start_tier_loop},
};

/// Stops every loop, each bounded by `deadline`. Returns the tiers of the loops that
/// stopped in time.
async fn stop_tier_loops(handles: Vec<TierLoopHandle>, deadline: Instant) -> Vec<Tier> {
    let stopped = join_all(handles.into_iter().enumerate().map(|(pos, h)| async move {
        match tokio::time::timeout_at(deadline, h.stop()).await {
            Ok(tier) => tier,
            Err(_) => {
                warn!(position = pos, "timed out stopping tier loop");
                None
            }
        }
    }))
    .await;
    stopped.into_iter().flatten().collect()
}

/// Announces to every tier at once. Tiers live and die independently.
pub struct AllOrchestrator {
    tiers: Vec<Tier>,
}

impl AllOrchestrator {
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
        let tiers_count = self.tiers.len();
        let handles: Vec<_> = self
            .tiers
            .into_iter()
            .enumerate()
            .map(|(pos, tier)| {
                start_tier_loop(
                    tier,
                    pos,
                    1,
                    AnnounceEvent::Started,
                    announcer.clone(),
                    reports_tx.clone(),
                )
            })
            .collect();
        let mut states: Vec<Option<TierState>> = vec![None; tiers_count];
        let publish = |states: &[Option<TierState>]| {
            let count = |s| states.iter().filter(|st| **st == Some(s)).count();
            let _ = status_tx.send(OrchestratorStatus::AllTiers {
                tiers: tiers_count,
                alive: count(TierState::Alive),
                dead: count(TierState::Dead),
            });
        };
        publish(&states);

        let req = loop {
            tokio::select! {
                req = control_rx.recv() => break req,
                Some(report) = reports_rx.recv() => {
                    if states[report.tier] != Some(report.state) {
                        debug!(position = report.tier, state = ?report.state, "tier state changed");
                        states[report.tier] = Some(report.state);
                        publish(&states);
                    }
                }
            }
        };

        let deadline = req
            .as_ref()
            .map(|r| r.deadline)
            .unwrap_or_else(|| Instant::now() + super::STOP_ANNOUNCE_TIMEOUT);
        let tiers = stop_tier_loops(handles, deadline).await;
        let started = tiers.iter().flat_map(|t| t.started_trackers()).collect();
        announce_stop(&announcer, started).await;
        let _ = status_tx.send(OrchestratorStatus::Stopped);
        if let Some(req) = req {
            let _ = req.ack.send(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use libfakeseed_core::{Id20, TorrentMeta};

    use super::*;
    use crate::{
        config::AnnouncePolicy, tests::test_util::ScriptedAnnouncer, trackers::TrackerPool,
    };

    #[tokio::test(start_paused = true)]
    async fn test_stuck_loop_does_not_lose_other_tiers() {
        let announcer = Arc::new(ScriptedAnnouncer::new());
        announcer.succeed("http://a/", 1, 1, Duration::from_secs(1800));
        let mut meta = TorrentMeta::new(Id20::new([1; 20]));
        meta.announce_list = vec![vec!["http://a/".to_owned()]];
        let tier = TrackerPool::build(&meta, &AnnouncePolicy::default(), Instant::now())
            .unwrap()
            .into_tiers()
            .remove(0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let live = start_tier_loop(tier, 0, 1, AnnounceEvent::Started, announcer, tx);
        assert_eq!(rx.recv().await.unwrap().state, TierState::Alive);
        let (stuck, _keep_listening) = TierLoopHandle::detached();

        let started = Instant::now();
        let tiers = stop_tier_loops(vec![stuck, live], started + Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].started_trackers().len(), 1);
    }
}
