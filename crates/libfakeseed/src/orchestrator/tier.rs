use std::{collections::HashSet, sync::Arc};

use futures::future::join_all;
use libfakeseed_core::spawn_utils::spawn;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, debug_span, trace};
use tracker_comms::AnnounceEvent;
use url::Url;

use crate::{
    tracker::{AnnounceHistory, MAX_RETRY_DELAY},
    trackers::{Tier, TierKind},
};

use super::TorrentAnnouncer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierState {
    /// At least one tracker answered during the last round.
    Alive,
    /// Every tracker of the tier failed.
    Dead,
}

#[derive(Clone, Copy, Debug)]
pub struct TierReport {
    /// Position of the tier in the orchestrator.
    pub tier: usize,
    /// Which run of the tier loop produced the report.
    pub generation: u64,
    pub state: TierState,
}

/// The tier travels back to whoever stops the loop.
type StopTier = oneshot::Sender<Tier>;

pub struct TierLoopHandle {
    stop_tx: oneshot::Sender<StopTier>,
}

impl TierLoopHandle {
    /// Stops the loop, cancelling any announce in flight. `None` if the loop is gone.
    pub async fn stop(self) -> Option<Tier> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.stop_tx.send(ack_tx).ok()?;
        ack_rx.await.ok()
    }
}

#[cfg(test)]
impl TierLoopHandle {
    /// A handle no loop listens to. Keep the receiver alive to make `stop` hang.
    pub(crate) fn detached() -> (Self, oneshot::Receiver<oneshot::Sender<Tier>>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        (Self { stop_tx }, stop_rx)
    }
}

pub(crate) fn start_tier_loop(
    tier: Tier,
    position: usize,
    generation: u64,
    event: AnnounceEvent,
    announcer: Arc<dyn TorrentAnnouncer>,
    reports: mpsc::UnboundedSender<TierReport>,
) -> TierLoopHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let span = debug_span!("tier", tier = tier.index(), generation);
    spawn(
        span,
        run_tier_loop(tier, position, generation, event, announcer, reports, stop_rx),
    );
    TierLoopHandle { stop_tx }
}

/// Records every answer on its tracker. Failed trackers are added to `failed` and moved to
/// the end of the tier. Returns whether any tracker answered.
fn apply_results(
    tier: &mut Tier,
    event: AnnounceEvent,
    results: Vec<(Url, anyhow::Result<tracker_comms::AnnounceResponse>)>,
    failed: &mut HashSet<Url>,
) -> bool {
    let now = Instant::now();
    let mut any_success = false;
    for (url, result) in results {
        let Some(tracker) = tier.tracker_mut(&url) else {
            continue;
        };
        match result {
            Ok(r) => {
                any_success = true;
                tracker.announce_succeeded(
                    event,
                    AnnounceHistory::success(now, r.effective_interval(), r.seeders, r.leechers),
                );
            }
            Err(e) => {
                let interval = tracker.last_known_interval();
                tracker.announce_failed(AnnounceHistory::failure(now, interval, format!("{e:#}")));
                debug!(%url, fails = tracker.consecutive_fails(), next_in = ?(tracker.next_announce() - now), "announce failed: {e:#}");
                tier.deprioritize(&url);
                failed.insert(url);
            }
        }
    }
    any_success
}

/// Sleeps until `wake_at`. Errors with the stop request if it comes first.
async fn sleep_or_stop(
    stop_rx: &mut oneshot::Receiver<StopTier>,
    wake_at: Instant,
) -> Result<(), Option<StopTier>> {
    tokio::select! {
        ack = stop_rx => Err(ack.ok()),
        _ = tokio::time::sleep_until(wake_at) => Ok(()),
    }
}

async fn run_tier_loop(
    mut tier: Tier,
    position: usize,
    generation: u64,
    mut event: AnnounceEvent,
    announcer: Arc<dyn TorrentAnnouncer>,
    reports: mpsc::UnboundedSender<TierReport>,
    mut stop_rx: oneshot::Receiver<StopTier>,
) -> anyhow::Result<()> {
    let report = |state| {
        let _ = reports.send(TierReport {
            tier: position,
            generation,
            state,
        });
    };

    // Trackers that failed in this run since the last success. Failures from earlier runs
    // don't count.
    let mut failed: HashSet<Url> = HashSet::new();

    loop {
        let now = Instant::now();
        let mut ready = tier.ready_to_announce(now);
        if ready.is_empty() {
            let wake_at = tier.next_announce().unwrap_or(now + MAX_RETRY_DELAY);
            trace!(sleep = ?(wake_at - now), "nothing to announce yet");
            if let Err(ack) = sleep_or_stop(&mut stop_rx, wake_at).await {
                if let Some(ack) = ack {
                    let _ = ack.send(tier);
                }
                return Ok(());
            }
            continue;
        }

        if tier.kind() == TierKind::FallbackTrackers {
            ready.truncate(1);
        }
        for url in ready.iter() {
            if let Some(t) = tier.tracker_mut(url) {
                t.start_announce();
            }
        }

        let round = join_all(ready.iter().map(|url| {
            let announcer = &announcer;
            async move { (url.clone(), announcer.announce(url, event).await) }
        }));

        let results = tokio::select! {
            ack = &mut stop_rx => {
                tier.abort_announces();
                if let Ok(ack) = ack {
                    let _ = ack.send(tier);
                }
                return Ok(());
            }
            results = round => results,
        };

        if apply_results(&mut tier, event, results, &mut failed) {
            failed.clear();
            if event == AnnounceEvent::Started {
                event = AnnounceEvent::None;
            }
            report(TierState::Alive);
        } else if tier.trackers().iter().all(|t| failed.contains(t.url())) {
            failed.clear();
            report(TierState::Dead);
            // Quiet until the first tracker's backoff expires, or until we're stopped.
            let now = Instant::now();
            let wake_at = tier.next_announce().unwrap_or(now + MAX_RETRY_DELAY);
            debug!(retry_in = ?(wake_at - now), "tier dead");
            if let Err(ack) = sleep_or_stop(&mut stop_rx, wake_at).await {
                if let Some(ack) = ack {
                    let _ = ack.send(tier);
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::AnnouncePolicy, tests::test_util::ScriptedAnnouncer, trackers::TrackerPool};
    use libfakeseed_core::{Id20, TorrentMeta};

    fn tier(urls: &[&str], all_in_tier: bool) -> Tier {
        let mut meta = TorrentMeta::new(Id20::new([1; 20]));
        meta.announce_list = vec![urls.iter().map(|s| s.to_string()).collect()];
        let policy = AnnouncePolicy {
            announce_to_all_trackers_in_tier: all_in_tier,
            ..Default::default()
        };
        TrackerPool::build(&meta, &policy, Instant::now())
            .unwrap()
            .into_tiers()
            .remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_tier_walks_trackers_then_dies() {
        let announcer = Arc::new(ScriptedAnnouncer::new());
        announcer.fail("http://a/");
        announcer.fail("http://b/");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_tier_loop(
            tier(&["http://a/", "http://b/"], false),
            0,
            1,
            AnnounceEvent::Started,
            announcer.clone(),
            tx,
        );

        let report = rx.recv().await.unwrap();
        assert_eq!(report.state, TierState::Dead);
        let calls = announcer.calls();
        assert_eq!(
            calls.iter().map(|c| c.url.as_str()).collect::<Vec<_>>(),
            vec!["http://a/", "http://b/"]
        );

        // Nothing more is announced until the backoff expires.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(announcer.calls().len(), 2);

        let tier = handle.stop().await.unwrap();
        assert!(tier.trackers().iter().all(|t| !t.is_announcing()));
        assert!(tier.trackers().iter().all(|t| t.consecutive_fails() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revisited_tier_tries_every_tracker_again() {
        let announcer = Arc::new(ScriptedAnnouncer::new());
        announcer.fail("http://a/");
        announcer.fail("http://b/");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_tier_loop(
            tier(&["http://a/", "http://b/"], false),
            0,
            1,
            AnnounceEvent::Started,
            announcer.clone(),
            tx.clone(),
        );
        assert_eq!(rx.recv().await.unwrap().state, TierState::Dead);
        let tier = handle.stop().await.unwrap();

        // Both trackers carry a failure into the next run.
        announcer.succeed("http://b/", 1, 1, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(20)).await;
        let handle = start_tier_loop(tier, 0, 2, AnnounceEvent::None, announcer.clone(), tx);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.generation, 2);
        assert_eq!(report.state, TierState::Alive);
        assert_eq!(
            announcer
                .calls()
                .iter()
                .map(|c| c.url.as_str())
                .collect::<Vec<_>>(),
            vec!["http://a/", "http://b/", "http://a/", "http://b/"]
        );
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_trackers_tier_downgrades_event() {
        let announcer = Arc::new(ScriptedAnnouncer::new());
        announcer.succeed("http://a/", 1, 2, Duration::from_secs(60));
        announcer.fail("http://b/");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_tier_loop(
            tier(&["http://a/", "http://b/"], true),
            3,
            1,
            AnnounceEvent::Started,
            announcer.clone(),
            tx,
        );

        let report = rx.recv().await.unwrap();
        assert_eq!(report.state, TierState::Alive);
        assert_eq!(report.tier, 3);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let a_calls: Vec<_> = announcer
            .calls()
            .into_iter()
            .filter(|c| c.url.as_str() == "http://a/")
            .map(|c| c.event)
            .collect();
        assert_eq!(a_calls, vec![AnnounceEvent::Started, AnnounceEvent::None]);

        let tier = handle.stop().await.unwrap();
        assert_eq!(tier.started_trackers().len(), 1);
    }
}
