//! Announce orchestration for one torrent.
//!
//! Each tier runs in its own loop task owning the tier's trackers. The orchestrator task
//! decides which tier loops run: only one at a time with [`FallbackOrchestrator`], all of
//! them with [`AllOrchestrator`].

mod all;
mod fallback;
mod tier;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::join_all;
use libfakeseed_core::spawn_utils::spawn;
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tracing::{debug, debug_span, warn};
use tracker_comms::{AnnounceEvent, AnnounceResponse};
use url::Url;

use crate::trackers::{Tier, TrackerPool};

pub use all::AllOrchestrator;
pub use fallback::FallbackOrchestrator;
pub use tier::{TierReport, TierState};

/// Upper bound for the STOP announces sent on shutdown.
pub const STOP_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Announces on behalf of one torrent: the implementation knows what to tell the tracker.
#[async_trait]
pub trait TorrentAnnouncer: Send + Sync {
    async fn announce(
        &self,
        tracker: &Url,
        event: AnnounceEvent,
    ) -> anyhow::Result<AnnounceResponse>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Idle,
    /// The tier at this position is being announced to.
    Announcing { tier: usize },
    /// Tier `current` was left, `next` will be announced to once its delay elapses.
    WaitingForTier { current: usize, next: usize },
    AllTiers { tiers: usize, alive: usize, dead: usize },
    Stopped,
}

pub(crate) struct StopRequest {
    pub deadline: Instant,
    pub ack: oneshot::Sender<()>,
}

/// Either of the two ways to spread announces over tiers.
pub enum Orchestrator {
    Fallback(FallbackOrchestrator),
    All(AllOrchestrator),
}

impl Orchestrator {
    pub fn new(pool: TrackerPool) -> Self {
        let all_tiers = pool.announce_to_all_tiers();
        let tiers = pool.into_tiers();
        if all_tiers {
            Orchestrator::All(AllOrchestrator::new(tiers))
        } else {
            Orchestrator::Fallback(FallbackOrchestrator::new(tiers))
        }
    }

    pub fn tiers(&self) -> &[Tier] {
        match self {
            Orchestrator::Fallback(o) => o.tiers(),
            Orchestrator::All(o) => o.tiers(),
        }
    }

    pub fn start(self, announcer: Arc<dyn TorrentAnnouncer>) -> OrchestratorHandle {
        let (control_tx, control_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(OrchestratorStatus::Idle);
        match self {
            Orchestrator::Fallback(o) => {
                spawn(
                    debug_span!("fallback_orchestrator"),
                    o.run(announcer, control_rx, status_tx),
                );
            }
            Orchestrator::All(o) => {
                spawn(
                    debug_span!("all_orchestrator"),
                    o.run(announcer, control_rx, status_tx),
                );
            }
        }
        OrchestratorHandle {
            control_tx,
            status: status_rx,
        }
    }
}

pub struct OrchestratorHandle {
    control_tx: mpsc::Sender<StopRequest>,
    status: watch::Receiver<OrchestratorStatus>,
}

impl OrchestratorHandle {
    pub fn status(&self) -> OrchestratorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<OrchestratorStatus> {
        self.status.clone()
    }

    /// Stops every tier loop and sends STOP announces. Waits for the orchestrator to finish
    /// or for `deadline`, whichever comes first; cleanup goes on in the background either way.
    /// Stopping a stopped orchestrator returns immediately.
    pub async fn stop(&self, deadline: Instant) {
        let (ack, ack_rx) = oneshot::channel();
        if self
            .control_tx
            .send(StopRequest { deadline, ack })
            .await
            .is_err()
        {
            return;
        }
        if tokio::time::timeout_at(deadline, ack_rx).await.is_err() {
            warn!("timed out waiting for the orchestrator to stop");
        }
    }
}

/// Best-effort STOP to every given tracker, all bounded by one shared timeout.
pub(crate) async fn announce_stop(announcer: &Arc<dyn TorrentAnnouncer>, trackers: Vec<Url>) {
    if trackers.is_empty() {
        return;
    }
    let stops = join_all(trackers.iter().map(|url| async move {
        (url, announcer.announce(url, AnnounceEvent::Stopped).await)
    }));
    match tokio::time::timeout(STOP_ANNOUNCE_TIMEOUT, stops).await {
        Ok(results) => {
            for (url, result) in results {
                match result {
                    Ok(_) => debug!(%url, "sent STOP"),
                    Err(e) => warn!(%url, "error sending STOP: {e:#}"),
                }
            }
        }
        Err(_) => warn!(count = trackers.len(), "timed out sending STOP"),
    }
}
