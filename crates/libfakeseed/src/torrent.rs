use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use libfakeseed_core::{Id20, TorrentMeta, spawn_utils::spawn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tracing::{debug, debug_span, info, trace, warn};
use tracker_comms::{AnnounceEvent, AnnounceRequest, AnnounceResponse, Announcer};
use url::Url;

use crate::{
    Error,
    bandwidth::BandwidthDispatcher,
    config::ClientConfig,
    events::{EventBus, SeedEvent},
    orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorStatus, TorrentAnnouncer},
    peers::{PeersElector, Swarm},
    stats::{StatsSnapshot, TorrentStats},
    trackers::TrackerPool,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    Created,
    Seeding,
    Stopping,
    Stopped,
}

/// What a torrent borrows from its session to seed.
#[derive(Clone)]
pub struct SeedContext {
    pub announcer: Arc<dyn Announcer>,
    pub dispatcher: Arc<BandwidthDispatcher>,
    pub events: EventBus,
    pub client: ClientConfig,
    pub peer_id: Id20,
    pub key: u32,
    pub announce_timeout: Duration,
}

struct TorrentStopRequest {
    deadline: Instant,
    ack: oneshot::Sender<()>,
}

struct TorrentLocked {
    state: TorrentState,
    stop_tx: Option<mpsc::Sender<TorrentStopRequest>>,
    orchestrator_status: Option<watch::Receiver<OrchestratorStatus>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TorrentSummary {
    pub info_hash: Id20,
    pub name: String,
    pub state: TorrentState,
    pub stats: StatsSnapshot,
    pub swarm: Swarm,
    pub last_announced: Option<StatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<OrchestratorStatus>,
}

pub struct Torrent {
    meta: TorrentMeta,
    stats: Arc<TorrentStats>,
    elector: Mutex<PeersElector>,
    last_announced: Mutex<Option<StatsSnapshot>>,
    ctx: SeedContext,
    locked: RwLock<TorrentLocked>,
}

impl Torrent {
    pub fn new(meta: TorrentMeta, ctx: SeedContext) -> Arc<Self> {
        Arc::new(Self {
            meta,
            // We pretend to have every piece.
            stats: Arc::new(TorrentStats::new(0)),
            elector: Mutex::new(PeersElector::new()),
            last_announced: Mutex::new(None),
            ctx,
            locked: RwLock::new(TorrentLocked {
                state: TorrentState::Created,
                stop_tx: None,
                orchestrator_status: None,
            }),
        })
    }

    pub fn info_hash(&self) -> Id20 {
        self.meta.info_hash
    }

    pub fn meta(&self) -> &TorrentMeta {
        &self.meta
    }

    pub fn stats(&self) -> &Arc<TorrentStats> {
        &self.stats
    }

    pub fn state(&self) -> TorrentState {
        self.locked.read().state
    }

    pub fn swarm(&self) -> Swarm {
        self.elector.lock().elected()
    }

    pub fn summary(&self) -> TorrentSummary {
        let g = self.locked.read();
        TorrentSummary {
            info_hash: self.info_hash(),
            name: self.meta.display_name(),
            state: g.state,
            stats: self.stats.snapshot(),
            swarm: self.swarm(),
            last_announced: *self.last_announced.lock(),
            orchestrator: g.orchestrator_status.as_ref().map(|s| s.borrow().clone()),
        }
    }

    /// Builds the trackers and starts announcing. Does nothing unless the torrent is
    /// created or stopped.
    pub fn start_seeding(self: &Arc<Self>) -> Result<(), Error> {
        let mut g = self.locked.write();
        match g.state {
            TorrentState::Created | TorrentState::Stopped => {}
            TorrentState::Seeding | TorrentState::Stopping => {
                debug!(info_hash = ?self.info_hash(), state = ?g.state, "not starting");
                return Ok(());
            }
        }

        let pool = TrackerPool::build(
            &self.meta,
            &self.ctx.client.announce_policy,
            Instant::now(),
        )?;
        debug!(
            info_hash = ?self.info_hash(),
            in_use = ?pool.in_use().map(|t| t.url().as_str()).collect::<Vec<_>>(),
            "tracker pool built"
        );
        let orchestrator = Orchestrator::new(pool);

        self.ctx
            .dispatcher
            .add_or_update(self.info_hash(), self.stats.clone(), self.swarm());
        let handle = orchestrator.start(Arc::new(SeedAnnouncer {
            torrent: self.clone(),
        }));
        let (stop_tx, stop_rx) = mpsc::channel(1);
        g.orchestrator_status = Some(handle.subscribe_status());
        g.stop_tx = Some(stop_tx);
        g.state = TorrentState::Seeding;

        spawn(
            debug_span!(parent: None, "torrent", info_hash = ?self.info_hash()),
            self.clone().task_control(handle, stop_rx),
        );
        info!(name = %self.meta.display_name(), "started seeding");
        Ok(())
    }

    /// Stops announcing and withdraws from the bandwidth pool. Returns once cleanup is done
    /// or at `deadline`; cleanup still runs to completion in the background.
    pub async fn stop_seeding(&self, deadline: Instant) {
        let stop_tx = {
            let mut g = self.locked.write();
            if g.state != TorrentState::Seeding {
                return;
            }
            g.state = TorrentState::Stopping;
            g.stop_tx.take()
        };
        let Some(stop_tx) = stop_tx else {
            return;
        };
        let (ack, ack_rx) = oneshot::channel();
        if stop_tx
            .send(TorrentStopRequest { deadline, ack })
            .await
            .is_err()
        {
            warn!(info_hash = ?self.info_hash(), "torrent task is gone");
            return;
        }
        if tokio::time::timeout_at(deadline, ack_rx).await.is_err() {
            warn!(info_hash = ?self.info_hash(), "timed out stopping torrent");
        }
    }

    async fn task_control(
        self: Arc<Self>,
        orchestrator: OrchestratorHandle,
        mut stop_rx: mpsc::Receiver<TorrentStopRequest>,
    ) -> anyhow::Result<()> {
        let req = stop_rx.recv().await;
        let deadline = req
            .as_ref()
            .map(|r| r.deadline)
            .unwrap_or_else(Instant::now);
        orchestrator.stop(deadline).await;

        self.ctx.dispatcher.release(&self.info_hash());
        self.elector.lock().reset();
        {
            let mut g = self.locked.write();
            g.state = TorrentState::Stopped;
            g.stop_tx = None;
        }
        info!(name = %self.meta.display_name(), "stopped seeding");
        if let Some(req) = req {
            let _ = req.ack.send(());
        }
        Ok(())
    }

    fn announce_request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let stats = self.stats.snapshot();
        let client = &self.ctx.client;
        AnnounceRequest {
            info_hash: self.info_hash(),
            peer_id: self.ctx.peer_id,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            corrupt: stats.corrupt,
            event,
            key: self.ctx.key,
            num_want: if event == AnnounceEvent::Stopped {
                client.num_want_on_stop
            } else {
                client.num_want
            },
            port: client.port,
        }
    }

    fn on_swarm_answer(&self, tracker: &Url, result: &anyhow::Result<AnnounceResponse>) {
        let host = tracker.host_str().unwrap_or(tracker.as_str());
        let now = Instant::now();
        let (changed, swarm) = {
            let mut elector = self.elector.lock();
            let changed = match result {
                Ok(r) => elector.add_peer(host, r.seeders, r.leechers, r.effective_interval(), now),
                Err(_) => elector.add_error(host, now),
            };
            (changed, elector.elected())
        };
        if !changed {
            return;
        }
        debug!(?swarm, "elected swarm changed");
        self.ctx.events.emit(SeedEvent::SwarmChanged {
            info_hash: self.info_hash(),
            seeders: swarm.seeders,
            leechers: swarm.leechers,
        });
        if self.state() == TorrentState::Seeding {
            self.ctx
                .dispatcher
                .add_or_update(self.info_hash(), self.stats.clone(), swarm);
        }
    }
}

struct SeedAnnouncer {
    torrent: Arc<Torrent>,
}

#[async_trait]
impl TorrentAnnouncer for SeedAnnouncer {
    async fn announce(
        &self,
        tracker: &Url,
        event: AnnounceEvent,
    ) -> anyhow::Result<AnnounceResponse> {
        let t = &self.torrent;
        let info_hash = t.info_hash();
        let request = t.announce_request(event);
        trace!(%tracker, %event, uploaded = request.uploaded, "announcing");
        t.ctx.events.emit(SeedEvent::Announcing {
            info_hash,
            tracker: tracker.to_string(),
            event,
        });

        let result = t
            .ctx
            .announcer
            .announce(tracker, &request, t.ctx.announce_timeout)
            .await;

        if event != AnnounceEvent::Stopped {
            t.on_swarm_answer(tracker, &result);
        }

        match &result {
            Ok(r) => {
                if let Some(warning) = &r.warning_message {
                    warn!(%tracker, "tracker warning: {warning}");
                }
                *t.last_announced.lock() = Some(StatsSnapshot {
                    uploaded: request.uploaded,
                    downloaded: request.downloaded,
                    left: request.left,
                    corrupt: request.corrupt,
                });
                t.ctx.events.emit(SeedEvent::AnnounceSucceeded {
                    info_hash,
                    tracker: tracker.to_string(),
                    event,
                    interval_secs: r.effective_interval().as_secs(),
                    seeders: r.seeders,
                    leechers: r.leechers,
                });
            }
            Err(e) => {
                t.ctx.events.emit(SeedEvent::AnnounceFailed {
                    info_hash,
                    tracker: tracker.to_string(),
                    event,
                    error: format!("{e:#}"),
                });
            }
        }
        result
    }
}
