use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use futures::future::join_all;
use libfakeseed_core::{
    Id20, TorrentMeta,
    peer_id::{generate_azureus_style, generate_key},
};
use parking_lot::{Mutex, RwLock};
use rand::{SeedableRng, rngs::StdRng};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracker_comms::{Announcer, TrackerAnnouncer};

use crate::{
    Error,
    bandwidth::BandwidthDispatcher,
    config::SeedConfig,
    events::{EventBus, SeedEvent},
    torrent::{SeedContext, Torrent, TorrentSummary},
};

#[derive(Default)]
pub struct SessionOptions {
    pub config: SeedConfig,
    /// Defaults to announcing over HTTP(S) and UDP.
    pub announcer: Option<Arc<dyn Announcer>>,
    /// Seed for every random choice the session makes. Random if not set.
    pub rng_seed: Option<u64>,
}

pub enum AddTorrentResponse {
    AlreadyManaged(Arc<Torrent>),
    Added(Arc<Torrent>),
}

impl AddTorrentResponse {
    pub fn into_handle(self) -> Arc<Torrent> {
        match self {
            AddTorrentResponse::AlreadyManaged(t) | AddTorrentResponse::Added(t) => t,
        }
    }
}

#[derive(Default)]
struct SessionLocked {
    torrents: Vec<Arc<Torrent>>,
}

/// Owns every seeded torrent and the services they share.
pub struct Session {
    config: SeedConfig,
    events: EventBus,
    dispatcher: Arc<BandwidthDispatcher>,
    ctx: SeedContext,
    rng: Mutex<StdRng>,
    running: AtomicBool,
    locked: RwLock<SessionLocked>,
}

impl Session {
    pub fn new(opts: SessionOptions) -> anyhow::Result<Arc<Self>> {
        let config = opts.config;
        config.validate().context("invalid configuration")?;

        let mut rng = match opts.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let peer_id = generate_azureus_style(
            &mut rng,
            config.client.client_code_bytes()?,
            config.client.client_version,
        );
        let key = generate_key(&mut rng);
        debug!(?peer_id, key = %format!("{key:08X}"), "generated session identity");

        let announcer = match opts.announcer {
            Some(announcer) => announcer,
            None => {
                let client = reqwest::Client::builder()
                    .build()
                    .context("error building HTTP client")?;
                Arc::new(TrackerAnnouncer::new(client))
            }
        };

        let events = EventBus::new();
        let dispatcher = Arc::new(BandwidthDispatcher::new(
            config.bandwidth.clone(),
            StdRng::from_rng(&mut rng),
            events.clone(),
        ));
        let ctx = SeedContext {
            announcer,
            dispatcher: dispatcher.clone(),
            events: events.clone(),
            client: config.client.clone(),
            peer_id,
            key,
            announce_timeout: config.announce_timeout,
        };

        Ok(Arc::new(Self {
            config,
            events,
            dispatcher,
            ctx,
            rng: Mutex::new(rng),
            running: AtomicBool::new(false),
            locked: RwLock::new(Default::default()),
        }))
    }

    pub fn config(&self) -> &SeedConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn peer_id(&self) -> Id20 {
        self.ctx.peer_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current global upload rate in bytes per second.
    pub fn current_bandwidth(&self) -> u64 {
        self.dispatcher.current_bandwidth()
    }

    pub fn get(&self, info_hash: &Id20) -> Option<Arc<Torrent>> {
        self.locked
            .read()
            .torrents
            .iter()
            .find(|t| t.info_hash() == *info_hash)
            .cloned()
    }

    /// Adds a torrent, and starts seeding it if the session runs. Announce-list tiers are
    /// shuffled here, once.
    pub fn add_torrent(&self, mut meta: TorrentMeta) -> Result<AddTorrentResponse, Error> {
        let mut g = self.locked.write();
        if let Some(existing) = g.torrents.iter().find(|t| t.info_hash() == meta.info_hash) {
            debug!(info_hash = ?meta.info_hash, "torrent already managed");
            return Ok(AddTorrentResponse::AlreadyManaged(existing.clone()));
        }

        meta.shuffle_announce_list(&mut *self.rng.lock());
        let torrent = Torrent::new(meta, self.ctx.clone());
        if self.is_running() {
            torrent.start_seeding()?;
        }
        g.torrents.push(torrent.clone());
        drop(g);

        info!(name = %torrent.meta().display_name(), info_hash = ?torrent.info_hash(), "added torrent");
        self.events.emit(SeedEvent::TorrentAdded {
            info_hash: torrent.info_hash(),
            name: torrent.meta().display_name(),
        });
        Ok(AddTorrentResponse::Added(torrent))
    }

    pub async fn remove_torrent(&self, info_hash: &Id20) -> Result<(), Error> {
        let torrent = {
            let mut g = self.locked.write();
            let idx = g
                .torrents
                .iter()
                .position(|t| t.info_hash() == *info_hash)
                .ok_or(Error::TorrentNotFound(*info_hash))?;
            g.torrents.remove(idx)
        };
        torrent
            .stop_seeding(Instant::now() + self.config.stop_timeout)
            .await;
        info!(name = %torrent.meta().display_name(), "removed torrent");
        self.events.emit(SeedEvent::TorrentRemoved {
            info_hash: *info_hash,
        });
        Ok(())
    }

    /// Starts the bandwidth dispatcher and seeding every torrent. Torrents that can't be
    /// announced are logged and skipped.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.start();
        let torrents = self.locked.read().torrents.clone();
        for torrent in torrents {
            if let Err(e) = torrent.start_seeding() {
                warn!(name = %torrent.meta().display_name(), "can't seed torrent: {e:#}");
            }
        }
        info!("session started");
        self.events.emit(SeedEvent::SeedStarted);
    }

    /// Stops every torrent concurrently, all bounded by the configured stop timeout.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let deadline = Instant::now() + self.config.stop_timeout;
        let torrents = self.locked.read().torrents.clone();
        join_all(torrents.iter().map(|t| t.stop_seeding(deadline))).await;
        self.dispatcher.stop().await;
        info!("session stopped");
        self.events.emit(SeedEvent::SeedStopped);
    }

    pub fn torrents(&self) -> Vec<TorrentSummary> {
        self.locked
            .read()
            .torrents
            .iter()
            .map(|t| t.summary())
            .collect()
    }
}
