use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use libfakeseed_core::{Id20, spawn_utils::spawn};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, rngs::StdRng};
use tokio::{
    sync::oneshot,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, debug_span, info, trace, warn};

use crate::{
    config::BandwidthConfig,
    events::{EventBus, SeedEvent},
    peers::Swarm,
    stats::TorrentStats,
};

/// How attractive a swarm is to fake uploading to. Zero when either side of the swarm is
/// empty: nobody to upload to, or nobody else uploading.
pub fn claimer_weight(swarm: Swarm) -> f64 {
    if swarm.seeders == 0 || swarm.leechers == 0 {
        return 0.;
    }
    let seeders = swarm.seeders as f64;
    let leechers = swarm.leechers as f64;
    let leech_ratio = leechers / (seeders + leechers);
    leech_ratio * 100. * seeders * leech_ratio * (leechers / seeders)
}

struct WeightedClaimer {
    stats: Arc<TorrentStats>,
    weight: f64,
}

/// The torrents bandwidth is split between, with a running total of their weights.
#[derive(Default)]
pub struct ClaimerPool {
    claimers: HashMap<Id20, WeightedClaimer>,
    total_weight: f64,
}

impl ClaimerPool {
    fn subtract(&mut self, weight: f64) {
        self.total_weight = (self.total_weight - weight).max(0.);
        if self.claimers.is_empty() {
            self.total_weight = 0.;
        }
    }

    /// Returns the new weight if it changed.
    pub fn add_or_update(
        &mut self,
        info_hash: Id20,
        stats: Arc<TorrentStats>,
        swarm: Swarm,
    ) -> Option<f64> {
        let weight = claimer_weight(swarm);
        let old = self
            .claimers
            .insert(info_hash, WeightedClaimer { stats, weight })
            .map(|c| c.weight);
        if let Some(old) = old {
            self.subtract(old);
        }
        self.total_weight += weight;
        if old == Some(weight) {
            None
        } else {
            Some(weight)
        }
    }

    pub fn release(&mut self, info_hash: &Id20) -> bool {
        match self.claimers.remove(info_hash) {
            Some(c) => {
                self.subtract(c.weight);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.claimers.clear();
        self.total_weight = 0.;
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn weight(&self, info_hash: &Id20) -> Option<f64> {
        self.claimers.get(info_hash).map(|c| c.weight)
    }

    pub fn len(&self) -> usize {
        self.claimers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimers.is_empty()
    }

    /// Credits every claimer its share of `bytes`. Returns the number of bytes handed out.
    fn dispatch(&self, bytes: f64) -> u64 {
        if self.total_weight <= 0. {
            return 0;
        }
        let mut dispatched = 0u64;
        for (info_hash, claimer) in self.claimers.iter() {
            let share = (bytes * claimer.weight / self.total_weight) as i64;
            trace!(?info_hash, share, "crediting upload");
            claimer.stats.add_uploaded(share);
            dispatched = dispatched.saturating_add(share.max(0) as u64);
        }
        dispatched
    }
}

struct DispatcherInner {
    config: BandwidthConfig,
    pool: RwLock<ClaimerPool>,
    current_bps: AtomicU64,
    rng: Mutex<StdRng>,
    events: EventBus,
}

impl DispatcherInner {
    fn refresh_bandwidth(&self) {
        let bps = self
            .rng
            .lock()
            .random_range(self.config.min_upload_rate..=self.config.max_upload_rate);
        self.current_bps.store(bps, Ordering::Relaxed);
        info!(bytes_per_second = bps, "new global upload rate");
        self.events.emit(SeedEvent::GlobalBandwidthChanged {
            bytes_per_second: bps,
        });
    }

    fn dispatch(&self, elapsed: Duration) {
        let pool = self.pool.read();
        if pool.total_weight() <= 0. {
            trace!("no claimer with a positive weight, skipping");
            return;
        }
        let bytes = self.current_bps.load(Ordering::Relaxed) as f64 * elapsed.as_secs_f64();
        let dispatched = pool.dispatch(bytes);
        trace!(dispatched, claimers = pool.len(), "dispatched upload");
    }

    async fn run(self: Arc<Self>, mut stop_rx: oneshot::Receiver<oneshot::Sender<()>>) -> anyhow::Result<()> {
        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let tick_every = self.config.seed_increment_interval;
        let mut tick = tokio::time::interval_at(Instant::now() + tick_every, tick_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ack = &mut stop_rx => {
                    if let Ok(ack) = ack {
                        let _ = ack.send(());
                    }
                    return Ok(());
                }
                _ = refresh.tick() => self.refresh_bandwidth(),
                _ = tick.tick() => self.dispatch(tick_every),
            }
        }
    }
}

/// Hands out a random global upload rate to the registered torrents, proportionally to
/// their swarm weight.
pub struct BandwidthDispatcher {
    inner: Arc<DispatcherInner>,
    stop_tx: Mutex<Option<oneshot::Sender<oneshot::Sender<()>>>>,
}

impl BandwidthDispatcher {
    pub fn new(config: BandwidthConfig, rng: StdRng, events: EventBus) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                pool: Default::default(),
                current_bps: AtomicU64::new(0),
                rng: Mutex::new(rng),
                events,
            }),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut g = self.stop_tx.lock();
        if g.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        *g = Some(stop_tx);
        spawn(
            debug_span!("bandwidth_dispatcher"),
            self.inner.clone().run(stop_rx),
        );
    }

    /// Stops the dispatch loop and forgets every claimer. No tick runs once this returns.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().take();
        if let Some(stop_tx) = stop_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if stop_tx.send(ack_tx).is_ok() && ack_rx.await.is_err() {
                warn!("bandwidth dispatcher died before acknowledging stop");
            }
            debug!("bandwidth dispatcher stopped");
        }
        self.inner.pool.write().clear();
        self.inner.current_bps.store(0, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.lock().is_some()
    }

    pub fn add_or_update(&self, info_hash: Id20, stats: Arc<TorrentStats>, swarm: Swarm) {
        let changed = self.inner.pool.write().add_or_update(info_hash, stats, swarm);
        if let Some(weight) = changed {
            debug!(?info_hash, ?swarm, weight, "claimer weight changed");
            self.inner
                .events
                .emit(SeedEvent::WeightChanged { info_hash, weight });
        }
    }

    pub fn release(&self, info_hash: &Id20) {
        if self.inner.pool.write().release(info_hash) {
            debug!(?info_hash, "released claimer");
        }
    }

    /// Global rate in bytes per second, 0 until started.
    pub fn current_bandwidth(&self) -> u64 {
        self.inner.current_bps.load(Ordering::Relaxed)
    }

    pub fn weight(&self, info_hash: &Id20) -> Option<f64> {
        self.inner.pool.read().weight(info_hash)
    }

    pub fn total_weight(&self) -> f64 {
        self.inner.pool.read().total_weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn config(rate: u64, tick: Duration) -> BandwidthConfig {
        BandwidthConfig {
            min_upload_rate: rate,
            max_upload_rate: rate,
            refresh_interval: Duration::from_secs(20 * 60),
            seed_increment_interval: tick,
        }
    }

    fn dispatcher(config: BandwidthConfig) -> BandwidthDispatcher {
        BandwidthDispatcher::new(config, StdRng::seed_from_u64(42), EventBus::new())
    }

    #[test]
    fn test_weight() {
        assert_eq!(claimer_weight(Swarm::new(0, 100)), 0.);
        assert_eq!(claimer_weight(Swarm::new(100, 0)), 0.);
        assert_eq!(claimer_weight(Swarm::new(0, 0)), 0.);
        // leechRatio = 0.5: 0.5 * 100 * 10 * 0.5 * 1
        assert_eq!(claimer_weight(Swarm::new(10, 10)), 250.);
        assert_eq!(
            claimer_weight(Swarm::new(7, 13)),
            claimer_weight(Swarm::new(7, 13))
        );
        assert!(claimer_weight(Swarm::new(1, 100)) > claimer_weight(Swarm::new(100, 1)));
    }

    #[test]
    fn test_pool_total_tracks_weights() {
        let mut pool = ClaimerPool::default();
        let a = Id20::new([1; 20]);
        let b = Id20::new([2; 20]);
        let stats = Arc::new(TorrentStats::default());

        assert_eq!(
            pool.add_or_update(a, stats.clone(), Swarm::new(10, 10)),
            Some(250.)
        );
        assert_eq!(pool.add_or_update(a, stats.clone(), Swarm::new(10, 10)), None);
        pool.add_or_update(b, stats.clone(), Swarm::new(10, 10));
        assert_eq!(pool.total_weight(), 500.);

        pool.add_or_update(a, stats.clone(), Swarm::new(0, 10));
        assert_eq!(pool.total_weight(), 250.);

        assert!(pool.release(&b));
        assert!(!pool.release(&b));
        assert_eq!(pool.total_weight(), 0.);
        assert!(!pool.release(&Id20::new([9; 20])));
        assert!(pool.total_weight() >= 0.);
    }

    #[test]
    fn test_equal_swarms_get_equal_credit() {
        let d = dispatcher(config(1000, Duration::from_secs(1)));
        d.inner.refresh_bandwidth();

        let a = Arc::new(TorrentStats::default());
        let b = Arc::new(TorrentStats::default());
        let c = Arc::new(TorrentStats::default());
        d.add_or_update(Id20::new([1; 20]), a.clone(), Swarm::new(5, 50));
        d.add_or_update(Id20::new([2; 20]), b.clone(), Swarm::new(5, 50));
        d.add_or_update(Id20::new([3; 20]), c.clone(), Swarm::new(0, 50));

        for _ in 0..10 {
            d.inner.dispatch(Duration::from_secs(1));
        }
        assert_eq!(a.uploaded(), 5000);
        assert_eq!(b.uploaded(), 5000);
        assert_eq!(c.uploaded(), 0);
    }

    #[test]
    fn test_zero_total_weight_skips() {
        let d = dispatcher(config(1000, Duration::from_secs(1)));
        d.inner.refresh_bandwidth();
        let a = Arc::new(TorrentStats::default());
        d.add_or_update(Id20::new([1; 20]), a.clone(), Swarm::new(0, 0));
        d.inner.dispatch(Duration::from_secs(1));
        assert_eq!(a.uploaded(), 0);
    }

    #[test]
    fn test_random_rate_in_bounds() {
        let d = dispatcher(BandwidthConfig {
            min_upload_rate: 100,
            max_upload_rate: 200,
            ..Default::default()
        });
        for _ in 0..100 {
            d.inner.refresh_bandwidth();
            let bps = d.current_bandwidth();
            assert!((100..=200).contains(&bps), "{bps}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_tick_credits_full_rate() {
        let d = dispatcher(config(10_000, Duration::from_secs(1)));
        let stats = Arc::new(TorrentStats::default());
        d.add_or_update(Id20::new([1; 20]), stats.clone(), Swarm::new(10, 100));
        d.start();
        d.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(d.current_bandwidth(), 10_000);
        assert_eq!(stats.uploaded(), 10_000);

        d.stop().await;
        assert!(!d.is_running());
        assert_eq!(d.total_weight(), 0.);
        assert_eq!(d.weight(&Id20::new([1; 20])), None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(stats.uploaded(), 10_000);
        d.stop().await;
    }
}
