use std::{collections::HashMap, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

/// Interval assumed for a tracker that failed to answer.
pub const ERROR_INTERVAL: Duration = Duration::from_secs(1800);

/// Swarm size as seen by trackers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Swarm {
    pub seeders: u32,
    pub leechers: u32,
}

impl Swarm {
    pub fn new(seeders: u32, leechers: u32) -> Self {
        Self { seeders, leechers }
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    swarm: Swarm,
    expires_at: Instant,
}

/// Trackers of the same torrent often disagree on the swarm size. The elector keeps the
/// latest answer of every tracker host and elects the one reporting the most seeders.
///
/// An answer expires after twice the interval its tracker asked for.
#[derive(Debug, Default)]
pub struct PeersElector {
    candidates: HashMap<String, Candidate>,
    elected: Swarm,
}

impl PeersElector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a tracker answer and re-elects. Returns true if the elected swarm changed.
    pub fn add_peer(
        &mut self,
        host: &str,
        seeders: u32,
        leechers: u32,
        interval: Duration,
        now: Instant,
    ) -> bool {
        let ttl = interval.saturating_mul(2);
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or(now + ERROR_INTERVAL.saturating_mul(2));
        self.candidates.insert(
            host.to_owned(),
            Candidate {
                swarm: Swarm::new(seeders, leechers),
                expires_at,
            },
        );
        self.elect(now)
    }

    /// A failed announce counts as an empty swarm until the tracker answers again.
    pub fn add_error(&mut self, host: &str, now: Instant) -> bool {
        self.add_peer(host, 0, 0, ERROR_INTERVAL, now)
    }

    /// Purges expired answers and re-elects. Returns true if the elected swarm changed.
    pub fn elect(&mut self, now: Instant) -> bool {
        self.candidates.retain(|_, c| c.expires_at >= now);
        let elected = self
            .candidates
            .iter()
            .max_by(|(lhost, l), (rhost, r)| {
                l.swarm
                    .seeders
                    .cmp(&r.swarm.seeders)
                    .then(l.swarm.leechers.cmp(&r.swarm.leechers))
                    // max_by keeps the greatest, so the smaller host has to compare greater.
                    .then(rhost.cmp(lhost))
            })
            .map(|(_, c)| c.swarm)
            .unwrap_or_default();
        let changed = elected != self.elected;
        self.elected = elected;
        changed
    }

    pub fn elected(&self) -> Swarm {
        self.elected
    }

    pub fn reset(&mut self) {
        self.candidates.clear();
        self.elected = Swarm::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(1800);

    #[test]
    fn test_elects_most_seeders() {
        let now = Instant::now();
        let mut e = PeersElector::new();
        assert!(e.add_peer("a", 10, 100, INTERVAL, now));
        assert!(!e.add_peer("b", 0, 1_000_000, INTERVAL, now));
        assert_eq!(e.elected(), Swarm::new(10, 100));
    }

    #[test]
    fn test_empty_is_zero() {
        let mut e = PeersElector::new();
        assert!(!e.elect(Instant::now()));
        assert_eq!(e.elected(), Swarm::default());
    }

    #[test]
    fn test_readding_is_idempotent() {
        let now = Instant::now();
        let mut e = PeersElector::new();
        assert!(e.add_peer("a", 5, 5, INTERVAL, now));
        assert!(!e.add_peer("a", 5, 5, INTERVAL, now));
        assert!(!e.add_peer("a", 5, 5, INTERVAL, now + Duration::from_secs(1)));
        assert_eq!(e.elected(), Swarm::new(5, 5));
    }

    #[test]
    fn test_tie_break() {
        let now = Instant::now();
        let mut e = PeersElector::new();
        e.add_peer("z", 5, 1, INTERVAL, now);
        e.add_peer("y", 5, 3, INTERVAL, now);
        assert_eq!(e.elected(), Swarm::new(5, 3));

        e.add_peer("x", 5, 3, INTERVAL, now);
        assert_eq!(e.elected(), Swarm::new(5, 3));
    }

    #[test]
    fn test_expiry_and_errors() {
        let now = Instant::now();
        let mut e = PeersElector::new();
        e.add_peer("a", 10, 10, Duration::from_secs(60), now);
        e.add_peer("b", 2, 2, INTERVAL, now);
        assert_eq!(e.elected(), Swarm::new(10, 10));

        assert!(e.elect(now + Duration::from_secs(121)));
        assert_eq!(e.elected(), Swarm::new(2, 2));

        assert!(e.add_error("b", now + Duration::from_secs(122)));
        assert_eq!(e.elected(), Swarm::default());

        e.add_peer("c", 1, 1, INTERVAL, now);
        e.reset();
        assert_eq!(e.elected(), Swarm::default());
        assert!(!e.elect(now));
    }
}
