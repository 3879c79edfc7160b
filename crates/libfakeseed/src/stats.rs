use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Contribution counters of one torrent, as reported to trackers.
///
/// Counters only move in one direction: uploaded/downloaded/corrupt grow, left shrinks
/// and stops at 0. Non-positive deltas are ignored.
#[derive(Default, Debug)]
pub struct TorrentStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
    corrupt: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub corrupt: u64,
}

fn saturating_fetch_add(counter: &AtomicU64, delta: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_add(delta))
    });
}

impl TorrentStats {
    pub fn new(left: u64) -> Self {
        Self {
            left: AtomicU64::new(left),
            ..Default::default()
        }
    }

    pub fn add_uploaded(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        saturating_fetch_add(&self.uploaded, bytes as u64);
    }

    pub fn add_downloaded(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let bytes = bytes as u64;
        saturating_fetch_add(&self.downloaded, bytes);
        let _ = self
            .left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn add_corrupt(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        saturating_fetch_add(&self.corrupt, bytes as u64);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uploaded: self.uploaded.load(Ordering::Acquire),
            downloaded: self.downloaded.load(Ordering::Acquire),
            left: self.left.load(Ordering::Acquire),
            corrupt: self.corrupt.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_deltas_ignored() {
        let stats = TorrentStats::new(100);
        stats.add_uploaded(10);
        stats.add_uploaded(-5);
        stats.add_uploaded(0);
        stats.add_downloaded(-1);
        stats.add_corrupt(-1);
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                uploaded: 10,
                downloaded: 0,
                left: 100,
                corrupt: 0
            }
        );
    }

    #[test]
    fn test_left_floors_at_zero() {
        let stats = TorrentStats::new(100);
        stats.add_downloaded(60);
        assert_eq!(stats.snapshot().left, 40);
        stats.add_downloaded(1000);
        let s = stats.snapshot();
        assert_eq!(s.left, 0);
        assert_eq!(s.downloaded, 1060);
    }

    #[test]
    fn test_uploaded_saturates() {
        let stats = TorrentStats::default();
        stats.add_uploaded(i64::MAX);
        stats.add_uploaded(i64::MAX);
        stats.add_uploaded(i64::MAX);
        assert_eq!(stats.uploaded(), u64::MAX);
    }
}
