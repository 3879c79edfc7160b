use std::{collections::VecDeque, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tracker_comms::AnnounceEvent;
use url::Url;

pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);
/// Percentage applied to `fails² × MIN_RETRY_DELAY`.
pub const BACKOFF_RATIO: u64 = 250;
pub const HISTORY_LEN: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisabledReason {
    ProtocolNotSupported,
    AnnounceListNotSupported,
}

impl std::fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisabledReason::ProtocolNotSupported => f.write_str("protocol-not-supported"),
            DisabledReason::AnnounceListNotSupported => f.write_str("announce-list-not-supported"),
        }
    }
}

/// Outcome of one announce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnounceHistory {
    /// When the announce completed.
    pub at: Instant,
    pub interval: Duration,
    pub seeders: u32,
    pub leechers: u32,
    pub error: Option<String>,
}

impl AnnounceHistory {
    pub fn success(at: Instant, interval: Duration, seeders: u32, leechers: u32) -> Self {
        Self {
            at,
            interval,
            seeders,
            leechers,
            error: None,
        }
    }

    pub fn failure(at: Instant, interval: Duration, error: String) -> Self {
        Self {
            at,
            interval,
            seeders: 0,
            leechers: 0,
            error: Some(error),
        }
    }
}

/// How long to wait after the `fails`-th consecutive failure.
///
/// `max(interval, min(MAX_RETRY_DELAY, MIN_RETRY_DELAY + fails² × MIN_RETRY_DELAY × BACKOFF_RATIO / 100))`
pub fn backoff_delay(fails: u32, interval: Duration) -> Duration {
    let min_ms = MIN_RETRY_DELAY.as_millis() as u64;
    let fails = fails as u64;
    let extra_ms = fails
        .saturating_mul(fails)
        .saturating_mul(min_ms)
        .saturating_mul(BACKOFF_RATIO)
        / 100;
    let backoff = Duration::from_millis(min_ms.saturating_add(extra_ms)).min(MAX_RETRY_DELAY);
    backoff.max(interval)
}

fn add_or_cap(at: Instant, delay: Duration) -> Instant {
    at.checked_add(delay).unwrap_or(at + MAX_RETRY_DELAY)
}

/// One announce endpoint of a torrent.
#[derive(Clone, Debug)]
pub struct Tracker {
    url: Url,
    tier: usize,
    disabled: Option<DisabledReason>,
    next_announce: Instant,
    consecutive_fails: u32,
    announcing: bool,
    started: bool,
    history: VecDeque<AnnounceHistory>,
}

impl Tracker {
    pub fn new(url: Url, tier: usize, now: Instant) -> Self {
        Self {
            url,
            tier,
            disabled: None,
            next_announce: now,
            consecutive_fails: 0,
            announcing: false,
            started: false,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn new_disabled(url: Url, tier: usize, reason: DisabledReason, now: Instant) -> Self {
        let mut t = Self::new(url, tier, now);
        t.disabled = Some(reason);
        t
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled.is_none()
    }

    pub fn disabled_reason(&self) -> Option<DisabledReason> {
        self.disabled
    }

    pub fn next_announce(&self) -> Instant {
        self.next_announce
    }

    pub fn consecutive_fails(&self) -> u32 {
        self.consecutive_fails
    }

    pub fn is_announcing(&self) -> bool {
        self.announcing
    }

    /// Whether a START announce to this tracker went through.
    pub fn has_sent_start(&self) -> bool {
        self.started
    }

    pub fn history(&self) -> impl Iterator<Item = &AnnounceHistory> {
        self.history.iter()
    }

    /// Interval of the latest successful announce still in history, zero if none.
    pub fn last_known_interval(&self) -> Duration {
        self.history
            .iter()
            .rev()
            .find(|h| h.error.is_none())
            .map(|h| h.interval)
            .unwrap_or_default()
    }

    pub fn can_announce(&self, now: Instant) -> bool {
        self.disabled.is_none() && !self.announcing && now >= self.next_announce
    }

    pub fn start_announce(&mut self) {
        self.announcing = true;
    }

    /// The announce was abandoned before completing. Scheduling is left untouched.
    pub fn abort_announce(&mut self) {
        self.announcing = false;
    }

    fn push_history(&mut self, h: AnnounceHistory) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(h);
    }

    pub fn announce_succeeded(&mut self, event: AnnounceEvent, h: AnnounceHistory) {
        self.consecutive_fails = 0;
        self.next_announce = add_or_cap(h.at, h.interval);
        self.announcing = false;
        if event == AnnounceEvent::Started {
            self.started = true;
        }
        self.push_history(h);
    }

    pub fn announce_failed(&mut self, h: AnnounceHistory) {
        self.consecutive_fails = self.consecutive_fails.saturating_add(1);
        let delay = backoff_delay(self.consecutive_fails, h.interval);
        self.next_announce = add_or_cap(h.at, delay);
        self.announcing = false;
        self.push_history(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_backoff_sequence() {
        let z = Duration::ZERO;
        assert_eq!(backoff_delay(1, z), Duration::from_millis(17_500));
        assert_eq!(backoff_delay(2, z), Duration::from_millis(55_000));
        assert_eq!(backoff_delay(3, z), Duration::from_millis(117_500));
        assert_eq!(backoff_delay(4, z), Duration::from_millis(205_000));
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let mut prev = Duration::ZERO;
        for fails in 0..200 {
            let d = backoff_delay(fails, Duration::ZERO);
            assert!(d >= prev, "fails={fails}");
            assert!(d <= MAX_RETRY_DELAY);
            prev = d;
        }
        assert_eq!(prev, MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(u32::MAX, Duration::ZERO), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_backoff_respects_interval() {
        let interval = Duration::from_secs(25 * 60);
        for fails in [1, 2, 5, 10, 20, 1000] {
            let d = backoff_delay(fails, interval);
            assert!(d >= interval);
            assert!(d <= MAX_RETRY_DELAY);
        }
        assert_eq!(backoff_delay(1, interval), interval);
        assert_eq!(backoff_delay(1000, interval), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_lifecycle() {
        let now = Instant::now();
        let mut t = Tracker::new(url("http://t/a"), 0, now);
        assert_eq!(t.next_announce(), now);
        assert!(t.can_announce(now));

        t.start_announce();
        assert!(!t.can_announce(now));

        t.announce_failed(AnnounceHistory::failure(now, Duration::ZERO, "boom".into()));
        assert_eq!(t.consecutive_fails(), 1);
        assert!(!t.is_announcing());
        assert!(t.next_announce() >= now + MIN_RETRY_DELAY);
        assert!(!t.can_announce(now + MIN_RETRY_DELAY));
        assert!(t.can_announce(now + Duration::from_millis(17_500)));

        let later = now + Duration::from_secs(20);
        t.start_announce();
        t.announce_succeeded(
            AnnounceEvent::Started,
            AnnounceHistory::success(later, Duration::from_secs(1800), 3, 4),
        );
        assert_eq!(t.consecutive_fails(), 0);
        assert!(t.has_sent_start());
        assert_eq!(t.next_announce(), later + Duration::from_secs(1800));
        assert_eq!(t.last_known_interval(), Duration::from_secs(1800));
    }

    #[test]
    fn test_history_is_bounded() {
        let now = Instant::now();
        let mut t = Tracker::new(url("udp://t:1337"), 0, now);
        for i in 0..(HISTORY_LEN as u64 + 3) {
            t.announce_succeeded(
                AnnounceEvent::None,
                AnnounceHistory::success(now, Duration::from_secs(i), 0, 0),
            );
        }
        assert_eq!(t.history().count(), HISTORY_LEN);
        assert_eq!(
            t.history().next().unwrap().interval,
            Duration::from_secs(3)
        );
        assert!(!t.has_sent_start());
    }

    #[test]
    fn test_disabled_never_announces() {
        let now = Instant::now();
        let t = Tracker::new_disabled(
            url("wss://t/a"),
            1,
            DisabledReason::ProtocolNotSupported,
            now,
        );
        assert!(!t.can_announce(now + Duration::from_secs(100_000)));
        assert_eq!(
            t.disabled_reason().unwrap().to_string(),
            "protocol-not-supported"
        );
    }
}
