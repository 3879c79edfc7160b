use std::time::Duration;

use libfakeseed_core::TorrentMeta;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

use crate::{
    Error,
    config::AnnouncePolicy,
    tracker::{DisabledReason, Tracker},
};

fn parse_tracker_url(url: &str) -> Result<Url, Error> {
    Url::parse(url).map_err(|source| Error::MalformedTrackerUrl {
        url: url.to_owned(),
        source,
    })
}

fn protocol_supported(url: &Url, policy: &AnnouncePolicy) -> bool {
    match url.scheme() {
        "http" | "https" => policy.supports_http_announce,
        "udp" => policy.supports_udp_announce,
        _ => false,
    }
}

fn new_tracker(url: Url, tier: usize, policy: &AnnouncePolicy, now: Instant) -> Tracker {
    if protocol_supported(&url, policy) {
        Tracker::new(url, tier, now)
    } else {
        debug!(%url, "tracker protocol not supported");
        Tracker::new_disabled(url, tier, DisabledReason::ProtocolNotSupported, now)
    }
}

/// Indices of the trackers "in use" for the given policy. `trackers` must be sorted by tier.
pub fn select_in_use(trackers: &[Tracker], all_tiers: bool, all_trackers_in_tier: bool) -> Vec<usize> {
    let mut result = Vec::new();
    let mut last_tier: Option<usize> = None;
    for (idx, t) in trackers.iter().enumerate() {
        if !t.is_enabled() {
            continue;
        }
        let same_tier = last_tier == Some(t.tier());
        match (all_tiers, all_trackers_in_tier) {
            (false, false) => {
                result.push(idx);
                break;
            }
            (false, true) => {
                if last_tier.is_some() && !same_tier {
                    break;
                }
                result.push(idx);
            }
            (true, false) => {
                if !same_tier {
                    result.push(idx);
                }
            }
            (true, true) => result.push(idx),
        }
        last_tier = Some(t.tier());
    }
    result
}

/// Moves `trackers[idx]` behind every other tracker of its tier. Trackers of other tiers
/// keep their positions.
fn bubble_to_tier_end(trackers: &mut [Tracker], mut idx: usize) {
    let tier = trackers[idx].tier();
    while idx + 1 < trackers.len() && trackers[idx + 1].tier() == tier {
        trackers.swap(idx, idx + 1);
        idx += 1;
    }
}

/// Every tracker of one torrent, sorted by tier, and the policy deciding which of them
/// get announced to.
#[derive(Debug)]
pub struct TrackerPool {
    trackers: Vec<Tracker>,
    all_tiers: bool,
    all_trackers_in_tier: bool,
}

impl TrackerPool {
    pub fn build(meta: &TorrentMeta, policy: &AnnouncePolicy, now: Instant) -> Result<Self, Error> {
        let mut trackers: Vec<Tracker> = Vec::new();
        let contains = |trackers: &[Tracker], url: &Url| trackers.iter().any(|t| t.url() == url);

        if policy.supports_announce_list && !meta.announce_list.is_empty() {
            let mut tier_idx = 0;
            for tier in meta.announce_list.iter() {
                let before = trackers.len();
                for url in tier {
                    let url = parse_tracker_url(url)?;
                    if contains(&trackers, &url) {
                        continue;
                    }
                    trackers.push(new_tracker(url, tier_idx, policy, now));
                }
                if trackers.len() > before {
                    tier_idx += 1;
                }
            }
        } else {
            let announce = meta.announce.as_deref().ok_or(Error::NoTrackers)?;
            trackers.push(new_tracker(parse_tracker_url(announce)?, 0, policy, now));
            for (tier_idx, tier) in meta.announce_list.iter().enumerate() {
                for url in tier {
                    let url = parse_tracker_url(url)?;
                    if contains(&trackers, &url) {
                        continue;
                    }
                    trackers.push(Tracker::new_disabled(
                        url,
                        tier_idx + 1,
                        DisabledReason::AnnounceListNotSupported,
                        now,
                    ));
                }
            }
        }

        if trackers.is_empty() {
            return Err(Error::NoTrackers);
        }
        if !trackers.iter().any(|t| t.is_enabled()) {
            return Err(Error::NoEnabledTrackers(trackers.len()));
        }
        trace!(?trackers, "built tracker pool");

        Ok(Self {
            trackers,
            all_tiers: policy.announce_to_all_tiers,
            all_trackers_in_tier: policy.announce_to_all_trackers_in_tier,
        })
    }

    pub fn trackers(&self) -> &[Tracker] {
        &self.trackers
    }

    pub fn announce_to_all_tiers(&self) -> bool {
        self.all_tiers
    }

    /// Trackers the policy announces to across the whole pool. Tier loops apply the same
    /// rule one tier at a time through [`Tier::in_use`].
    pub fn in_use(&self) -> impl Iterator<Item = &Tracker> {
        select_in_use(&self.trackers, self.all_tiers, self.all_trackers_in_tier)
            .into_iter()
            .map(move |idx| &self.trackers[idx])
    }

    pub fn ready_to_announce(&self, now: Instant) -> impl Iterator<Item = &Tracker> {
        self.in_use().filter(move |t| t.can_announce(now))
    }

    pub fn deprioritize(&mut self, url: &Url) {
        if let Some(idx) = self.trackers.iter().position(|t| t.url() == url) {
            bubble_to_tier_end(&mut self.trackers, idx);
        }
    }

    /// Splits the pool into announceable tiers. Tiers without an enabled tracker are
    /// dropped, as are disabled trackers.
    pub fn into_tiers(self) -> Vec<Tier> {
        let kind = if self.all_trackers_in_tier {
            TierKind::AllTrackers
        } else {
            TierKind::FallbackTrackers
        };
        let mut tiers: Vec<Tier> = Vec::new();
        for t in self.trackers.into_iter().filter(|t| t.is_enabled()) {
            match tiers.last_mut() {
                Some(tier) if tier.index == t.tier() => tier.trackers.push(t),
                _ => tiers.push(Tier {
                    index: t.tier(),
                    kind,
                    trackers: vec![t],
                }),
            }
        }
        tiers
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Announce to every tracker of the tier.
    AllTrackers,
    /// Announce to the first tracker, moving on to the next one when it fails.
    FallbackTrackers,
}

/// Enabled trackers sharing one tier number.
#[derive(Clone, Debug)]
pub struct Tier {
    index: usize,
    kind: TierKind,
    trackers: Vec<Tracker>,
}

impl Tier {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> TierKind {
        self.kind
    }

    pub fn trackers(&self) -> &[Tracker] {
        &self.trackers
    }

    pub(crate) fn tracker_mut(&mut self, url: &Url) -> Option<&mut Tracker> {
        self.trackers.iter_mut().find(|t| t.url() == url)
    }

    /// Same rule as [`TrackerPool::in_use`], applied within this tier only.
    pub fn in_use(&self) -> impl Iterator<Item = &Tracker> {
        select_in_use(&self.trackers, false, self.kind == TierKind::AllTrackers)
            .into_iter()
            .map(move |idx| &self.trackers[idx])
    }

    pub fn ready_to_announce(&self, now: Instant) -> Vec<Url> {
        self.in_use()
            .filter(|t| t.can_announce(now))
            .map(|t| t.url().clone())
            .collect()
    }

    /// Earliest time an idle in-use tracker becomes announceable.
    pub fn next_announce(&self) -> Option<Instant> {
        self.in_use()
            .filter(|t| !t.is_announcing())
            .map(|t| t.next_announce())
            .min()
    }

    pub fn deprioritize(&mut self, url: &Url) {
        if let Some(idx) = self.trackers.iter().position(|t| t.url() == url) {
            bubble_to_tier_end(&mut self.trackers, idx);
        }
    }

    /// Interval of the most recent successful announce in the tier, zero if none.
    pub fn last_known_interval(&self) -> Duration {
        self.trackers
            .iter()
            .filter_map(|t| {
                t.history()
                    .filter(|h| h.error.is_none())
                    .last()
                    .map(|h| (h.at, h.interval))
            })
            .max_by_key(|(at, _)| *at)
            .map(|(_, interval)| interval)
            .unwrap_or_default()
    }

    /// Trackers that accepted our START and so should hear STOP.
    pub fn started_trackers(&self) -> Vec<Url> {
        self.trackers
            .iter()
            .filter(|t| t.has_sent_start())
            .map(|t| t.url().clone())
            .collect()
    }

    pub(crate) fn abort_announces(&mut self) {
        for t in self.trackers.iter_mut() {
            t.abort_announce();
        }
    }
}
