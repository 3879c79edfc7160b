use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use libfakeseed_core::hash_id::Id20;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::tracker_comms_http::HttpAnnouncer;
use crate::tracker_comms_udp::UdpAnnouncer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::None => "none",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

impl std::fmt::Display for AnnounceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a tracker is told in one announce.
#[derive(Clone, Debug)]
pub struct AnnounceRequest {
    pub info_hash: Id20,
    pub peer_id: Id20,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub corrupt: u64,
    pub event: AnnounceEvent,
    pub key: u32,
    pub num_want: u32,
    pub port: u16,
}

#[derive(Clone, Debug, Default)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub seeders: u32,
    pub leechers: u32,
    pub peers: Vec<SocketAddr>,
    pub warning_message: Option<String>,
}

impl AnnounceResponse {
    /// The interval we should actually wait before the next announce. Trackers may send a
    /// "min interval" larger than "interval", honor whichever is bigger.
    pub fn effective_interval(&self) -> Duration {
        match self.min_interval {
            Some(min) => self.interval.max(min),
            None => self.interval,
        }
    }
}

/// Sends one announce to one tracker. Implementations never retry: retry scheduling
/// belongs to the caller.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(
        &self,
        tracker: &Url,
        request: &AnnounceRequest,
        deadline: Duration,
    ) -> anyhow::Result<AnnounceResponse>;
}

/// Picks the HTTP or UDP announcer depending on the tracker URL scheme.
pub struct TrackerAnnouncer {
    http: HttpAnnouncer,
    udp: UdpAnnouncer,
}

impl TrackerAnnouncer {
    pub fn new(reqwest_client: reqwest::Client) -> Self {
        Self {
            http: HttpAnnouncer::new(reqwest_client),
            udp: UdpAnnouncer::default(),
        }
    }
}

#[async_trait]
impl Announcer for TrackerAnnouncer {
    async fn announce(
        &self,
        tracker: &Url,
        request: &AnnounceRequest,
        deadline: Duration,
    ) -> anyhow::Result<AnnounceResponse> {
        match tracker.scheme() {
            "http" | "https" => self.http.announce(tracker, request, deadline).await,
            "udp" => self.udp.announce(tracker, request, deadline).await,
            other => bail!("unsupported tracker scheme {other:?} in {tracker}"),
        }
    }
}
