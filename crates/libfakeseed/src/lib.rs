//! Simulates seeding: announces to trackers as a BitTorrent client would and reports
//! made-up upload, split between torrents according to how hungry their swarms are.
//!
//! Start with [`Session`]: add [`TorrentMeta`]s to it, then [`Session::start`].

pub mod bandwidth;
pub mod config;
mod error;
pub mod events;
pub mod manifest;
pub mod orchestrator;
pub mod peers;
mod session;
pub mod stats;
mod torrent;
pub mod tracing_subscriber_config_utils;
pub mod tracker;
pub mod trackers;

pub use error::Error;
pub use libfakeseed_core::{Id20, TorrentMeta, spawn_utils};
pub use session::{AddTorrentResponse, Session, SessionOptions};
pub use torrent::{SeedContext, Torrent, TorrentState, TorrentSummary};
pub use tracker_comms::{AnnounceEvent, Announcer};


/// The cargo version of libfakeseed.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
