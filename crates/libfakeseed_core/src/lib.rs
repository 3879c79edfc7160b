pub mod hash_id;
pub mod peer_id;
pub mod spawn_utils;
pub mod torrent_meta;

pub use hash_id::Id20;
pub use torrent_meta::TorrentMeta;
