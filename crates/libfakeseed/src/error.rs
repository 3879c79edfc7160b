use libfakeseed_core::Id20;

/// Errors the caller may want to tell apart. Everything else travels as `anyhow::Error`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("torrent has no announce url")]
    NoTrackers,
    #[error("none of the {0} trackers can be announced to by the emulated client")]
    NoEnabledTrackers(usize),
    #[error("malformed tracker url {url:?}: {source}")]
    MalformedTrackerUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid bandwidth configuration: min upload rate {min} is greater than max {max}")]
    InvalidBandwidthRange { min: u64, max: u64 },
    #[error("seed increment interval must be greater than zero")]
    ZeroSeedIncrementInterval,
    #[error("client code must be exactly 2 ASCII characters, got {0:?}")]
    InvalidClientCode(String),
    #[error("torrent {0:?} not found")]
    TorrentNotFound(Id20),
}
