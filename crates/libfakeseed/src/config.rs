use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::Error;

const KIB: u64 = 1024;

/// How much fake upload to hand out, and how often.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Lower bound of the global upload rate, bytes per second.
    pub min_upload_rate: u64,
    /// Upper bound of the global upload rate, bytes per second.
    pub max_upload_rate: u64,

    /// How often a new global rate is drawn from `[min_upload_rate, max_upload_rate]`.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub refresh_interval: Duration,

    /// How often uploaded bytes are credited to the torrents.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub seed_increment_interval: Duration,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            min_upload_rate: 30 * KIB,
            max_upload_rate: 160 * KIB,
            refresh_interval: Duration::from_secs(20 * 60),
            seed_increment_interval: Duration::from_secs(5),
        }
    }
}

impl BandwidthConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_upload_rate > self.max_upload_rate {
            return Err(Error::InvalidBandwidthRange {
                min: self.min_upload_rate,
                max: self.max_upload_rate,
            });
        }
        if self.seed_increment_interval.is_zero() {
            return Err(Error::ZeroSeedIncrementInterval);
        }
        Ok(())
    }
}

/// What the emulated client is able to do when talking to trackers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnnouncePolicy {
    pub supports_http_announce: bool,
    pub supports_udp_announce: bool,
    pub supports_announce_list: bool,
    pub announce_to_all_tiers: bool,
    pub announce_to_all_trackers_in_tier: bool,
}

impl Default for AnnouncePolicy {
    fn default() -> Self {
        Self {
            supports_http_announce: true,
            supports_udp_announce: true,
            supports_announce_list: true,
            announce_to_all_tiers: false,
            announce_to_all_trackers_in_tier: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Two letter Azureus-style client code, e.g. "qB".
    pub client_code: String,
    pub client_version: [u8; 4],
    /// The port we pretend to listen on. Trackers don't accept 0.
    pub port: u16,
    pub num_want: u32,
    pub num_want_on_stop: u32,
    pub announce_policy: AnnouncePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_code: "qB".to_owned(),
            client_version: [4, 6, 0, 0],
            port: 51413,
            num_want: 200,
            num_want_on_stop: 0,
            announce_policy: Default::default(),
        }
    }
}

impl ClientConfig {
    pub fn client_code_bytes(&self) -> Result<[u8; 2], Error> {
        match self.client_code.as_bytes() {
            [a, b] if a.is_ascii() && b.is_ascii() => Ok([*a, *b]),
            _ => Err(Error::InvalidClientCode(self.client_code.clone())),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SeedConfig {
    pub bandwidth: BandwidthConfig,
    pub client: ClientConfig,

    /// Deadline for a regular announce.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub announce_timeout: Duration,

    /// How long stopping a torrent (or the whole session) may take.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub stop_timeout: Duration,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            bandwidth: Default::default(),
            client: Default::default(),
            announce_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl SeedConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.bandwidth.validate()?;
        self.client.client_code_bytes()?;
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("error reading config file {path:?}"))?;
        let config: SeedConfig = serde_json::from_str(&content)
            .with_context(|| format!("error deserializing config file {path:?}"))?;
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SeedConfig = serde_json::from_str(
            r#"{
                "bandwidth": {"min_upload_rate": 1000, "max_upload_rate": 2000, "refresh_interval": 60},
                "client": {"announce_policy": {"announce_to_all_tiers": true}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.bandwidth.min_upload_rate, 1000);
        assert_eq!(config.bandwidth.refresh_interval, Duration::from_secs(60));
        assert_eq!(
            config.bandwidth.seed_increment_interval,
            Duration::from_secs(5)
        );
        assert!(config.client.announce_policy.announce_to_all_tiers);
        assert!(config.client.announce_policy.supports_announce_list);
        assert_eq!(config.client.port, 51413);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate() {
        let mut config = SeedConfig::default();
        config.bandwidth.min_upload_rate = 10;
        config.bandwidth.max_upload_rate = 5;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidBandwidthRange { min: 10, max: 5 })
        ));

        let mut config = SeedConfig::default();
        config.client.client_code = "qBt".into();
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidClientCode(_))
        ));
    }
}
