use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use crate::hash_id::Id20;

/// What the seeder needs to know about a torrent. Parsing .torrent files is left to
/// whoever produces these; the seeder only cares about trackers and the info hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TorrentMeta {
    pub info_hash: Id20,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Total length of the torrent content in bytes. We always pretend to have all of it.
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<String>,
    #[serde(
        rename = "announce-list",
        alias = "announce_list",
        default = "Vec::new",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub announce_list: Vec<Vec<String>>,
}

impl TorrentMeta {
    pub fn new(info_hash: Id20) -> Self {
        Self {
            info_hash,
            name: None,
            size: 0,
            announce: None,
            announce_list: Vec::new(),
        }
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.info_hash.as_string(),
        }
    }

    /// BEP-12: the trackers within each tier are shuffled once, when the torrent is loaded.
    /// Tier order is preserved.
    pub fn shuffle_announce_list(&mut self, rng: &mut impl Rng) {
        for tier in self.announce_list.iter_mut() {
            tier.shuffle(rng);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn test_shuffle_keeps_tiers() {
        let mut meta = TorrentMeta::new(Id20::default());
        meta.announce_list = vec![
            (0..10).map(|i| format!("http://a{i}/announce")).collect(),
            vec!["http://b/announce".to_owned()],
        ];
        let before = meta.announce_list.clone();
        let mut rng = StdRng::seed_from_u64(42);
        meta.shuffle_announce_list(&mut rng);

        assert_eq!(meta.announce_list.len(), 2);
        assert_eq!(meta.announce_list[1], before[1]);
        let mut first = meta.announce_list[0].clone();
        first.sort();
        let mut expected = before[0].clone();
        expected.sort();
        assert_eq!(first, expected);
    }

    #[test]
    fn test_deserialize_manifest_entry() {
        let json = r#"{
            "info_hash": "775459190aa65566591634203f8d9f17d341f969",
            "name": "ubuntu",
            "size": 1024,
            "announce": "http://t0/a",
            "announce-list": [["http://t1/a", "udp://t1:80"], ["http://t2/a"]]
        }"#;
        let meta: TorrentMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.display_name(), "ubuntu");
        assert_eq!(meta.announce.as_deref(), Some("http://t0/a"));
        assert_eq!(meta.announce_list.len(), 2);
        assert_eq!(meta.announce_list[0][1], "udp://t1:80");
    }
}
