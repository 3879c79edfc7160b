use std::path::Path;

use anyhow::Context;
use libfakeseed_core::TorrentMeta;

/// Reads a JSON array of torrents, e.g.
///
/// ```json
/// [{"info_hash": "…40 hex chars…", "name": "x", "announce": "http://t/announce",
///   "announce-list": [["http://t/announce"], ["udp://u:1337"]]}]
/// ```
pub fn load_manifest(path: &Path) -> anyhow::Result<Vec<TorrentMeta>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("error reading torrent manifest {path:?}"))?;
    parse_manifest(&content).with_context(|| format!("error parsing torrent manifest {path:?}"))
}

pub fn parse_manifest(content: &str) -> anyhow::Result<Vec<TorrentMeta>> {
    let torrents: Vec<TorrentMeta> = serde_json::from_str(content)?;
    Ok(torrents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let hash = "a".repeat(40);
        let torrents = parse_manifest(&format!(
            r#"[
                {{"info_hash": "{hash}", "name": "one", "size": 10, "announce": "http://t/a"}},
                {{"info_hash": "{hash}", "announce_list": [["udp://u:1"]]}}
            ]"#
        ))
        .unwrap();
        assert_eq!(torrents.len(), 2);
        assert_eq!(torrents[0].display_name(), "one");
        assert_eq!(torrents[0].size, 10);
        assert_eq!(torrents[1].announce_list, vec![vec!["udp://u:1".to_owned()]]);
    }

    #[test]
    fn test_bad_manifest() {
        assert!(parse_manifest(r#"[{"name": "no hash"}]"#).is_err());
        assert!(parse_manifest(r#"{"info_hash": "00"}"#).is_err());
    }
}
