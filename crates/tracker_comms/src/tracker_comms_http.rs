use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_bencode::value::Value;
use tracing::trace;
use url::Url;

use crate::tracker_comms::{AnnounceEvent, AnnounceRequest, AnnounceResponse, Announcer};

pub struct HttpAnnouncer {
    reqwest_client: reqwest::Client,
}

impl HttpAnnouncer {
    pub fn new(reqwest_client: reqwest::Client) -> Self {
        Self { reqwest_client }
    }
}

#[derive(Deserialize, Debug)]
struct HttpTrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(rename = "warning message", default)]
    warning_message: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<u64>,
    #[serde(default)]
    complete: Option<u64>,
    #[serde(default)]
    incomplete: Option<u64>,
    #[serde(default)]
    peers: Option<Value>,
}

fn parse_compact_peers(b: &[u8]) -> Vec<SocketAddr> {
    b.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

fn parse_dict_peers(list: &[Value]) -> Vec<SocketAddr> {
    list.iter()
        .filter_map(|peer| {
            let Value::Dict(d) = peer else {
                return None;
            };
            let ip = match d.get(b"ip".as_slice())? {
                Value::Bytes(b) => std::str::from_utf8(b).ok()?.parse::<IpAddr>().ok()?,
                _ => return None,
            };
            let port = match d.get(b"port".as_slice())? {
                Value::Int(p) => u16::try_from(*p).ok()?,
                _ => return None,
            };
            Some(SocketAddr::new(ip, port))
        })
        .collect()
}

fn saturating_u32(v: Option<u64>) -> u32 {
    v.map(|v| u32::try_from(v).unwrap_or(u32::MAX))
        .unwrap_or_default()
}

fn parse_response(bytes: &[u8]) -> anyhow::Result<AnnounceResponse> {
    let response: HttpTrackerResponse =
        serde_bencode::from_bytes(bytes).context("error decoding tracker response")?;
    if let Some(reason) = response.failure_reason {
        bail!("tracker returned failure. Failure reason: {reason}");
    }
    let interval = response
        .interval
        .context("tracker response is missing \"interval\"")?;
    let peers = match &response.peers {
        Some(Value::Bytes(b)) => parse_compact_peers(b),
        Some(Value::List(l)) => parse_dict_peers(l),
        _ => Vec::new(),
    };
    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval),
        min_interval: response.min_interval.map(Duration::from_secs),
        seeders: saturating_u32(response.complete),
        leechers: saturating_u32(response.incomplete),
        peers,
        warning_message: response.warning_message,
    })
}

impl AnnounceRequest {
    pub fn as_querystring(&self) -> String {
        use std::fmt::Write;
        use urlencoding as u;
        let mut s = String::new();
        s.push_str("info_hash=");
        s.push_str(u::encode_binary(&self.info_hash.0).as_ref());
        s.push_str("&peer_id=");
        s.push_str(u::encode_binary(&self.peer_id.0).as_ref());
        // Writing to a String can't fail.
        let _ = write!(s, "&port={}", self.port);
        let _ = write!(s, "&uploaded={}", self.uploaded);
        let _ = write!(s, "&downloaded={}", self.downloaded);
        let _ = write!(s, "&left={}", self.left);
        let _ = write!(s, "&corrupt={}", self.corrupt);
        s.push_str("&compact=1");
        let _ = write!(s, "&numwant={}", self.num_want);
        let _ = write!(s, "&key={:08X}", self.key);
        if self.event != AnnounceEvent::None {
            let _ = write!(s, "&event={}", self.event.as_str());
        }
        s
    }
}

fn build_announce_url(tracker: &Url, request: &AnnounceRequest) -> Url {
    let mut url = tracker.clone();
    let mut queries = request.as_querystring();
    if let Some(url_query) = tracker.query() {
        queries.push('&');
        queries.push_str(url_query);
    }
    url.set_query(Some(&queries));
    url
}

#[async_trait]
impl Announcer for HttpAnnouncer {
    async fn announce(
        &self,
        tracker: &Url,
        request: &AnnounceRequest,
        deadline: Duration,
    ) -> anyhow::Result<AnnounceResponse> {
        let url = build_announce_url(tracker, request);
        trace!(%url, "announcing");
        let response = self
            .reqwest_client
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .context("error sending announce")?;
        if !response.status().is_success() {
            bail!("tracker responded with {:?}", response.status());
        }
        let bytes = response
            .bytes()
            .await
            .context("error reading tracker response body")?;
        parse_response(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libfakeseed_core::Id20;

    fn request(event: AnnounceEvent) -> AnnounceRequest {
        let info_hash = Id20::new([
            1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ]);
        AnnounceRequest {
            info_hash,
            peer_id: info_hash,
            uploaded: 100,
            downloaded: 0,
            left: 0,
            corrupt: 0,
            event,
            key: 0xdead,
            num_want: 200,
            port: 6881,
        }
    }

    #[test]
    fn test_querystring() {
        let qs = request(AnnounceEvent::Started).as_querystring();
        assert!(qs.starts_with("info_hash=%01%02%03%04%05%06%07%08%09%0A"));
        assert!(qs.contains("&uploaded=100&"));
        assert!(qs.contains("&key=0000DEAD"));
        assert!(qs.ends_with("&event=started"));

        let qs = request(AnnounceEvent::None).as_querystring();
        assert!(!qs.contains("event="));
    }

    #[test]
    fn test_build_url_keeps_existing_query() {
        let tracker = Url::parse("http://t.example/announce?passkey=abc").unwrap();
        let url = build_announce_url(&tracker, &request(AnnounceEvent::Stopped));
        let q = url.query().unwrap();
        assert!(q.starts_with("info_hash="));
        assert!(q.ends_with("&event=stopped&passkey=abc"));
    }

    #[test]
    fn test_parse_tracker_response_compact() {
        let data = b"d8:completei10e10:incompletei100e8:intervali1800e5:peers6:iiiippe";
        let response = parse_response(data).unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.seeders, 10);
        assert_eq!(response.leechers, 100);
        assert_eq!(
            response.peers,
            vec!["105.105.105.105:28784".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn test_parse_tracker_response_dict_peers() {
        let data = b"d8:intervali900e12:min intervali1000e5:peersld2:ip9:127.0.0.14:porti100eeee";
        let response = parse_response(data).unwrap();
        assert_eq!(response.effective_interval(), Duration::from_secs(1000));
        assert_eq!(response.seeders, 0);
        assert_eq!(
            response.peers,
            vec!["127.0.0.1:100".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn test_parse_failure_reason() {
        let data = b"d14:failure reason17:torrent not founde";
        let err = parse_response(data).unwrap_err();
        assert!(format!("{err:#}").contains("torrent not found"));
    }

    #[test]
    fn test_parse_missing_interval() {
        assert!(parse_response(b"d8:completei1ee").is_err());
    }
}
