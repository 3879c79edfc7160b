use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use anyhow::{Context, bail};
use async_trait::async_trait;
use libfakeseed_core::hash_id::Id20;
use tracing::trace;
use url::Url;

use crate::tracker_comms::{AnnounceEvent, AnnounceRequest, AnnounceResponse, Announcer};

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

pub const EVENT_NONE: u32 = 0;
pub const EVENT_COMPLETED: u32 = 1;
pub const EVENT_STARTED: u32 = 2;
pub const EVENT_STOPPED: u32 = 3;

pub type ConnectionId = u64;
const CONNECTION_ID_MAGIC: ConnectionId = 0x41727101980;

pub type TransactionId = u32;

pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

fn event_code(event: AnnounceEvent) -> u32 {
    match event {
        AnnounceEvent::None => EVENT_NONE,
        AnnounceEvent::Completed => EVENT_COMPLETED,
        AnnounceEvent::Started => EVENT_STARTED,
        AnnounceEvent::Stopped => EVENT_STOPPED,
    }
}

#[derive(Debug)]
pub struct AnnounceFields {
    pub info_hash: Id20,
    pub peer_id: Id20,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: u32,
    pub key: u32,
    pub num_want: i32,
    pub port: u16,
}

impl From<&AnnounceRequest> for AnnounceFields {
    fn from(r: &AnnounceRequest) -> Self {
        Self {
            info_hash: r.info_hash,
            peer_id: r.peer_id,
            downloaded: r.downloaded,
            left: r.left,
            uploaded: r.uploaded,
            event: event_code(r.event),
            key: r.key,
            num_want: i32::try_from(r.num_want).unwrap_or(-1),
            port: r.port,
        }
    }
}

#[derive(Debug)]
pub enum Request {
    Connect,
    Announce(ConnectionId, AnnounceFields),
}

impl Request {
    pub fn serialize(&self, transaction_id: TransactionId, buf: &mut Vec<u8>) -> usize {
        let cur_len = buf.len();
        match self {
            Request::Connect => {
                buf.extend_from_slice(&CONNECTION_ID_MAGIC.to_be_bytes());
                buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
            }
            Request::Announce(connection_id, fields) => {
                buf.extend_from_slice(&connection_id.to_be_bytes());
                buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
                buf.extend_from_slice(&fields.info_hash.0);
                buf.extend_from_slice(&fields.peer_id.0);
                buf.extend_from_slice(&fields.downloaded.to_be_bytes());
                buf.extend_from_slice(&fields.left.to_be_bytes());
                buf.extend_from_slice(&fields.uploaded.to_be_bytes());
                buf.extend_from_slice(&fields.event.to_be_bytes());
                buf.extend_from_slice(&0u32.to_be_bytes()); // ip address 0
                buf.extend_from_slice(&fields.key.to_be_bytes());
                buf.extend_from_slice(&fields.num_want.to_be_bytes());
                buf.extend_from_slice(&fields.port.to_be_bytes());
            }
        }
        buf.len() - cur_len
    }
}

#[derive(Debug)]
pub struct UdpAnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub addrs: Vec<SocketAddrV4>,
}

#[derive(Debug)]
pub enum Response {
    Connect(ConnectionId),
    Announce(UdpAnnounceResponse),
    Error(String),
}

fn take<const N: usize>(buf: &[u8]) -> anyhow::Result<([u8; N], &[u8])> {
    if buf.len() < N {
        bail!("expected {} bytes, got {}", N, buf.len());
    }
    let (head, rest) = buf.split_at(N);
    let mut arr = [0u8; N];
    arr.copy_from_slice(head);
    Ok((arr, rest))
}

fn take_u32(buf: &[u8]) -> anyhow::Result<(u32, &[u8])> {
    let (b, rest) = take::<4>(buf)?;
    Ok((u32::from_be_bytes(b), rest))
}

impl Response {
    pub fn parse(buf: &[u8]) -> anyhow::Result<(TransactionId, Self)> {
        let (action, buf) = take_u32(buf).context("can't parse action")?;
        let (tid, buf) = take_u32(buf).context("can't parse transaction id")?;
        let response = match action {
            ACTION_CONNECT => {
                let (connection_id, rest) = take::<8>(buf).context("can't parse connection id")?;
                if !rest.is_empty() {
                    bail!("{} trailing bytes after connect response", rest.len());
                }
                Response::Connect(u64::from_be_bytes(connection_id))
            }
            ACTION_ANNOUNCE => {
                let (interval, b) = take_u32(buf).context("can't parse interval")?;
                let (leechers, b) = take_u32(b).context("can't parse leechers")?;
                let (seeders, b) = take_u32(b).context("can't parse seeders")?;
                if b.len() % 6 != 0 {
                    bail!("peer list length {} is not a multiple of 6", b.len());
                }
                let addrs = b
                    .chunks_exact(6)
                    .map(|c| {
                        SocketAddrV4::new(
                            Ipv4Addr::new(c[0], c[1], c[2], c[3]),
                            u16::from_be_bytes([c[4], c[5]]),
                        )
                    })
                    .collect();
                Response::Announce(UdpAnnounceResponse {
                    interval,
                    leechers,
                    seeders,
                    addrs,
                })
            }
            ACTION_ERROR => Response::Error(String::from_utf8_lossy(buf).into_owned()),
            _ => bail!("unsupported action {action}"),
        };
        Ok((tid, response))
    }
}

async fn resolve(tracker: &Url) -> anyhow::Result<SocketAddr> {
    let host = tracker.host_str().context("missing host")?;
    let port = tracker.port().context("missing port")?;
    // The url crate keeps brackets around IPv6 hosts.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("error looking up hostname {host}"))?
        .next()
        .with_context(|| format!("zero addresses returned looking up {host}"))
}

/// One connect + announce exchange per call (BEP-15). Connection ids are not cached:
/// announces are minutes apart, and ids expire after two.
#[derive(Default)]
pub struct UdpAnnouncer {}

impl UdpAnnouncer {
    async fn exchange(
        sock: &tokio::net::UdpSocket,
        request: Request,
        read_buf: &mut [u8],
    ) -> anyhow::Result<Response> {
        let tid = new_transaction_id();
        let mut write_buf = Vec::new();
        let size = request.serialize(tid, &mut write_buf);
        trace!(?request, tid, "sending");
        sock.send(&write_buf[..size])
            .await
            .context("error sending to socket")?;
        let size = sock
            .recv(read_buf)
            .await
            .context("error receiving from socket")?;
        let (rtid, response) =
            Response::parse(&read_buf[..size]).context("error parsing response")?;
        if tid != rtid {
            bail!("expected transaction id {tid}, got {rtid}");
        }
        if let Response::Error(msg) = response {
            bail!("tracker returned error: {msg}");
        }
        Ok(response)
    }

    async fn announce_inner(
        &self,
        tracker: &Url,
        request: &AnnounceRequest,
    ) -> anyhow::Result<AnnounceResponse> {
        let addr = resolve(tracker).await?;
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let sock = tokio::net::UdpSocket::bind(bind_addr)
            .await
            .context("error binding UDP socket")?;
        sock.connect(addr)
            .await
            .context("error connecting UDP socket")?;

        let mut read_buf = vec![0u8; 4096];
        let connection_id = match Self::exchange(&sock, Request::Connect, &mut read_buf).await? {
            Response::Connect(connection_id) => connection_id,
            other => bail!("unexpected response {other:?}, expected connect"),
        };
        trace!(connection_id);

        let request = Request::Announce(connection_id, request.into());
        match Self::exchange(&sock, request, &mut read_buf).await? {
            Response::Announce(r) => Ok(AnnounceResponse {
                interval: Duration::from_secs(r.interval as u64),
                min_interval: None,
                seeders: r.seeders,
                leechers: r.leechers,
                peers: r.addrs.into_iter().map(SocketAddr::V4).collect(),
                warning_message: None,
            }),
            other => bail!("unexpected response {other:?}, expected announce"),
        }
    }
}

#[async_trait]
impl Announcer for UdpAnnouncer {
    async fn announce(
        &self,
        tracker: &Url,
        request: &AnnounceRequest,
        deadline: Duration,
    ) -> anyhow::Result<AnnounceResponse> {
        if tracker.scheme() != "udp" {
            bail!("expected UDP scheme in {tracker}");
        }
        tokio::time::timeout(deadline, self.announce_inner(tracker, request))
            .await
            .with_context(|| format!("timeout announcing to {tracker}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_announce() {
        let request = AnnounceRequest {
            info_hash: Id20::new([1; 20]),
            peer_id: Id20::new([2; 20]),
            uploaded: 3,
            downloaded: 4,
            left: 5,
            corrupt: 0,
            event: AnnounceEvent::Started,
            key: 7,
            num_want: 50,
            port: 6881,
        };
        let mut buf = Vec::new();
        let size = Request::Announce(42, (&request).into()).serialize(9, &mut buf);
        assert_eq!(size, 98);
        assert_eq!(&buf[..8], &42u64.to_be_bytes());
        assert_eq!(&buf[8..12], &ACTION_ANNOUNCE.to_be_bytes());
        assert_eq!(&buf[12..16], &9u32.to_be_bytes());
        assert_eq!(&buf[80..84], &EVENT_STARTED.to_be_bytes());
        assert_eq!(&buf[92..96], &50i32.to_be_bytes());
        assert_eq!(&buf[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_parse_announce() {
        let mut b = Vec::new();
        b.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        b.extend_from_slice(&5u32.to_be_bytes());
        b.extend_from_slice(&1800u32.to_be_bytes());
        b.extend_from_slice(&12u32.to_be_bytes());
        b.extend_from_slice(&3u32.to_be_bytes());
        b.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        let (tid, response) = Response::parse(&b).unwrap();
        assert_eq!(tid, 5);
        match response {
            Response::Announce(r) => {
                assert_eq!(r.interval, 1800);
                assert_eq!(r.leechers, 12);
                assert_eq!(r.seeders, 3);
                assert_eq!(r.addrs, vec!["127.0.0.1:6881".parse().unwrap()]);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_and_truncated() {
        let mut b = Vec::new();
        b.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        b.extend_from_slice(&1u32.to_be_bytes());
        b.extend_from_slice(b"bad info hash");
        match Response::parse(&b).unwrap() {
            (1, Response::Error(msg)) => assert_eq!(msg, "bad info hash"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Response::parse(&[0, 0, 0]).is_err());
    }
}
