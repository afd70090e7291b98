use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use crate::ID;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("tracker failure: {0}")]
    Failure(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
            Event::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct AnnounceParams {
    pub info_hash: ID,

    pub peer_id: ID,

    // Port we report to the swarm.
    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for a complete download.
    pub left: u64,

    pub event: Option<Event>,

    // How many peers we would like back.
    pub num_want: Option<usize>,
}

// One HTTP tracker. Tracks the announce intervals the tracker asked
// us to respect.
pub struct TrackerClient {
    client: reqwest::Client,

    pub url: Url,

    tracker_id: Option<String>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

    min_interval: Option<Duration>,
}

impl TrackerClient {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            tracker_id: None,
            last_announce: None,
            interval: None,
            min_interval: None,
        }
    }

    pub async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {
        // info_hash and peer_id are raw bytes and must be percent
        // encoded by hand; reqwest's query builder would mangle them.
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.peer_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_want) = params.num_want {
            url.push_str(&format!("&numwant={}", num_want));
        }
        if let Some(tracker_id) = &self.tracker_id {
            url.push_str(&format!("&trackerid={}", tracker_id));
        }
        tracing::debug!("announce url: {}", url);

        let raw_resp = tokio::time::timeout(ANNOUNCE_TIMEOUT, async {
            self.client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await
        })
        .await??;

        let resp: AnnounceResponse = serde_bencode::from_bytes(&raw_resp)?;
        tracing::debug!("announce response: {:?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::Failure(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }

        if let Some(interval) = resp.interval {
            self.interval = Some(Duration::from_secs(interval));
        }
        if let Some(min_interval) = resp.min_interval {
            self.min_interval = Some(Duration::from_secs(min_interval));
        }
        if let Some(tracker_id) = resp.tracker_id {
            self.tracker_id = Some(tracker_id);
        }

        tracing::info!(
            "tracker returned {} peers ({:?} seeders, {:?} leechers)",
            resp.peers.len(),
            resp.complete,
            resp.incomplete,
        );
        self.last_announce = Some(Instant::now());
        Ok(resp.peers)
    }

    // Whether the minimum interval allows an opportunistic announce.
    pub fn can_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= self
                        .min_interval
                        .unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL))
            }
            None => true,
        }
    }

    // Whether the regular interval has elapsed.
    pub fn should_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= self
                        .interval
                        .unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL))
            }
            None => true,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct AnnounceResponse {
    // If present, no other keys matter; a human-readable error.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    // Like failure reason, but the response is still processed.
    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    // Seconds the client should wait between regular announces.
    interval: Option<u64>,

    // If present clients must not reannounce more frequently than this.
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,

    // Token to echo back on the next announce.
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,

    // Seeder count.
    complete: Option<u64>,

    // Leecher count.
    incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peers_deserialize")]
    peers: Vec<SocketAddr>,
}

// The peer list is either a compact byte string (6 bytes per peer:
// IPv4 + port, both big-endian) or a list of dictionaries, whichever
// the tracker felt like sending.
fn peers_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("compact peer string not a multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }

            Ok(peers)
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&v)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => continue,
                }
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_compact() {
        let mut resp = Vec::new();
        resp.extend_from_slice(b"d8:completei9e10:incompletei1e8:intervali1800e5:peers12:");
        // Two peers: 10.0.0.1:6881 and 192.168.1.2:51413.
        resp.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
        resp.extend_from_slice(&[192, 168, 1, 2, 0xc8, 0xd5]);
        resp.extend_from_slice(b"e");

        let parsed: AnnounceResponse = serde_bencode::from_bytes(&resp).unwrap();
        assert_eq!(parsed.interval, Some(1800));
        assert_eq!(parsed.complete, Some(9));
        assert_eq!(parsed.incomplete, Some(1));
        assert_eq!(parsed.peers.len(), 2);
        assert!(parsed.peers.contains(&"10.0.0.1:6881".parse().unwrap()));
        assert!(parsed.peers.contains(&"192.168.1.2:51413".parse().unwrap()));
    }

    #[test]
    fn test_parse_response_dict_model() {
        let resp = b"d8:intervali900e5:peersl\
            d2:ip8:10.0.0.14:porti6881ee\
            d2:ip11:192.168.1.24:porti51413e7:peer id20:aaaaaaaaaaaaaaaaaaaaee\
            e";
        let parsed: AnnounceResponse = serde_bencode::from_bytes(&resp[..]).unwrap();
        assert_eq!(parsed.interval, Some(900));
        assert_eq!(parsed.peers.len(), 2);
        assert!(parsed.peers.contains(&"10.0.0.1:6881".parse().unwrap()));
        assert!(parsed.peers.contains(&"192.168.1.2:51413".parse().unwrap()));
    }

    #[test]
    fn test_parse_response_failure() {
        let resp = b"d14:failure reason20:unregistered torrente";
        let parsed: AnnounceResponse = serde_bencode::from_bytes(&resp[..]).unwrap();
        assert_eq!(parsed.failure_reason.as_deref(), Some("unregistered torrent"));
        assert!(parsed.peers.is_empty());
    }

    #[test]
    fn test_parse_response_compact_bad_length() {
        let mut resp = Vec::new();
        resp.extend_from_slice(b"d5:peers5:");
        resp.extend_from_slice(&[10, 0, 0, 1, 0x1a]);
        resp.extend_from_slice(b"e");
        assert!(serde_bencode::from_bytes::<AnnounceResponse>(&resp).is_err());
    }

    #[test]
    fn test_announce_pacing() {
        let mut tracker = TrackerClient::new(Url::parse("http://t.example.com/announce").unwrap());
        let now = Instant::now();
        // Nothing announced yet: both gates are open.
        assert!(tracker.can_announce(now));
        assert!(tracker.should_announce(now));

        tracker.last_announce = Some(now);
        tracker.interval = Some(Duration::from_secs(1800));
        tracker.min_interval = Some(Duration::from_secs(60));

        assert!(!tracker.can_announce(now + Duration::from_secs(30)));
        assert!(tracker.can_announce(now + Duration::from_secs(61)));
        assert!(!tracker.should_announce(now + Duration::from_secs(61)));
        assert!(tracker.should_announce(now + Duration::from_secs(1801)));
    }
}
