use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use percent_encoding::{percent_encode, utf8_percent_encode, NON_ALPHANUMERIC};
use rand::seq::SliceRandom;
use reqwest::{Client, ClientBuilder, Url};

use crate::bencoding::Value;
use crate::util::force_string;

const COMPACT: u8 = 1;
const NUMWANT: u32 = 15;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(PartialEq, Debug, Clone)]
pub struct Peer {
    pub peer_id: Option<String>,
    pub ip: String,
    pub port: u16,
}

impl Peer {
    /// Address usable to dial the peer.
    pub fn addr(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

#[derive(PartialEq, Debug)]
pub struct OkResponse {
    pub warning_message: Option<String>,
    /// Seconds to wait between regular announces. Required on the first announce.
    pub interval: Option<u64>,
    pub min_interval: Option<u64>,
    /// To be sent back on the following announces.
    pub tracker_id: Option<String>,
    /// Number of seeders.
    pub complete: Option<i64>,
    /// Number of leechers.
    pub incomplete: Option<i64>,
    pub peers: Vec<Peer>,
}

#[derive(PartialEq, Debug)]
pub enum Response {
    Ok(OkResponse),
    /// The tracker refused the announce, no other field is meaningful.
    Failure(String),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Response::Ok(ok) => {
                if let Some(warning_message) = &ok.warning_message {
                    writeln!(f, "WARNING {warning_message}")?;
                }
                let peers = ok
                    .peers
                    .iter()
                    .map(|p| format!("  - {} (id: {:?})", p.addr(), p.peer_id))
                    .collect::<Vec<String>>()
                    .join("\n");
                write!(
                    f,
                    "interval: {:?}\nmin_interval: {:?}\ntracker_id: {:?}\nn. peers completed: {:?}\nn. peers incomplete: {:?}\npeers:\n{peers}",
                    ok.interval, ok.min_interval, ok.tracker_id, ok.complete, ok.incomplete
                )
            }
            Response::Failure(failure_message) => write!(f, "FAILURE: {failure_message}"),
        }
    }
}

fn get<'a>(dict: &'a BTreeMap<Vec<u8>, Value>, key: &str) -> Option<&'a Value> {
    dict.get(key.as_bytes())
}

fn get_string(dict: &BTreeMap<Vec<u8>, Value>, key: &str) -> Result<Option<String>> {
    match get(dict, key) {
        None => Ok(None),
        Some(Value::Str(s)) => Ok(Some(
            String::from_utf8(s.clone())
                .with_context(|| format!("{key} key provided in tracker response but it is not an UTF8 string"))?,
        )),
        Some(_) => bail!("{key} key provided in tracker response but it is not a string"),
    }
}

fn get_int(dict: &BTreeMap<Vec<u8>, Value>, key: &str) -> Result<Option<i64>> {
    match get(dict, key) {
        None => Ok(None),
        Some(Value::Int(i)) => Ok(Some(*i)),
        Some(_) => bail!("{key} key provided in tracker response but it is not a number"),
    }
}

fn get_seconds(dict: &BTreeMap<Vec<u8>, Value>, key: &str) -> Result<Option<u64>> {
    get_int(dict, key)?
        .map(|i| u64::try_from(i).with_context(|| format!("{key} in tracker response is negative: {i}")))
        .transpose()
}

impl Response {
    pub fn from_bytes(body: &[u8]) -> Result<Response> {
        let Value::Dict(response_map) =
            Value::new(body).context("could not decode tracker response")?
        else {
            bail!("the tracker response was not a bencoded dictionary");
        };

        if let Some(failure_reason) = get_string(&response_map, "failure reason")? {
            return Ok(Response::Failure(failure_reason));
        }

        let peers = match get(&response_map, "peers") {
            Some(Value::List(peers_list)) => get_peers_with_dict_model(peers_list)?,
            Some(Value::Str(peers_bytes)) => get_peers_with_binary_model(peers_bytes)?,
            None => Vec::new(),
            Some(_) => bail!("peers key provided in tracker response but it is not a list or a string"),
        };

        Ok(Response::Ok(OkResponse {
            warning_message: get_string(&response_map, "warning message")?,
            interval: get_seconds(&response_map, "interval")?,
            min_interval: get_seconds(&response_map, "min interval")?,
            tracker_id: get_string(&response_map, "tracker id")?,
            complete: get_int(&response_map, "complete")?,
            incomplete: get_int(&response_map, "incomplete")?,
            peers,
        }))
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Event {
    /// regular announce
    None,
    Started,
    Stopped,
    Completed,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Event::None => "",
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Transfer totals reported on announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Announces to the trackers of one torrent, tier by tier.
pub struct TrackerClient {
    peer_id: [u8; 20],
    pub tracker_id: Option<String>,
    listening_port: u16,
    pub trackers_url: Vec<Vec<String>>,
    http: Client,
}

impl TrackerClient {
    pub fn new(
        peer_id: [u8; 20],
        trackers_url: Vec<Vec<String>>,
        listening_port: u16,
    ) -> Result<Self> {
        let mut rng = rand::rng();
        let trackers_url = trackers_url
            .into_iter()
            .map(|mut tier| {
                tier.shuffle(&mut rng);
                tier
            })
            .filter(|tier| !tier.is_empty())
            .collect();
        let http = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(TrackerClient {
            peer_id,
            tracker_id: None,
            listening_port,
            trackers_url,
            http,
        })
    }

    /// Announces to the first tracker that answers. A tracker that answers is moved to the front
    /// of its tier.
    pub async fn request(
        &mut self,
        info_hash: [u8; 20],
        stats: Stats,
        event: Event,
    ) -> Result<OkResponse> {
        let mut error_messages = Vec::new();
        for tier_idx in 0..self.trackers_url.len() {
            for tracker_idx in 0..self.trackers_url[tier_idx].len() {
                let url = self.trackers_url[tier_idx][tracker_idx].clone();
                match self.request_to_tracker(&url, info_hash, stats, event).await {
                    Ok(Response::Failure(msg)) => {
                        log::debug!("tracker {url} responded with failure: {msg}");
                        error_messages.push(format!("tracker {url} failed: \"{msg}\""));
                    }
                    Ok(Response::Ok(response)) => {
                        if let Some(warning) = &response.warning_message {
                            log::warn!("tracker {url} warning: {warning}");
                        }
                        if let Some(id) = &response.tracker_id {
                            self.tracker_id = Some(id.clone());
                        }
                        if tracker_idx != 0 {
                            let good_tracker = self.trackers_url[tier_idx].remove(tracker_idx);
                            self.trackers_url[tier_idx].insert(0, good_tracker);
                        }
                        return Ok(response);
                    }
                    Err(e) => {
                        log::debug!("error from tracker {url}: {e:#}");
                        error_messages.push(format!("tracker {url} errored: \"{e:#}\""));
                    }
                }
            }
        }
        if error_messages.is_empty() {
            error_messages.push("no trackers in list".to_string());
        }
        bail!(error_messages.join("; "))
    }

    pub async fn request_to_tracker(
        &self,
        url: &str,
        info_hash: [u8; 20],
        stats: Stats,
        event: Event,
    ) -> Result<Response> {
        if !url.starts_with("http") {
            bail!("scheme of url not supported: {url}");
        }
        let url = self.announce_url(url, info_hash, stats, event)?;
        log::debug!("requesting url: {url}");
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let response = Response::from_bytes(&body)?;
        log::trace!("tracker response: {response}");
        Ok(response)
    }

    /// Builds the announce url. The info hash and peer id are raw bytes and are percent-encoded
    /// here, the url is not encoded again.
    pub fn announce_url(
        &self,
        url: &str,
        info_hash: [u8; 20],
        stats: Stats,
        event: Event,
    ) -> Result<Url> {
        let mut url = Url::parse(url).with_context(|| format!("invalid tracker url {url}"))?;
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={COMPACT}&numwant={NUMWANT}",
            percent_encode(&info_hash, NON_ALPHANUMERIC),
            percent_encode(&self.peer_id, NON_ALPHANUMERIC),
            self.listening_port,
            stats.uploaded,
            stats.downloaded,
            stats.left,
        );
        if event != Event::None {
            query.push_str(&format!("&event={event}"));
        }
        if let Some(tracker_id) = &self.tracker_id {
            query.push_str(&format!(
                "&trackerid={}",
                utf8_percent_encode(tracker_id, NON_ALPHANUMERIC)
            ));
        }
        if let Some(existing) = url.query() {
            query = format!("{existing}&{query}");
        }
        url.set_query(Some(&query));
        Ok(url)
    }
}

fn get_peers_with_dict_model(peers_values: &[Value]) -> Result<Vec<Peer>> {
    let mut peers_list = Vec::new();
    for v in peers_values {
        let Value::Dict(peer_dict) = v else {
            bail!("peers list contains a value that is not a dictionary");
        };
        let peer_id = match get(peer_dict, "peer id") {
            Some(Value::Str(id)) => Some(force_string(id)),
            _ => None,
        };
        let Some(ip) = get_string(peer_dict, "ip")? else {
            bail!("ip key not provided in list of peers in tracker response");
        };
        let port = match get_int(peer_dict, "port")? {
            Some(port) => u16::try_from(port).with_context(|| format!("invalid peer port {port}"))?,
            None => bail!("port key not provided in list of peers in tracker response"),
        };
        peers_list.push(Peer { peer_id, ip, port });
    }
    Ok(peers_list)
}

fn get_peers_with_binary_model(peers_bytes: &[u8]) -> Result<Vec<Peer>> {
    if peers_bytes.len() % 6 != 0 {
        bail!("peers list is provided in binary model but it is not aligned to 6 bytes");
    }
    Ok(peers_bytes
        .chunks_exact(6)
        .map(|c| {
            let addr = SocketAddrV4::new(
                Ipv4Addr::new(c[0], c[1], c[2], c[3]),
                u16::from_be_bytes([c[4], c[5]]),
            );
            Peer {
                peer_id: None,
                ip: addr.ip().to_string(),
                port: addr.port(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn binary_peer_conversion() {
        let byte_peers = [
            0x1, 0x2, 0x3, 0x4, /* ip 1.2.3.4 */ 0x00, 0x50, /* port 80 */
            0x5, 0x6, 0x7, 0x8, /* ip 5.6.7.8 */ 0x04, 0xbd, /* port 1213 */
        ];
        let expected = vec![
            Peer {
                peer_id: None,
                ip: "1.2.3.4".to_string(),
                port: 80,
            },
            Peer {
                peer_id: None,
                ip: "5.6.7.8".to_string(),
                port: 1213,
            },
        ];
        assert_matches!(get_peers_with_binary_model(&byte_peers), Ok(peers) => {
            assert_eq!(peers, expected)
        });
        assert!(get_peers_with_binary_model(&byte_peers[..5]).is_err());
    }

    #[test]
    fn parse_dict_model_response() {
        let body = Value::dict([
            ("interval", Value::Int(1800)),
            ("min interval", Value::Int(60)),
            ("tracker id", Value::str("abc")),
            ("complete", Value::Int(42)),
            ("incomplete", Value::Int(100)),
            (
                "peers",
                Value::List(vec![Value::dict([
                    ("peer id", Value::str("-XX0001-000000000000")),
                    ("ip", Value::str("::1")),
                    ("port", Value::Int(6881)),
                ])]),
            ),
        ])
        .encode();
        assert_matches!(Response::from_bytes(&body), Ok(Response::Ok(ok)) => {
            assert_eq!(ok.interval, Some(1800));
            assert_eq!(ok.min_interval, Some(60));
            assert_eq!(ok.tracker_id.as_deref(), Some("abc"));
            assert_eq!(ok.complete, Some(42));
            assert_eq!(ok.incomplete, Some(100));
            assert_eq!(ok.peers[0].addr(), "[::1]:6881");
            assert_eq!(ok.peers[0].peer_id.as_deref(), Some("-XX0001-000000000000"));
        });
    }

    #[test]
    fn parse_failure_and_missing_interval() {
        let failure = b"d14:failure reason11:not allowede";
        assert_eq!(
            Response::from_bytes(failure).unwrap(),
            Response::Failure("not allowed".to_string())
        );

        let no_interval = b"d8:completei1e10:incompletei2e5:peers0:e";
        assert_matches!(Response::from_bytes(no_interval), Ok(Response::Ok(ok)) => {
            assert_eq!(ok.interval, None);
            assert!(ok.peers.is_empty());
        });

        assert!(Response::from_bytes(b"i3e").is_err());
        assert!(Response::from_bytes(b"d8:intervali-5ee").is_err());
    }

    #[test]
    fn announce_url_encodes_binary_fields() {
        let mut client =
            TrackerClient::new([b'a'; 20], vec![vec!["http://t.test/ann?k=v".to_string()]], 8000)
                .unwrap();
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0xff;
        info_hash[1] = b'A';
        let stats = Stats {
            uploaded: 1,
            downloaded: 2,
            left: 3,
        };
        let url = client
            .announce_url("http://t.test/ann?k=v", info_hash, stats, Event::Started)
            .unwrap();
        let query = url.query().unwrap();
        assert!(query.starts_with("k=v&info_hash=%FFA%00%00"));
        assert!(query.contains(&format!("&peer_id={}&", "a".repeat(20))));
        assert!(query.contains("&port=8000&uploaded=1&downloaded=2&left=3&compact=1&numwant=15"));
        assert!(query.ends_with("&event=started"));

        client.tracker_id = Some("x y".to_string());
        let url = client
            .announce_url("http://t.test/ann", info_hash, stats, Event::None)
            .unwrap();
        let query = url.query().unwrap();
        assert!(!query.contains("event="));
        assert!(query.ends_with("&trackerid=x%20y"));
    }

    /// Answers one http request with `body`, returning the request line.
    async fn fake_tracker(listener: TcpListener, body: Vec<u8>) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]).to_string();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.shutdown().await.unwrap();
        request.lines().next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn announce_falls_back_to_working_tracker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = format!("http://{}/announce", listener.local_addr().unwrap());
        let body = b"d8:intervali900e5:peers6:\x7f\x00\x00\x01\x1a\xe110:tracker id2:t1e".to_vec();
        let tracker = tokio::spawn(fake_tracker(listener, body));

        let bad = "udp://t.test:80".to_string();
        let mut client = TrackerClient::new([1; 20], vec![vec![bad, good.clone()]], 8000).unwrap();
        let response = client
            .request([2; 20], Stats::default(), Event::Started)
            .await
            .unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(response.peers[0].addr(), "127.0.0.1:6881");
        assert_eq!(client.tracker_id.as_deref(), Some("t1"));
        assert_eq!(client.trackers_url[0][0], good);

        let request_line = tracker.await.unwrap();
        assert!(request_line.starts_with("GET /announce?info_hash=%02%02"));
        assert!(request_line.contains("event=started"));
    }
}
