use rand::Rng;
use reqwest::ClientBuilder;
use tokio::{net::UdpSocket, time::timeout};

use crate::bencoding::Value;
use rand::seq::SliceRandom;
use std::{
    fmt, str,
    time::{Duration, SystemTime},
};
use thiserror::Error;

const UDP_CONNECT_BASE_TIMEOUT: Duration = Duration::from_millis(500);
const UDP_ANNOUNCE_BASE_TIMEOUT: Duration = Duration::from_millis(750);
const UDP_MAX_ATTEMPTS: u32 = 3;
const UDP_PROTOCOL_MAGIC: u64 = 0x41727101980;
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const NUMWANT: u32 = 50;

#[derive(PartialEq, Debug, Clone)]
pub struct Peer {
    pub peer_id: Option<String>, // peer's self-selected id, only present in dict-model responses
    pub ip: String,              // IPv4/IPv6 address or DNS name
    pub port: u16,
}

#[derive(PartialEq, Debug)]
pub struct OkResponse {
    pub warning_message: Option<String>, // processed like a failure reason, but the response is still valid
    pub interval: i64,                   // seconds to wait between regular announces
    pub min_interval: Option<i64>,       // if present, do not reannounce more frequently than this
    pub tracker_id: Option<String>,      // echo back on the next announce if present
    pub complete: i64,                   // number of seeders, 0 when the tracker omits it
    pub incomplete: i64,                 // number of leechers, 0 when the tracker omits it
    pub peers: Vec<Peer>,
}

#[derive(PartialEq, Debug)]
pub enum Response {
    Ok(OkResponse),
    Failure(String), // the "failure reason" value, no other key is valid alongside it
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Response::Ok(ok_response) => {
                if let Some(warning_message) = &ok_response.warning_message {
                    write!(f, "WARNING {}", warning_message)?;
                }
                let peers = ok_response
                    .peers
                    .iter()
                    .map(|p| format!("  - {}:{} (id: {:#?})", p.ip, p.port, p.peer_id))
                    .collect::<Vec<String>>()
                    .join("\n");
                write!(
                    f,
                    "interval: {}\nn. seeders: {}\nn. leechers: {}\npeers:\n{}",
                    ok_response.interval, ok_response.complete, ok_response.incomplete, peers
                )
            }
            Response::Failure(failure_message) => {
                write!(f, "FAILURE: {}", failure_message)
            }
        }
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum Event {
    None,
    Started,
    Stopped,
    Completed,
}

impl Event {
    fn as_str(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("tracker rejected the announce: {0}")]
    Rejected(String),
    #[error("tracker did not answer in time")]
    Timeout,
    #[error("tracker protocol error: {0}")]
    Protocol(String),
    #[error("tracker transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
#[error("no usable tracker in the announce list")]
pub struct NoTrackerError;

const COMPACT: i32 = 1;

#[derive(Clone)]
pub struct TrackerClient {
    pub peer_id: String,
    pub tracker_id: Option<String>,
    listening_port: u16,
    pub trackers_url: Vec<Vec<String>>,
    pub tracker_request_interval: Duration,
    // the re-announce schedule is anchored here: failed attempts must not
    // push the next announce a full interval into the future
    pub last_successful_announce: SystemTime,
}

impl TrackerClient {
    pub fn new(peer_id: String, trackers_url: Vec<Vec<String>>, listening_port: u16) -> Self {
        // per BEP 12 every tier is shuffled once, then reordered on success
        let mut randomized_tiers: Vec<Vec<String>> = Vec::new();
        for tier in trackers_url {
            let mut randomized_tier = tier.clone();
            randomized_tier.shuffle(&mut rand::rng());
            randomized_tiers.push(randomized_tier);
        }
        TrackerClient {
            peer_id,
            tracker_id: None,
            listening_port,
            trackers_url: randomized_tiers,
            // high interval by default to avoid bombarding the tracker before
            // we get the proper interval from it
            tracker_request_interval: Duration::from_secs(600),
            last_successful_announce: SystemTime::UNIX_EPOCH,
        }
    }

    pub async fn request(
        &mut self,
        info_hash: [u8; 20],
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Event,
    ) -> Result<Response, anyhow::Error> {
        let mut error_messages = Vec::new();
        let mut tried_any = false;
        for tier_idx in 0..self.trackers_url.len() {
            for tracker_idx in 0..self.trackers_url[tier_idx].len() {
                let url = self.trackers_url[tier_idx][tracker_idx].clone();
                if !is_supported_scheme(&url) {
                    log::debug!("skipping tracker with unsupported scheme: {url}");
                    continue;
                }
                tried_any = true;
                match self
                    .request_to_tracker(&url, info_hash, uploaded, downloaded, left, event.clone())
                    .await
                {
                    Ok(Response::Failure(msg)) => {
                        log::debug!("tracker {url} responded with failure: {msg}");
                        error_messages.push(TrackerError::Rejected(msg).to_string());
                    }
                    Ok(Response::Ok(response)) => {
                        if self.tracker_id.is_none() {
                            self.tracker_id = response.tracker_id.clone();
                        }
                        // move the good tracker to the front of its tier
                        if tracker_idx != 0 {
                            let good_tracker = self.trackers_url[tier_idx].remove(tracker_idx);
                            self.trackers_url[tier_idx].insert(0, good_tracker);
                        }
                        self.tracker_request_interval =
                            Duration::from_secs(response.interval.max(0) as u64);
                        self.last_successful_announce = SystemTime::now();
                        return Ok(Response::Ok(response));
                    }
                    Err(e) => {
                        log::debug!("error from tracker {url}: {e}; will try the next one");
                        error_messages.push(format!("tracker {url} errored: \"{e}\""));
                    }
                }
            }
        }
        if !tried_any {
            return Err(NoTrackerError.into());
        }
        Err(anyhow::Error::msg(error_messages.join("; ")))
    }

    async fn request_to_tracker(
        &self,
        url: &str,
        info_hash: [u8; 20],
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Event,
    ) -> Result<Response, TrackerError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            log::debug!("announcing to http tracker {url}...");
            self.request_to_http_tracker(url, info_hash, uploaded, downloaded, left, event)
                .await
        } else {
            log::debug!("announcing to udp tracker {url}...");
            self.request_to_udp_tracker(url, info_hash, uploaded, downloaded, left, event)
                .await
        }
    }

    async fn request_to_http_tracker(
        &self,
        url: &str,
        info_hash: [u8; 20],
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Event,
    ) -> Result<Response, TrackerError> {
        let mut params = vec![
            ("peer_id", self.peer_id.clone()),
            ("port", self.listening_port.to_string()),
            ("uploaded", uploaded.to_string()),
            ("downloaded", downloaded.to_string()),
            ("left", left.to_string()),
            ("compact", COMPACT.to_string()),
            ("numwant", NUMWANT.to_string()),
        ];
        if let Some(event) = event.as_str() {
            params.push(("event", event.to_string()));
        }
        if let Some(tracker_id) = &self.tracker_id {
            params.push(("trackerid", tracker_id.clone()));
        }
        let mut url = reqwest::Url::parse_with_params(url, &params)
            .map_err(|e| TrackerError::Protocol(e.to_string()))?;

        // the info_hash is raw bytes: encode it by hand so reqwest does not
        // urlencode the percent signs again
        if let Some(query) = url.query() {
            url.set_query(Some(
                &("info_hash=".to_string() + &url_encode_info_hash(info_hash) + "&" + query),
            ))
        }

        log::debug!("requesting url: {}", url);

        let response = ClientBuilder::new()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TrackerError::Transport(e.to_string()))?
            .get(url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerError::Timeout
                } else {
                    TrackerError::Transport(e.to_string())
                }
            })?
            .error_for_status()
            .map_err(|e| TrackerError::Transport(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| TrackerError::Transport(e.to_string()))?;

        parse_announce_response(&body)
    }

    async fn request_to_udp_tracker(
        &self,
        url: &str,
        info_hash: [u8; 20],
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Event,
    ) -> Result<Response, TrackerError> {
        let url = reqwest::Url::parse(url).map_err(|e| TrackerError::Protocol(e.to_string()))?;
        let host = url
            .host()
            .ok_or_else(|| TrackerError::Protocol(format!("udp tracker url has no host: {url}")))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| TrackerError::Protocol(format!("udp tracker url has no port: {url}")))?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| TrackerError::Transport(e.to_string()))?;
        socket
            .connect(format!("{host}:{port}"))
            .await
            .map_err(|e| TrackerError::Transport(e.to_string()))?;

        let connection_id = udp_connect(&socket).await?;
        udp_announce(
            &socket,
            connection_id,
            info_hash,
            self.peer_id.as_bytes(),
            uploaded,
            downloaded,
            left,
            event,
            self.listening_port,
        )
        .await
    }
}

// connect phase: 16-byte request, 16-byte response carrying the connection id.
// retried with exponential backoff, 500 ms initial timeout, doubling.
async fn udp_connect(socket: &UdpSocket) -> Result<u64, TrackerError> {
    for attempt in 0..UDP_MAX_ATTEMPTS {
        let transaction_id: u32 = rand::rng().random();
        let mut send_buf = [0u8; 16];
        send_buf[0..8].copy_from_slice(&UDP_PROTOCOL_MAGIC.to_be_bytes());
        send_buf[8..12].copy_from_slice(&0u32.to_be_bytes()); // action: connect
        send_buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
        socket
            .send(&send_buf)
            .await
            .map_err(|e| TrackerError::Transport(e.to_string()))?;

        let mut recv_buf = [0u8; 16];
        match timeout(UDP_CONNECT_BASE_TIMEOUT * 2u32.pow(attempt), socket.recv(&mut recv_buf))
            .await
        {
            Err(_elapsed) => continue,
            Ok(Err(e)) => return Err(TrackerError::Transport(e.to_string())),
            Ok(Ok(bytes_recv)) => {
                if bytes_recv < 16 {
                    return Err(TrackerError::Protocol(
                        "connect response shorter than 16 bytes".to_string(),
                    ));
                }
                let action = u32::from_be_bytes(recv_buf[0..4].try_into().expect("4 bytes"));
                if action != 0 {
                    return Err(TrackerError::Protocol(format!(
                        "connect response action was {action}, not 0"
                    )));
                }
                let recv_transaction_id =
                    u32::from_be_bytes(recv_buf[4..8].try_into().expect("4 bytes"));
                if recv_transaction_id != transaction_id {
                    return Err(TrackerError::Protocol(format!(
                        "connect response transaction id {recv_transaction_id} does not match the request ({transaction_id})"
                    )));
                }
                return Ok(u64::from_be_bytes(
                    recv_buf[8..16].try_into().expect("8 bytes"),
                ));
            }
        }
    }
    Err(TrackerError::Timeout)
}

// announce phase: 98-byte request, variable response with compact IPv4 rows.
// retried with exponential backoff, 750 ms initial timeout, doubling.
#[allow(clippy::too_many_arguments)]
async fn udp_announce(
    socket: &UdpSocket,
    connection_id: u64,
    info_hash: [u8; 20],
    peer_id: &[u8],
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: Event,
    listening_port: u16,
) -> Result<Response, TrackerError> {
    for attempt in 0..UDP_MAX_ATTEMPTS {
        let transaction_id: u32 = rand::rng().random();
        let mut announce_buf = [0u8; 98];
        announce_buf[0..8].copy_from_slice(&connection_id.to_be_bytes());
        announce_buf[8..12].copy_from_slice(&1u32.to_be_bytes()); // action: announce
        announce_buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
        announce_buf[16..36].copy_from_slice(&info_hash);
        announce_buf[36..56].copy_from_slice(peer_id);
        announce_buf[56..64].copy_from_slice(&downloaded.to_be_bytes());
        announce_buf[64..72].copy_from_slice(&left.to_be_bytes());
        announce_buf[72..80].copy_from_slice(&uploaded.to_be_bytes());
        let event_id: u32 = match event {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        };
        announce_buf[80..84].copy_from_slice(&event_id.to_be_bytes());
        announce_buf[92..96].copy_from_slice(&(NUMWANT as i32).to_be_bytes());
        announce_buf[96..98].copy_from_slice(&listening_port.to_be_bytes());
        socket
            .send(&announce_buf)
            .await
            .map_err(|e| TrackerError::Transport(e.to_string()))?;

        let mut recv_buf = [0u8; 65535]; // max udp datagram size
        match timeout(
            UDP_ANNOUNCE_BASE_TIMEOUT * 2u32.pow(attempt),
            socket.recv(&mut recv_buf),
        )
        .await
        {
            Err(_elapsed) => continue,
            Ok(Err(e)) => return Err(TrackerError::Transport(e.to_string())),
            Ok(Ok(bytes_recv)) => {
                if bytes_recv < 20 {
                    return Err(TrackerError::Protocol(
                        "announce response shorter than 20 bytes".to_string(),
                    ));
                }
                let action = u32::from_be_bytes(recv_buf[0..4].try_into().expect("4 bytes"));
                if action != 1 {
                    return Err(TrackerError::Protocol(format!(
                        "announce response action was {action}, not 1"
                    )));
                }
                let recv_transaction_id =
                    u32::from_be_bytes(recv_buf[4..8].try_into().expect("4 bytes"));
                if recv_transaction_id != transaction_id {
                    return Err(TrackerError::Protocol(format!(
                        "announce response transaction id {recv_transaction_id} does not match the request ({transaction_id})"
                    )));
                }
                let interval = u32::from_be_bytes(recv_buf[8..12].try_into().expect("4 bytes"));
                let leechers = u32::from_be_bytes(recv_buf[12..16].try_into().expect("4 bytes"));
                let seeders = u32::from_be_bytes(recv_buf[16..20].try_into().expect("4 bytes"));

                if (bytes_recv - 20) % 6 != 0 {
                    return Err(TrackerError::Protocol(format!(
                        "announce response peer rows are not aligned to 6 bytes: {}",
                        bytes_recv - 20
                    )));
                }
                let peers = parse_compact_peers(&recv_buf[20..bytes_recv])
                    .map_err(TrackerError::Protocol)?;

                return Ok(Response::Ok(OkResponse {
                    warning_message: None,
                    interval: interval as i64,
                    min_interval: None,
                    tracker_id: None,
                    complete: seeders as i64,
                    incomplete: leechers as i64,
                    peers,
                }));
            }
        }
    }
    Err(TrackerError::Timeout)
}

pub fn is_supported_scheme(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("udp://")
}

/// Parses a bencoded HTTP announce response body.
pub fn parse_announce_response(body: &[u8]) -> Result<Response, TrackerError> {
    let response_map = match Value::new(body) {
        Value::Dict(m, _, _) => m,
        _ => {
            return Err(TrackerError::Protocol(
                "the server response was not a valid bencoded dict".to_string(),
            ))
        }
    };

    if let Some(Value::Str(failure_reason_vec)) = response_map.get(&b"failure reason".to_vec()) {
        return match str::from_utf8(failure_reason_vec) {
            Ok(f) => Ok(Response::Failure(f.to_string())),
            Err(_) => Err(TrackerError::Protocol(
                "failure reason provided but it is not an UTF8 string".to_string(),
            )),
        };
    }

    let warning_message = match response_map.get(&b"warning message".to_vec()) {
        Some(Value::Str(warning_message_vec)) => match str::from_utf8(warning_message_vec) {
            Ok(w) => Some(w.to_string()),
            Err(_) => {
                return Err(TrackerError::Protocol(
                    "warning message provided but it is not an UTF8 string".to_string(),
                ))
            }
        },
        _ => None,
    };

    let interval = match response_map.get(&b"interval".to_vec()) {
        Some(Value::Int(i)) => *i,
        _ => {
            return Err(TrackerError::Protocol(
                "interval key not provided or not a number".to_string(),
            ))
        }
    };

    let min_interval = match response_map.get(&b"min interval".to_vec()) {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    };

    let tracker_id = match response_map.get(&b"tracker id".to_vec()) {
        Some(Value::Str(tracker_id_vec)) => match str::from_utf8(tracker_id_vec) {
            Ok(w) => Some(w.to_string()),
            Err(_) => {
                return Err(TrackerError::Protocol(
                    "tracker id provided but it is not an UTF8 string".to_string(),
                ))
            }
        },
        _ => None,
    };

    // seeder / leecher counts are optional, many trackers omit them
    let complete = match response_map.get(&b"complete".to_vec()) {
        Some(Value::Int(i)) => *i,
        _ => 0,
    };
    let incomplete = match response_map.get(&b"incomplete".to_vec()) {
        Some(Value::Int(i)) => *i,
        _ => 0,
    };

    let peers = match response_map.get(&b"peers".to_vec()) {
        Some(Value::List(peers_list)) => {
            parse_dict_model_peers(peers_list).map_err(TrackerError::Protocol)?
        }
        Some(Value::Str(peers_bytes)) => {
            parse_compact_peers(peers_bytes).map_err(TrackerError::Protocol)?
        }
        _ => {
            return Err(TrackerError::Protocol(
                "peers key not provided or not a list or string".to_string(),
            ))
        }
    };

    Ok(Response::Ok(OkResponse {
        warning_message,
        interval,
        min_interval,
        tracker_id,
        complete,
        incomplete,
        peers,
    }))
}

fn parse_dict_model_peers(peers_values: &Vec<Value>) -> Result<Vec<Peer>, String> {
    let mut peers_list: Vec<Peer> = Vec::new();
    for v in peers_values {
        let peer_dict = match v {
            Value::Dict(d, _, _) => d,
            _ => return Err("peers list contains a value that is not a dict".to_string()),
        };

        let peer_id = match peer_dict.get(&b"peer id".to_vec()) {
            Some(Value::Str(peer_id_vec)) => str::from_utf8(peer_id_vec)
                .ok()
                .map(|s| s.to_string()),
            _ => None,
        };

        let ip = match peer_dict.get(&b"ip".to_vec()) {
            Some(Value::Str(ip_vec)) => match str::from_utf8(ip_vec) {
                Ok(i) => i.to_string(),
                Err(_) => return Err("peer ip is not an UTF8 string".to_string()),
            },
            _ => return Err("peer entry without a valid ip".to_string()),
        };

        let port = match peer_dict.get(&b"port".to_vec()) {
            Some(Value::Int(port_int)) => u16::try_from(*port_int)
                .map_err(|_| "peer entry with an out of range port".to_string())?,
            _ => return Err("peer entry without a valid port".to_string()),
        };

        peers_list.push(Peer { peer_id, ip, port });
    }
    Ok(peers_list)
}

fn parse_compact_peers(peers_bytes: &[u8]) -> Result<Vec<Peer>, String> {
    if peers_bytes.len() % 6 != 0 {
        return Err("compact peers string is not aligned to 6 bytes".to_string());
    }
    let mut peers_list: Vec<Peer> = Vec::new();
    for chunk in peers_bytes.chunks_exact(6) {
        let ip = format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        peers_list.push(Peer {
            peer_id: None,
            ip,
            port,
        });
    }
    Ok(peers_list)
}

fn url_encode_info_hash(binary_array: [u8; 20]) -> String {
    let mut url_encoded = "".to_string();
    for v in binary_array {
        url_encoded = url_encoded + &format!("%{:02X}", v)
    }
    url_encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_peer_conversion() {
        let byte_peers = [
            0x1, 0x2, 0x3, 0x4, /* ip 1.2.3.4 */ 0x00, 0x50, /* port 80 */
            0x5, 0x6, 0x7, 0x8, /* ip 5.6.7.8 */ 0x04, 0xbd, /* port 1213 */
        ];
        let peers_result = parse_compact_peers(&byte_peers);
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
        assert_matches!(peers_result, Ok(peers) => {
            assert_eq!(peers, expected)
        });
    }

    #[test]
    fn misaligned_compact_peers_are_rejected() {
        assert!(parse_compact_peers(&[0x1, 0x2, 0x3, 0x4, 0x00]).is_err());
    }

    #[test]
    fn parse_compact_announce_response() {
        let body = b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(
            response,
            Response::Ok(OkResponse {
                warning_message: None,
                interval: 1800,
                min_interval: None,
                tracker_id: None,
                complete: 0,
                incomplete: 0,
                peers: vec![Peer {
                    peer_id: None,
                    ip: "127.0.0.1".to_string(),
                    port: 6881,
                }],
            })
        );
    }

    #[test]
    fn parse_dict_model_announce_response() {
        let body =
            b"d8:completei5e10:incompletei3e8:intervali900e5:peersld2:ip9:10.0.0.424:porti6881eeee";
        let response = parse_announce_response(body).unwrap();
        assert_matches!(response, Response::Ok(ok) => {
            assert_eq!(ok.interval, 900);
            assert_eq!(ok.complete, 5);
            assert_eq!(ok.incomplete, 3);
            assert_eq!(ok.peers, vec![Peer { peer_id: None, ip: "10.0.0.42".to_string(), port: 6881 }]);
        });
    }

    #[test]
    fn parse_failure_reason() {
        let body = b"d14:failure reason15:torrent unknowne";
        assert_eq!(
            parse_announce_response(body).unwrap(),
            Response::Failure("torrent unknown".to_string())
        );
    }

    #[test]
    fn parse_garbage_is_a_protocol_error() {
        assert_matches!(
            parse_announce_response(b"not bencoded at all"),
            Err(TrackerError::Protocol(_))
        );
    }

    #[test]
    fn scheme_selection() {
        assert!(is_supported_scheme("http://tracker.test/announce"));
        assert!(is_supported_scheme("https://tracker.test/announce"));
        assert!(is_supported_scheme("udp://tracker.test:6969"));
        assert!(!is_supported_scheme("wss://tracker.test"));
        assert!(!is_supported_scheme("ftp://tracker.test"));
    }

    // a scripted udp tracker: answers the connect and announce requests with
    // well-formed responses carrying one peer
    async fn run_fake_udp_tracker(socket: UdpSocket) {
        let mut buf = [0u8; 1024];
        // connect
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[0..8], &UDP_PROTOCOL_MAGIC.to_be_bytes());
        assert_eq!(&buf[8..12], &0u32.to_be_bytes());
        let mut connect_resp = [0u8; 16];
        connect_resp[4..8].copy_from_slice(&buf[12..16]); // transaction id
        connect_resp[8..16].copy_from_slice(&0xdeadbeefu64.to_be_bytes());
        socket.send_to(&connect_resp, peer).await.unwrap();
        // announce
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 98);
        assert_eq!(&buf[0..8], &0xdeadbeefu64.to_be_bytes());
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        let mut announce_resp = Vec::new();
        announce_resp.extend_from_slice(&1u32.to_be_bytes()); // action
        announce_resp.extend_from_slice(&buf[12..16]); // transaction id
        announce_resp.extend_from_slice(&1200u32.to_be_bytes()); // interval
        announce_resp.extend_from_slice(&7u32.to_be_bytes()); // leechers
        announce_resp.extend_from_slice(&2u32.to_be_bytes()); // seeders
        announce_resp.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]); // one peer
        socket.send_to(&announce_resp, peer).await.unwrap();
    }

    #[tokio::test]
    async fn udp_announce_round_trip() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let server = tokio::spawn(run_fake_udp_tracker(server_socket));

        let mut client = TrackerClient::new(
            "-UW0001-123456789012".to_string(),
            vec![vec![format!("udp://{}", server_addr)]],
            6881,
        );
        let response = client
            .request([0x21; 20], 10, 20, 30, Event::Started)
            .await
            .unwrap();
        assert_matches!(response, Response::Ok(ok) => {
            assert_eq!(ok.interval, 1200);
            assert_eq!(ok.complete, 2);
            assert_eq!(ok.incomplete, 7);
            assert_eq!(ok.peers, vec![Peer { peer_id: None, ip: "127.0.0.1".to_string(), port: 6881 }]);
        });
        assert_eq!(client.tracker_request_interval, Duration::from_secs(1200));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn announce_with_no_usable_tracker() {
        let mut client = TrackerClient::new(
            "-UW0001-123456789012".to_string(),
            vec![vec!["wss://not.supported/".to_string()]],
            6881,
        );
        let err = client
            .request([0x21; 20], 0, 0, 0, Event::Started)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<NoTrackerError>().is_some());
    }
}
