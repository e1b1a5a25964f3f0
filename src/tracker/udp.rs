use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse};
use super::AnnounceParams;

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;

/// Connection ids expire after one minute per BEP-15.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// A UDP tracker ([BEP-15]): a connect exchange yielding a connection id,
/// then binary announce requests over the same socket.
///
/// [BEP-15]: http://bittorrent.org/beps/bep_0015.html
#[derive(Debug)]
pub struct UdpTracker {
    url: String,
    host: String,
    connection: Option<Connection>,
}

#[derive(Debug)]
struct Connection {
    socket: UdpSocket,
    id: u64,
    obtained_at: Instant,
}

impl UdpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        let rest = url
            .strip_prefix("udp://")
            .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
        let host = rest.split('/').next().unwrap_or(rest);
        if host.is_empty() {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }
        Ok(Self {
            url: url.to_string(),
            host: host.to_string(),
            connection: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, TrackerError> {
        let conn = self.connection().await?;

        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(98);
        request.extend_from_slice(&conn.id.to_be_bytes());
        request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        request.extend_from_slice(&params.info_hash);
        request.extend_from_slice(params.peer_id.as_bytes());
        request.extend_from_slice(&params.downloaded.to_be_bytes());
        request.extend_from_slice(&params.left.to_be_bytes());
        request.extend_from_slice(&params.uploaded.to_be_bytes());
        request.extend_from_slice(&params.event.as_udp_code().to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes()); // IP, 0 = sender address
        request.extend_from_slice(&key.to_be_bytes());
        request.extend_from_slice(&params.num_want.to_be_bytes());
        request.extend_from_slice(&params.port.to_be_bytes());

        let response = exchange(&conn.socket, &request, 20).await;
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                // the connection id may have gone stale on the tracker side
                self.connection = None;
                return Err(err);
            }
        };

        let action = read_u32(&response, 0);
        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&response[8..]).into_owned();
            return Err(TrackerError::Failure(message));
        }
        if action != ACTION_ANNOUNCE || read_u32(&response, 4) != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "announce response mismatch".into(),
            ));
        }

        let interval = read_u32(&response, 8);
        Ok(AnnounceResponse {
            interval: (interval > 0).then(|| Duration::from_secs(interval as u64)),
            min_interval: None,
            leechers: Some(read_u32(&response, 12)),
            seeders: Some(read_u32(&response, 16)),
            peers: parse_compact_peers(&response[20..]),
        })
    }

    /// Returns a live connection, performing the connect exchange when
    /// there is none or the id has expired.
    async fn connection(&mut self) -> Result<&Connection, TrackerError> {
        let expired = self
            .connection
            .as_ref()
            .is_none_or(|c| c.obtained_at.elapsed() >= CONNECTION_ID_TTL);
        if expired {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            let addr: SocketAddr = tokio::net::lookup_host(&self.host)
                .await?
                .next()
                .ok_or_else(|| TrackerError::InvalidUrl(self.host.clone()))?;
            socket.connect(addr).await?;

            let transaction_id: u32 = rand::rng().random();
            let mut request = Vec::with_capacity(16);
            request.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
            request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            request.extend_from_slice(&transaction_id.to_be_bytes());

            let response = exchange(&socket, &request, 16).await?;
            if read_u32(&response, 0) != ACTION_CONNECT
                || read_u32(&response, 4) != transaction_id
            {
                return Err(TrackerError::InvalidResponse(
                    "connect response mismatch".into(),
                ));
            }
            let mut id = [0u8; 8];
            id.copy_from_slice(&response[8..16]);

            self.connection = Some(Connection {
                socket,
                id: u64::from_be_bytes(id),
                obtained_at: Instant::now(),
            });
        }
        Ok(self.connection.as_ref().expect("connection just ensured"))
    }
}

async fn exchange(
    socket: &UdpSocket,
    request: &[u8],
    min_response: usize,
) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 4096];
    for attempt in 0..MAX_RETRIES {
        socket.send(request).await?;
        match timeout(REQUEST_TIMEOUT * (1 << attempt), socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= min_response => return Ok(buf[..n].to_vec()),
            Ok(Ok(_)) => {
                return Err(TrackerError::InvalidResponse("response too short".into()))
            }
            Ok(Err(err)) => return Err(TrackerError::Io(err)),
            Err(_) => continue,
        }
    }
    Err(TrackerError::Timeout)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        let t = UdpTracker::new("udp://tracker.example:6969/announce").unwrap();
        assert_eq!(t.host, "tracker.example:6969");
        assert!(UdpTracker::new("udp://").is_err());
        assert!(UdpTracker::new("http://x").is_err());
    }

    #[tokio::test]
    async fn announce_against_scripted_tracker() {
        // A scripted one-client tracker: answer connect, then announce
        // with one peer.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let serve = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 16);
            assert_eq!(read_u32(&buf, 8), ACTION_CONNECT);
            let tid = &buf[12..16].to_vec();
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(tid);
            reply.extend_from_slice(&0xdeadbeefu64.to_be_bytes());
            server.send_to(&reply, from).await.unwrap();

            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 98);
            assert_eq!(read_u32(&buf, 8), ACTION_ANNOUNCE);
            let tid = &buf[12..16].to_vec();
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
            reply.extend_from_slice(tid);
            reply.extend_from_slice(&1800u32.to_be_bytes());
            reply.extend_from_slice(&3u32.to_be_bytes()); // leechers
            reply.extend_from_slice(&7u32.to_be_bytes()); // seeders
            reply.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
            server.send_to(&reply, from).await.unwrap();
        });

        let mut tracker = UdpTracker::new(&format!("udp://{}", server_addr)).unwrap();
        let params = AnnounceParams {
            info_hash: [1; 20],
            peer_id: crate::peer::PeerId::generate(),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: crate::tracker::TrackerEvent::Started,
            num_want: 50,
        };
        let resp = tracker.announce(&params).await.unwrap();
        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(resp.seeders, Some(7));
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        serve.await.unwrap();
    }
}
