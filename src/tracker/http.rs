use std::time::Duration;

use reqwest::Client;

use super::error::TrackerError;
use super::response::{parse_compact_peers, parse_compact_peers6, AnnounceResponse};
use super::AnnounceParams;
use crate::bencode::{self, Value};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// An HTTP(S) tracker ([BEP-3]): a GET with query parameters, answered by
/// a bencoded dictionary.
///
/// [BEP-3]: http://bittorrent.org/beps/bep_0003.html
#[derive(Debug)]
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(
        &self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, TrackerError> {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&numwant={}&compact=1",
            self.url,
            separator,
            percent_encode(&params.info_hash),
            percent_encode(params.peer_id.as_bytes()),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.num_want,
        );
        let event = params.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }

        let body = self.client.get(&url).send().await?.bytes().await?;
        parse_announce_body(&body)
    }
}

fn parse_announce_body(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let root = bencode::decode(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict".into()));
    }

    if let Some(reason) = root.get_str(b"failure reason") {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let mut response = AnnounceResponse {
        interval: root
            .get_int(b"interval")
            .filter(|n| *n > 0)
            .map(|n| Duration::from_secs(n as u64)),
        min_interval: root
            .get_int(b"min interval")
            .filter(|n| *n > 0)
            .map(|n| Duration::from_secs(n as u64)),
        seeders: root.get_int(b"complete").map(|n| n as u32),
        leechers: root.get_int(b"incomplete").map(|n| n as u32),
        ..Default::default()
    };

    match root.get(b"peers") {
        // BEP-23 compact form
        Some(Value::Str(bytes)) => response.peers = parse_compact_peers(bytes),
        // original dictionary form
        Some(Value::List(list)) => {
            for peer in list {
                let ip = peer.get_str(b"ip").and_then(|s| s.parse().ok());
                let port = peer.get_int(b"port").map(|p| p as u16);
                if let (Some(ip), Some(port)) = (ip, port) {
                    response.peers.push(std::net::SocketAddr::new(ip, port));
                }
            }
        }
        _ => {}
    }
    if let Some(bytes) = root.get_bytes(b"peers6") {
        response.peers.extend(parse_compact_peers6(bytes));
    }

    Ok(response)
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_compact_response() {
        let body = b"d8:completei5e10:incompletei9e8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let resp = parse_announce_body(body).unwrap();
        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(resp.seeders, Some(5));
        assert_eq!(resp.leechers, Some(9));
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn parse_dict_peers() {
        let body = b"d8:intervali60e5:peersld2:ip9:10.0.0.424:porti81eeee";
        let resp = parse_announce_body(body).unwrap();
        assert_eq!(resp.peers, vec!["10.0.0.42:81".parse().unwrap()]);
    }

    #[test]
    fn failure_reason_is_an_error() {
        let body = b"d14:failure reason12:unregisterede";
        assert!(matches!(
            parse_announce_body(body),
            Err(TrackerError::Failure(reason)) if reason == "unregistered"
        ));
    }

    #[test]
    fn percent_encoding_is_uppercase_hex() {
        assert_eq!(percent_encode(b"a-1"), "a-1");
        assert_eq!(percent_encode(&[0x00, 0xff]), "%00%FF");
    }
}
