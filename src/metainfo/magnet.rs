use super::{InfoHash, MetainfoError};

/// A parsed magnet link ([BEP-9]).
///
/// Magnet links carry the info hash without the metainfo; a session built
/// from one starts in the info-acquisition phase and downloads the info
/// dictionary from peers.
///
/// [BEP-9]: http://bittorrent.org/beps/bep_0009.html
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    /// Tracker URLs from `tr` parameters.
    pub trackers: Vec<String>,
    /// Webseed URLs from `ws` parameters.
    pub webseed_urls: Vec<String>,
}

impl MagnetLink {
    /// Parses a `magnet:?xt=urn:btih:...` URI.
    ///
    /// The info hash may be hex (40 chars) or base32 (32 chars). `dn`,
    /// `tr`, and `ws` parameters are percent-decoded; everything else is
    /// ignored.
    pub fn parse(uri: &str) -> Result<Self, MetainfoError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| MetainfoError::InvalidMagnetLink("missing magnet:? prefix".into()))?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut webseed_urls = Vec::new();

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key {
                "xt" => {
                    let hash = value.strip_prefix("urn:btih:").ok_or_else(|| {
                        MetainfoError::InvalidMagnetLink("unsupported xt format".into())
                    })?;
                    info_hash = Some(parse_btih(hash)?);
                }
                "dn" => display_name = Some(percent_decode(value)),
                "tr" => trackers.push(percent_decode(value)),
                "ws" => webseed_urls.push(percent_decode(value)),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash
                .ok_or_else(|| MetainfoError::InvalidMagnetLink("missing xt parameter".into()))?,
            display_name,
            trackers,
            webseed_urls,
        })
    }
}

fn parse_btih(hash: &str) -> Result<InfoHash, MetainfoError> {
    match hash.len() {
        40 => InfoHash::from_hex(hash),
        32 => {
            let bytes = base32_decode(hash)
                .ok_or_else(|| MetainfoError::InvalidMagnetLink("invalid base32".into()))?;
            let mut arr = [0u8; 20];
            if bytes.len() != 20 {
                return Err(MetainfoError::InvalidInfoHash);
            }
            arr.copy_from_slice(&bytes);
            Ok(InfoHash::from_bytes(arr))
        }
        _ => Err(MetainfoError::InvalidMagnetLink(
            "invalid info hash length".into(),
        )),
    }
}

fn percent_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer = 0u64;
    let mut bits = 0u32;
    for c in input.trim_end_matches('=').bytes() {
        let value = ALPHABET.iter().position(|&a| a == c.to_ascii_uppercase())? as u64;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn parse_hex_link() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=An+Example&tr=http%3A%2F%2Ftracker.example%2Fann",
            HEX
        );
        let magnet = MagnetLink::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash.to_hex(), HEX);
        assert_eq!(magnet.display_name.as_deref(), Some("An Example"));
        assert_eq!(magnet.trackers, vec!["http://tracker.example/ann"]);
    }

    #[test]
    fn parse_base32_link() {
        // base32 of the same 20 bytes as HEX
        let b32 = "YEX6DQDLXISUVHOJ6UM3GNNKPQJWPKEK";
        let magnet = MagnetLink::parse(&format!("magnet:?xt=urn:btih:{}", b32)).unwrap();
        assert_eq!(magnet.info_hash.to_hex(), HEX);
    }

    #[test]
    fn missing_xt_is_an_error() {
        assert!(MagnetLink::parse("magnet:?dn=name").is_err());
        assert!(MagnetLink::parse("http://example").is_err());
    }
}
