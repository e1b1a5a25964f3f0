//! Torrent metainfo ([BEP-3], [BEP-9], [BEP-19]).
//!
//! A `.torrent` file is a bencoded dictionary with an `info` dictionary
//! (name, piece length, piece hashes, file list) plus announce URLs and
//! optional webseed URLs. [`Metainfo::parse`] reads the whole file;
//! [`Info::from_bytes`] reads a bare info dictionary, which is also what
//! the metadata extension downloads for magnet links.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html
//! [BEP-19]: http://bittorrent.org/beps/bep_0019.html

mod info;
mod info_hash;
mod magnet;

pub use info::{FileEntry, Info};
pub use info_hash::InfoHash;
pub use magnet::MagnetLink;

use thiserror::Error;

use crate::bencode::{self, Value};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("piece hashes length is not a multiple of 20")]
    InvalidPieceHashes,

    #[error("unsafe file path: {0}")]
    UnsafePath(String),

    #[error("invalid info hash")]
    InvalidInfoHash,

    #[error("invalid magnet link: {0}")]
    InvalidMagnetLink(String),
}

/// A parsed `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    /// Tracker URLs, `announce-list` tiers flattened in order, `announce`
    /// appended as a fallback when no list is present.
    pub trackers: Vec<String>,
    /// Webseed URLs from `url-list` (BEP-19).
    pub webseed_urls: Vec<String>,
}

impl Metainfo {
    pub fn parse(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = bencode::decode(data)?;
        let info_value = root.get(b"info").ok_or(MetainfoError::MissingField("info"))?;

        // The info dictionary is re-encoded to recover its exact bytes for
        // hashing. Bencode dictionaries are canonical, so this round-trips.
        let info_raw = bencode::encode(info_value);
        let info = Info::from_bytes(&info_raw)?;

        let mut trackers = Vec::new();
        if let Some(tiers) = root.get(b"announce-list").and_then(Value::as_list) {
            for tier in tiers {
                for url in tier.as_list().unwrap_or_default() {
                    if let Some(url) = url.as_str() {
                        if !trackers.iter().any(|t| t == url) {
                            trackers.push(url.to_string());
                        }
                    }
                }
            }
        }
        if trackers.is_empty() {
            if let Some(announce) = root.get_str(b"announce") {
                trackers.push(announce.to_string());
            }
        }

        let mut webseed_urls = Vec::new();
        match root.get(b"url-list") {
            Some(Value::List(urls)) => {
                for url in urls {
                    if let Some(url) = url.as_str() {
                        webseed_urls.push(url.to_string());
                    }
                }
            }
            Some(Value::Str(_)) => {
                if let Some(url) = root.get_str(b"url-list") {
                    webseed_urls.push(url.to_string());
                }
            }
            _ => {}
        }

        Ok(Self {
            info,
            trackers,
            webseed_urls,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let pieces: Vec<u8> = (0..40).collect(); // 2 piece hashes
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce26:http://tracker.example/ann");
        data.extend_from_slice(b"8:url-listl24:http://mirror.example/f/e");
        data.extend_from_slice(b"4:infod6:lengthi25000e4:name4:file12:piece lengthi16384e6:pieces40:");
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn parse_single_file() {
        let m = Metainfo::parse(&single_file_torrent()).unwrap();
        assert_eq!(m.trackers, vec!["http://tracker.example/ann"]);
        assert_eq!(m.webseed_urls, vec!["http://mirror.example/f/"]);
        assert_eq!(m.info.name, "file");
        assert_eq!(m.info.total_length, 25000);
        assert_eq!(m.info.piece_count(), 2);
        assert!(!m.info.multi_file);
    }

    #[test]
    fn info_hash_matches_raw_bytes() {
        let data = single_file_torrent();
        let m = Metainfo::parse(&data).unwrap();
        // Hashing the info slice of the original document gives the same hash.
        let start = data.windows(7).position(|w| w == b"4:infod").unwrap() + 6;
        let end = data.len() - 1; // final 'e' closes the root dict
        let expected = InfoHash::from_info_bytes(&data[start..end]);
        assert_eq!(m.info_hash(), expected);
    }

    #[test]
    fn missing_info_is_an_error() {
        assert!(matches!(
            Metainfo::parse(b"d8:announce3:urle"),
            Err(MetainfoError::MissingField("info"))
        ));
    }
}
