use std::path::{Component, PathBuf};

use bytes::Bytes;

use super::{InfoHash, MetainfoError};
use crate::bencode::{self, Value};

/// One file of the torrent's content, with its byte offset in the
/// concatenated layout.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the download root, `name` included.
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// The parsed `info` dictionary.
///
/// Holds the canonical bencoded bytes alongside the parsed fields so the
/// info hash can be recomputed and the dictionary served to peers over the
/// metadata extension.
#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    /// True when the torrent declares a `files` list (directory layout).
    pub multi_file: bool,
    /// Concatenated 20-byte piece hashes.
    hashes: Bytes,
    /// Canonical bencoded info dictionary.
    raw: Bytes,
}

impl Info {
    /// Parses a bare bencoded info dictionary.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, MetainfoError> {
        let value = bencode::decode(raw)?;

        let name = value
            .get_str(b"name")
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = value
            .get_int(b"piece length")
            .filter(|n| *n > 0)
            .ok_or(MetainfoError::InvalidField("piece length"))? as u32;

        let hashes = value
            .get_bytes(b"pieces")
            .ok_or(MetainfoError::MissingField("pieces"))?
            .clone();
        if hashes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieceHashes);
        }

        let (files, multi_file) = match value.get(b"files") {
            Some(Value::List(entries)) => {
                let mut files = Vec::with_capacity(entries.len());
                let mut offset = 0u64;
                for entry in entries {
                    let length = entry
                        .get_int(b"length")
                        .filter(|n| *n >= 0)
                        .ok_or(MetainfoError::InvalidField("files.length"))?
                        as u64;
                    let parts = entry
                        .get(b"path")
                        .and_then(Value::as_list)
                        .ok_or(MetainfoError::MissingField("files.path"))?;
                    let mut path = PathBuf::from(&name);
                    for part in parts {
                        let part = part
                            .as_str()
                            .ok_or(MetainfoError::InvalidField("files.path"))?;
                        path.push(part);
                    }
                    check_path(&path)?;
                    files.push(FileEntry {
                        path,
                        length,
                        offset,
                    });
                    offset += length;
                }
                (files, true)
            }
            _ => {
                let length = value
                    .get_int(b"length")
                    .filter(|n| *n >= 0)
                    .ok_or(MetainfoError::MissingField("length"))? as u64;
                let path = PathBuf::from(&name);
                check_path(&path)?;
                (
                    vec![FileEntry {
                        path,
                        length,
                        offset: 0,
                    }],
                    false,
                )
            }
        };

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length as u64);
        if hashes.len() as u64 / 20 != expected_pieces {
            return Err(MetainfoError::InvalidPieceHashes);
        }

        Ok(Self {
            name,
            piece_length,
            total_length,
            files,
            multi_file,
            hashes,
            raw: Bytes::copy_from_slice(raw),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        InfoHash::from_info_bytes(&self.raw)
    }

    /// The canonical bencoded dictionary, served over the metadata extension.
    pub fn raw_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn piece_count(&self) -> u32 {
        (self.hashes.len() / 20) as u32
    }

    pub fn piece_hash(&self, index: u32) -> [u8; 20] {
        let start = index as usize * 20;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.hashes[start..start + 20]);
        hash
    }

    /// Byte offset of a piece in the concatenated file layout.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Length of a piece; the last piece covers the remainder.
    pub fn piece_length_at(&self, index: u32) -> u32 {
        let offset = self.piece_offset(index);
        (self.total_length - offset).min(self.piece_length as u64) as u32
    }
}

fn check_path(path: &PathBuf) -> Result<(), MetainfoError> {
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if safe && !path.as_os_str().is_empty() {
        Ok(())
    } else {
        Err(MetainfoError::UnsafePath(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_info(total: u64, piece_length: u32) -> Vec<u8> {
        let pieces = total.div_ceil(piece_length as u64) as usize;
        let mut data = Vec::new();
        data.extend_from_slice(
            format!(
                "d6:lengthi{}e4:name1:f12:piece lengthi{}e6:pieces{}:",
                total,
                piece_length,
                pieces * 20
            )
            .as_bytes(),
        );
        data.extend_from_slice(&vec![0xab; pieces * 20]);
        data.push(b'e');
        data
    }

    #[test]
    fn last_piece_is_short() {
        let info = Info::from_bytes(&build_info(40000, 16384)).unwrap();
        assert_eq!(info.piece_count(), 3);
        assert_eq!(info.piece_length_at(0), 16384);
        assert_eq!(info.piece_length_at(1), 16384);
        assert_eq!(info.piece_length_at(2), 40000 - 2 * 16384);
    }

    #[test]
    fn exact_multiple_has_full_last_piece() {
        let info = Info::from_bytes(&build_info(32768, 16384)).unwrap();
        assert_eq!(info.piece_count(), 2);
        assert_eq!(info.piece_length_at(1), 16384);
    }

    #[test]
    fn empty_torrent_has_no_pieces() {
        let info = Info::from_bytes(&build_info(0, 16384)).unwrap();
        assert_eq!(info.piece_count(), 0);
        assert_eq!(info.total_length, 0);
    }

    #[test]
    fn multi_file_offsets_accumulate() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d5:filesl");
        data.extend_from_slice(b"d6:lengthi5e4:pathl1:aee");
        data.extend_from_slice(b"d6:lengthi11e4:pathl3:dir1:bee");
        data.extend_from_slice(b"e4:name1:t12:piece lengthi16e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.push(b'e');
        let info = Info::from_bytes(&data).unwrap();
        assert!(info.multi_file);
        assert_eq!(info.total_length, 16);
        assert_eq!(info.files[0].offset, 0);
        assert_eq!(info.files[1].offset, 5);
        assert_eq!(info.files[1].path, PathBuf::from("t/dir/b"));
    }

    #[test]
    fn rejects_path_traversal() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d5:filesl");
        data.extend_from_slice(b"d6:lengthi16e4:pathl2:..6:escapeee");
        data.extend_from_slice(b"e4:name1:t12:piece lengthi16e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.push(b'e');
        assert!(matches!(
            Info::from_bytes(&data),
            Err(MetainfoError::UnsafePath(_))
        ));
    }

    #[test]
    fn hash_count_must_match_length() {
        let mut data = build_info(40000, 16384);
        // Corrupt the declared length without touching the hash count.
        let pos = data.windows(7).position(|w| w == b"i40000e").unwrap();
        data.splice(pos..pos + 7, b"i90000e".iter().copied());
        assert!(matches!(
            Info::from_bytes(&data),
            Err(MetainfoError::InvalidPieceHashes)
        ));
    }
}
