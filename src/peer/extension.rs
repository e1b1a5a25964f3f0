use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{self, Value};

/// Our local message id for the ut_metadata extension.
pub const UT_METADATA_ID: u8 = 1;

/// The BEP-10 extension handshake dictionary.
///
/// Only the fields this engine uses are modeled: the `m` extension map and
/// `metadata_size`, which ut_metadata needs before the first request.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub metadata_size: Option<u32>,
}

impl ExtensionHandshake {
    /// The handshake we send: ut_metadata under our local id, plus the
    /// metadata size once the info dictionary is known.
    pub fn ours(metadata_size: Option<u32>) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert("ut_metadata".to_string(), UT_METADATA_ID);
        Self {
            extensions,
            metadata_size,
        }
    }

    /// The peer's message id for ut_metadata, when advertised.
    pub fn ut_metadata(&self) -> Option<u8> {
        self.extensions.get("ut_metadata").copied()
    }

    pub fn encode(&self) -> Bytes {
        let mut m = BTreeMap::new();
        for (name, ext_id) in &self.extensions {
            m.insert(name.clone().into_bytes(), Value::Int(*ext_id as i64));
        }
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Int(size as i64));
        }
        Bytes::from(bencode::encode(&Value::Dict(dict)))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = bencode::decode(payload)?;
        let mut hs = Self::default();
        if let Some(m) = value.get(b"m").and_then(Value::as_dict) {
            for (name, ext_id) in m {
                let (Ok(name), Some(ext_id)) = (std::str::from_utf8(name), ext_id.as_int()) else {
                    continue;
                };
                // id 0 means the peer disabled the extension
                if (1..=255).contains(&ext_id) {
                    hs.extensions.insert(name.to_string(), ext_id as u8);
                }
            }
        }
        hs.metadata_size = value
            .get_int(b"metadata_size")
            .filter(|n| *n > 0)
            .map(|n| n as u32);
        Ok(hs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_metadata_size() {
        let hs = ExtensionHandshake::ours(Some(31337));
        let back = ExtensionHandshake::decode(&hs.encode()).unwrap();
        assert_eq!(back.ut_metadata(), Some(UT_METADATA_ID));
        assert_eq!(back.metadata_size, Some(31337));
    }

    #[test]
    fn disabled_extension_is_dropped() {
        let back =
            ExtensionHandshake::decode(b"d1:md11:ut_metadatai0eee").unwrap();
        assert_eq!(back.ut_metadata(), None);
        assert_eq!(back.metadata_size, None);
    }
}
