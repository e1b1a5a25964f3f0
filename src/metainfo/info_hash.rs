use std::fmt;

use sha1::{Digest, Sha1};

use super::MetainfoError;

/// A torrent's 20-byte SHA1 info hash, its identity on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Hashes the bencoded bytes of an info dictionary.
    pub fn from_info_bytes(info_bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        Self(hasher.finalize().into())
    }

    /// Parses a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, MetainfoError> {
        if s.len() != 40 {
            return Err(MetainfoError::InvalidInfoHash);
        }
        let mut bytes = [0u8; 20];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| MetainfoError::InvalidInfoHash)?;
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Derives the MSE stream key hash, `SHA1("req2" || info_hash)`.
    ///
    /// An inbound encrypted handshake carries this value instead of the
    /// plain info hash; the listener uses it to select the torrent.
    pub fn skey_hash(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(b"req2");
        hasher.update(self.0);
        hasher.finalize().into()
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hex = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
        let hash = InfoHash::from_hex(hex).unwrap();
        assert_eq!(hash.to_hex(), hex);
        assert!(InfoHash::from_hex("c12f").is_err());
        assert!(InfoHash::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn skey_hash_prefixes_req2() {
        let hash = InfoHash::from_bytes([7; 20]);
        let mut hasher = Sha1::new();
        hasher.update(b"req2");
        hasher.update([7u8; 20]);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(hash.skey_hash(), expected);
        assert_ne!(&hash.skey_hash(), hash.as_bytes());
    }
}
