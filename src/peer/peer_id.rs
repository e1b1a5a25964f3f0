use std::fmt;

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// A 20-byte peer identity (Azureus-style prefix + random suffix).
///
/// The session keys all per-peer state by this value; duplicates connecting
/// from different addresses are collapsed, first connection wins.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX.as_bytes());
        rand::rng().fill(&mut id[8..]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Print the client prefix readably, the random tail as hex.
        if self.0[0] == b'-' && self.0[7] == b'-' {
            if let Ok(prefix) = std::str::from_utf8(&self.0[..8]) {
                write!(f, "PeerId({}", prefix)?;
                for b in &self.0[8..12] {
                    write!(f, "{:02x}", b)?;
                }
                return write!(f, "..)");
            }
        }
        write!(f, "PeerId({:02x?}..)", &self.0[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(&a.0[..8], CLIENT_PREFIX.as_bytes());
    }
}
