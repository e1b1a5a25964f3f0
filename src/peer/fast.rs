use std::net::IpAddr;

use sha1::{Digest, Sha1};

/// Computes the allowed-fast set for a peer ([BEP-6]).
///
/// The set is a deterministic function of the masked peer IP and the info
/// hash, so both sides derive the same pieces: hash `ip/24 || info_hash`,
/// read the digest as big-endian u32 piece indices modulo the piece count,
/// and rehash the digest until `set_size` distinct indices are collected.
///
/// [BEP-6]: http://bittorrent.org/beps/bep_0006.html
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: usize,
) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(num_pieces as usize);

    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&ip_bytes);
    x.extend_from_slice(info_hash);

    let mut set = Vec::with_capacity(set_size);
    while set.len() < set_size {
        let digest = Sha1::digest(&x);
        for chunk in digest.chunks_exact(4) {
            if set.len() >= set_size {
                break;
            }
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;
            if !set.contains(&index) {
                set.push(index);
            }
        }
        x = digest.to_vec();
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn deterministic_and_distinct() {
        let hash = [0xaa; 20];
        let ip = IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200));
        let a = generate_allowed_fast_set(&hash, ip, 1000, 10);
        let b = generate_allowed_fast_set(&hash, ip, 1000, 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        let mut dedup = a.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), 10);
    }

    #[test]
    fn masks_low_ip_octet() {
        let hash = [0xaa; 20];
        let a = generate_allowed_fast_set(&hash, IpAddr::V4(Ipv4Addr::new(80, 4, 4, 1)), 100, 5);
        let b = generate_allowed_fast_set(&hash, IpAddr::V4(Ipv4Addr::new(80, 4, 4, 99)), 100, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn bounded_by_piece_count() {
        let hash = [1; 20];
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(generate_allowed_fast_set(&hash, ip, 0, 10).is_empty());
        assert_eq!(generate_allowed_fast_set(&hash, ip, 3, 10).len(), 3);
    }
}
