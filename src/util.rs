use core::str;
use std::ascii;

use rand::Rng;
use sha1::{Digest, Sha1};

pub fn force_string(v: &[u8]) -> String {
    match str::from_utf8(v) {
        Ok(s) => s.to_string(),
        Err(_) => format!(
            "<non_utf-8>{}",
            v.iter()
                .flat_map(|b| ascii::escape_default(*b))
                .map(char::from)
                .collect::<String>()
        ),
    }
}

pub fn pretty_info_hash(info_hash: [u8; 20]) -> String {
    hex::encode(info_hash)
}

pub fn sha1_hash(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}

/// Azureus-style peer id: client tag and version followed by random digits.
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::rng();
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-YT0002-");
    for b in peer_id[8..].iter_mut() {
        *b = rng.random_range(b'0'..=b'9');
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_string_escapes_binary() {
        assert_eq!(force_string(b"hello"), "hello");
        assert_eq!(force_string(&[0xff, b'a']), "<non_utf-8>\\xffa");
    }

    #[test]
    fn peer_id_format() {
        let id = generate_peer_id();
        assert!(id.starts_with(b"-YT0002-"));
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }
}
