//! License key generation and trial fingerprinting.

use rand::Rng;
use rusqlite::Connection;

use crate::db::queries;
use crate::error::Result;

const KEY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const DEFAULT_KEY_PREFIX: &str = "LIC";

/// Upper-cased family name with everything but ASCII letters and digits removed.
pub fn key_prefix(family: &str) -> String {
    let prefix: String = family
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if prefix.is_empty() {
        DEFAULT_KEY_PREFIX.to_string()
    } else {
        prefix
    }
}

/// `<PREFIX>-XXXX-XXXX-XXXX` with a random body.
pub fn generate_key(family: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut part = || -> String {
        (0..4)
            .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
            .collect()
    };

    format!("{}-{}-{}-{}", key_prefix(family), part(), part(), part())
}

/// Canonical MAC form: trimmed, upper-case, colon-separated.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let mac = mac.trim().to_ascii_uppercase().replace('-', ":");
    if mac.is_empty() { None } else { Some(mac) }
}

/// Whether this e-mail or MAC already had a trial in the family.
///
/// Either credential alone is enough to match, so changing one of them does
/// not buy a second trial.
pub fn trial_fingerprint_exists(
    conn: &Connection,
    email: &str,
    mac_address: Option<&str>,
    family: &str,
) -> Result<bool> {
    let mac = mac_address.and_then(normalize_mac);
    queries::trial_fingerprint_match(conn, email.trim(), mac.as_deref(), family)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_has_family_prefix_and_three_groups() {
        let key = generate_key("Grid Tools 2");
        let parts: Vec<&str> = key.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "GRIDTOOLS2");
        for group in &parts[1..] {
            assert_eq!(group.len(), 4);
            assert!(group.bytes().all(|b| KEY_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn empty_prefix_falls_back() {
        assert_eq!(key_prefix("--- !"), "LIC");
        assert!(generate_key("").starts_with("LIC-"));
    }

    #[test]
    fn keys_are_not_repeated() {
        let a = generate_key("grid");
        let b = generate_key("grid");
        assert_ne!(a, b);
    }

    #[test]
    fn mac_is_normalized() {
        assert_eq!(normalize_mac(" aa-bb-cc-dd-ee-ff "), Some("AA:BB:CC:DD:EE:FF".into()));
        assert_eq!(normalize_mac("   "), None);
    }
}
