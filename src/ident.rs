//! Identifier hashing and UUID text utilities.

use uuid::Uuid;

/// Fixed-width key derived from a textual identifier, used for cache and
/// map indexing.
///
/// Identifiers that hash equal share a cache slot; no collision detection
/// or string reconciliation is performed. Known limitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// djb2 over the identifier bytes.
    pub fn of(id: &str) -> Self {
        let mut hash: u64 = 5381;
        for byte in id.bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
        }
        CacheKey(hash)
    }
}

/// Parses a textual UUID into its 128-bit form.
///
/// Scans hex digits only and skips every other character, so braces, dashes
/// and mixed case are all accepted. Exactly 32 digits must be present.
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let mut value: u128 = 0;
    let mut digits = 0;
    for c in text.chars() {
        if let Some(digit) = c.to_digit(16) {
            if digits == 32 {
                return None;
            }
            value = (value << 4) | digit as u128;
            digits += 1;
        }
    }
    if digits == 32 {
        Some(Uuid::from_u128(value))
    } else {
        None
    }
}

/// Renders a 48-bit radio address as "AA:BB:CC:DD:EE:FF".
pub fn format_bluetooth_address(address: u64) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        (address >> 40) & 0xff,
        (address >> 32) & 0xff,
        (address >> 24) & 0xff,
        (address >> 16) & 0xff,
        (address >> 8) & 0xff,
        address & 0xff,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_stable() {
        assert_eq!(CacheKey::of("abc"), CacheKey::of("abc"));
        assert_ne!(CacheKey::of("abc"), CacheKey::of("abd"));
    }

    #[test]
    fn test_parse_uuid_accepts_separators() {
        let canonical = parse_uuid("0000180d-0000-1000-8000-00805f9b34fb").unwrap();
        let braced = parse_uuid("{0000180D-0000-1000-8000-00805F9B34FB}").unwrap();
        let bare = parse_uuid("0000180d00001000800000805f9b34fb").unwrap();
        assert_eq!(canonical, braced);
        assert_eq!(canonical, bare);
        assert_eq!(
            canonical.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_parse_uuid_rejects_wrong_length() {
        assert!(parse_uuid("180d").is_none());
        assert!(parse_uuid("").is_none());
        assert!(parse_uuid("0000180d-0000-1000-8000-00805f9b34fb00").is_none());
    }

    #[test]
    fn test_format_bluetooth_address() {
        assert_eq!(
            format_bluetooth_address(0xAABBCCDDEEFF),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(format_bluetooth_address(0x1), "00:00:00:00:00:01");
    }
}
