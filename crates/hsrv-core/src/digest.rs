//! Digest codec
//!
//! A digest travels as 32 hex characters and is stored as a [`BinaryKey`]:
//! two `u64` words holding the high and low halves. Comparing two keys is
//! two integer compares instead of a string compare.

use crate::error::{Error, Result};

/// Length of a digest in hex characters
pub const DIGEST_LEN: usize = 32;

/// Hex characters per 64-bit half
const HALF_LEN: usize = DIGEST_LEN / 2;

/// Name of the digest algorithm served
pub const ALGORITHM: &str = "md5";

/// Compact form of a digest, ordered lexicographically on `(high, low)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinaryKey {
    pub high: u64,
    pub low: u64,
}

impl BinaryKey {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Parse a hex digest, case-insensitive
    pub fn encode(digest: &str) -> Result<Self> {
        if !is_well_formed(digest) {
            return Err(Error::MalformedDigest(digest.to_string()));
        }

        let (high, low) = digest.split_at(HALF_LEN);
        let high = u64::from_str_radix(high, 16)
            .map_err(|_| Error::MalformedDigest(digest.to_string()))?;
        let low = u64::from_str_radix(low, 16)
            .map_err(|_| Error::MalformedDigest(digest.to_string()))?;

        Ok(Self { high, low })
    }

    /// Canonical uppercase hex form
    pub fn decode(&self) -> String {
        format!("{:016X}{:016X}", self.high, self.low)
    }
}

impl std::str::FromStr for BinaryKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::encode(s)
    }
}

impl std::fmt::Display for BinaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}{:016X}", self.high, self.low)
    }
}

/// True if `digest` has exactly the digest length and only hex characters.
pub fn is_well_formed(digest: &str) -> bool {
    digest.len() == DIGEST_LEN && digest.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_splits_halves() {
        let key = BinaryKey::encode("0123456789abcdefFEDCBA9876543210").unwrap();
        assert_eq!(key.high, 0x0123_4567_89AB_CDEF);
        assert_eq!(key.low, 0xFEDC_BA98_7654_3210);
    }

    #[test]
    fn test_decode_uppercases_and_pads() {
        let digest = "00000000000000ff000000000000000a";
        let key = BinaryKey::encode(digest).unwrap();
        assert_eq!(key.decode(), digest.to_uppercase());
        assert_eq!(BinaryKey::new(0, 1).decode(), "00000000000000000000000000000001");
    }

    #[test]
    fn test_round_trip_is_case_insensitive() {
        for digest in [
            "d41d8cd98f00b204e9800998ecf8427e",
            "D41D8CD98F00B204E9800998ECF8427E",
            "ffffffffffffffffffffffffffffffff",
            "00000000000000000000000000000000",
        ] {
            let key: BinaryKey = digest.parse().unwrap();
            assert_eq!(key.to_string(), digest.to_uppercase());
        }
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(matches!(
            BinaryKey::encode("d41d8cd98f00b204e9800998ecf8427"),
            Err(Error::MalformedDigest(_))
        ));
        assert!(BinaryKey::encode("d41d8cd98f00b204e9800998ecf8427e0").is_err());
        assert!(BinaryKey::encode("").is_err());
    }

    #[test]
    fn test_rejects_non_hex() {
        assert!(BinaryKey::encode("g41d8cd98f00b204e9800998ecf8427e").is_err());
        // A sign would be accepted by from_str_radix; the alphabet check catches it.
        assert!(BinaryKey::encode("+41d8cd98f00b204e9800998ecf8427e").is_err());
        assert!(BinaryKey::encode("d41d8cd98f00b204 9800998ecf8427e").is_err());
    }

    #[test]
    fn test_ordering_is_high_then_low() {
        let a = BinaryKey::new(1, u64::MAX);
        let b = BinaryKey::new(2, 0);
        let c = BinaryKey::new(2, 1);
        assert!(a < b);
        assert!(b < c);
    }
}
