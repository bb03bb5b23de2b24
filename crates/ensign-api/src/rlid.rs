//! # RLID: Ranked Lexicographic IDs
//!
//! A 10-byte event identifier assigned by the dispatcher at commit time. The first
//! 6 bytes hold a big-endian time tick (Unix seconds) and the last 4 bytes hold a
//! big-endian monotonic sequence, so byte order equals `(tick, sequence)` order.
//!
//! The string form is 16 characters of lowercase Crockford base32.
//!
//! | Offset | Size | Field      |
//! |--------|------|------------|
//! | 0      | 6    | `tick`     |
//! | 6      | 4    | `sequence` |

use std::fmt;
use std::str::FromStr;

/// Number of bytes in an RLID.
pub const RLID_LEN: usize = 10;

/// Number of characters in the encoded form of an RLID.
pub const ENCODED_LEN: usize = 16;

/// Largest time tick that fits into the 48 bit time component.
pub const MAX_TIME: u64 = 281_474_976_710_655;

const ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

// Inverse of ALPHABET, accepting upper case letters as well.
const INVALID: u8 = 0xFF;
const DECODE: [u8; 256] = {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        let c = ALPHABET[i];
        table[c as usize] = i as u8;
        if c.is_ascii_lowercase() {
            table[c.to_ascii_uppercase() as usize] = i as u8;
        }
        i += 1;
    }
    table
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RlidError {
    #[error("rlids must be exactly 10 bytes or 16 characters long")]
    DataSize,
    #[error("rlid string contains invalid characters")]
    InvalidCharacters,
    #[error("time tick exceeds the maximum rlid time")]
    OverTime,
}

/// A ranked lexicographic event identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rlid([u8; RLID_LEN]);

impl Rlid {
    /// Build an RLID from the current wall clock and the given sequence.
    pub fn make(sequence: u32) -> Self {
        let tick = chrono::Utc::now().timestamp().max(0) as u64;
        // The wall clock will not exceed 48 bits of seconds for several million years.
        Self::from_parts(tick.min(MAX_TIME), sequence).unwrap_or_default()
    }

    /// Build an RLID from an explicit time tick and sequence.
    pub fn from_parts(tick: u64, sequence: u32) -> Result<Self, RlidError> {
        if tick > MAX_TIME {
            return Err(RlidError::OverTime);
        }

        let mut id = [0u8; RLID_LEN];
        id[..6].copy_from_slice(&tick.to_be_bytes()[2..]);
        id[6..].copy_from_slice(&sequence.to_be_bytes());
        Ok(Self(id))
    }

    /// Copy an RLID out of a byte slice, e.g. the `id` field of an event.
    pub fn from_slice(data: &[u8]) -> Result<Self, RlidError> {
        let id: [u8; RLID_LEN] = data.try_into().map_err(|_| RlidError::DataSize)?;
        Ok(Self(id))
    }

    pub const fn from_bytes(id: [u8; RLID_LEN]) -> Self {
        Self(id)
    }

    /// The time tick component in Unix seconds.
    pub fn time(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..].copy_from_slice(&self.0[..6]);
        u64::from_be_bytes(buf)
    }

    pub fn sequence(&self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.0[6..]);
        u32::from_be_bytes(buf)
    }

    pub fn as_bytes(&self) -> &[u8; RLID_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; RLID_LEN]
    }

    /// Decode the 16 character string form of an RLID.
    pub fn parse(s: &str) -> Result<Self, RlidError> {
        let raw = s.as_bytes();
        if raw.len() != ENCODED_LEN {
            return Err(RlidError::DataSize);
        }

        let mut n: u128 = 0;
        for &c in raw {
            let v = DECODE[c as usize];
            if v == INVALID {
                return Err(RlidError::InvalidCharacters);
            }
            n = (n << 5) | v as u128;
        }

        let mut id = [0u8; RLID_LEN];
        id.copy_from_slice(&n.to_be_bytes()[16 - RLID_LEN..]);
        Ok(Self(id))
    }

    fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut buf = [0u8; 16];
        buf[16 - RLID_LEN..].copy_from_slice(&self.0);
        let n = u128::from_be_bytes(buf);

        let mut out = [0u8; ENCODED_LEN];
        for (i, c) in out.iter_mut().enumerate() {
            let shift = 5 * (ENCODED_LEN - 1 - i);
            *c = ALPHABET[((n >> shift) & 0x1F) as usize];
        }
        out
    }
}

impl fmt::Display for Rlid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode();
        // ALPHABET is pure ASCII so the encoded buffer is always valid UTF-8.
        f.write_str(std::str::from_utf8(&encoded).map_err(|_| fmt::Error)?)
    }
}

impl FromStr for Rlid {
    type Err = RlidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&[u8]> for Rlid {
    type Error = RlidError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(data)
    }
}

impl From<Rlid> for Vec<u8> {
    fn from(id: Rlid) -> Self {
        id.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURES: [([u8; 10], &str); 2] = [
        (
            [0x01, 0x83, 0x42, 0x5F, 0x66, 0x6F, 0x00, 0x6F, 0xEB, 0x6B],
            "061m4qv6dw06ztvb",
        ),
        (
            [0x08, 0x12, 0xF5, 0x59, 0x12, 0xA2, 0x3B, 0xFE, 0x01, 0x98],
            "109fap8jm8xzw0cr",
        ),
    ];

    #[test]
    fn test_string_fixtures() {
        for (bytes, encoded) in FIXTURES {
            let id = Rlid::from_bytes(bytes);
            assert_eq!(id.to_string(), encoded);
            assert_eq!(Rlid::parse(encoded).unwrap(), id);
        }
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let upper = Rlid::parse("061M4QV6DW06ZTVB").unwrap();
        let lower = Rlid::parse("061m4qv6dw06ztvb").unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Rlid::parse("061m4qv6dw06ztv"), Err(RlidError::DataSize));
        assert_eq!(Rlid::parse("061m4qv6dw06ztvbb"), Err(RlidError::DataSize));
        // i, l, o and u are not part of the alphabet
        assert_eq!(
            Rlid::parse("061m4qv6dw06ztvu"),
            Err(RlidError::InvalidCharacters)
        );
        assert_eq!(
            Rlid::parse("061m4qv6dw06-tvb"),
            Err(RlidError::InvalidCharacters)
        );
    }

    #[test]
    fn test_from_slice() {
        assert_eq!(Rlid::from_slice(&[1, 2, 3]), Err(RlidError::DataSize));
        let id = Rlid::from_slice(&FIXTURES[0].0).unwrap();
        assert_eq!(id.as_bytes(), &FIXTURES[0].0);
    }

    #[test]
    fn test_parts() {
        let id = Rlid::from_parts(1_672_531_200, 42).unwrap();
        assert_eq!(id.time(), 1_672_531_200);
        assert_eq!(id.sequence(), 42);

        assert_eq!(Rlid::from_parts(MAX_TIME + 1, 1), Err(RlidError::OverTime));
        let max = Rlid::from_parts(MAX_TIME, u32::MAX).unwrap();
        assert_eq!(max.as_bytes(), &[0xFF; 10]);
        assert_eq!(max.to_string(), "zzzzzzzzzzzzzzzz");
    }

    #[test]
    fn test_ordering_follows_tick_then_sequence() {
        let a = Rlid::from_parts(100, u32::MAX).unwrap();
        let b = Rlid::from_parts(101, 0).unwrap();
        let c = Rlid::from_parts(101, 1).unwrap();
        assert!(a < b && b < c);
        assert!(a.as_bytes() < b.as_bytes());
        assert!(a.to_string() < b.to_string());
        assert!(b.to_string() < c.to_string());
    }

    #[test]
    fn test_make_uses_current_time() {
        let before = chrono::Utc::now().timestamp() as u64;
        let id = Rlid::make(7);
        let after = chrono::Utc::now().timestamp() as u64;
        assert!(id.time() >= before && id.time() <= after);
        assert_eq!(id.sequence(), 7);
        assert!(!id.is_zero());
    }
}
