use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// A 40-hex-digit peer identifier, normalized to lowercase without a `0x`
/// prefix. The all-zero value is the "empty" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

pub const ADDRESS_LEN: usize = 40;

impl Address {
    pub fn empty() -> Self {
        Address("0".repeat(ADDRESS_LEN))
    }

    pub fn is_empty(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log output: first 8 hex digits.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl FromStr for Address {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if hex.len() != ADDRESS_LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MeshError::BadAddress(trimmed.to_string()));
        }
        Ok(Address(hex.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Address {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes() {
        let addr: Address = "0xABCDEF0123456789abcdef0123456789ABCDEF01"
            .parse()
            .expect("valid address");
        assert_eq!(addr.as_str(), "abcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        assert!("abc".parse::<Address>().is_err());
        assert!("zz".repeat(20).parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn empty_sentinel() {
        let empty = Address::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.as_str().len(), ADDRESS_LEN);
        let parsed: Address = "0".repeat(40).parse().unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn serde_round_trip() {
        let addr: Address = "abcdef0123456789abcdef0123456789abcdef01".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"abcdef0123456789abcdef0123456789abcdef01\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
