//! Cache key value objects
//!
//! Action and output identifiers are opaque byte strings supplied by the
//! compiler driver. Their printable form is lowercase hexadecimal, which is
//! also what the disk layout and lock-file names are derived from.
//! Uniqueness is the caller's responsibility.

use std::fmt;

/// Identifier of a compilation action (the cache lookup key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionId(Vec<u8>);

impl ActionId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<&[u8]> for ActionId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Identifier of the output artifact that satisfies an action.
/// Multiple actions may name the same output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputId(Vec<u8>);

impl OutputId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self)
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<&[u8]> for OutputId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_id_hex_roundtrip() {
        let id = ActionId::new(vec![0x01, 0xab, 0xff]);
        assert_eq!(id.to_hex(), "01abff");
        assert_eq!(ActionId::from_hex("01abff"), Some(id));
    }

    #[test]
    fn test_action_id_display_is_hex() {
        let id = ActionId::new(vec![0xde, 0xad]);
        assert_eq!(id.to_string(), "dead");
    }

    #[test]
    fn test_output_id_rejects_bad_hex() {
        assert!(OutputId::from_hex("zz").is_none());
        assert!(OutputId::from_hex("abc").is_none());
    }

    #[test]
    fn test_empty_id() {
        let id = ActionId::new(Vec::new());
        assert_eq!(id.to_hex(), "");
        assert!(id.as_bytes().is_empty());
    }
}
