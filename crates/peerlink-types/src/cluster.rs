//! Peer cluster identity.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest identity that is used verbatim (upper-cased) as a chain token.
const MAX_VERBATIM_TOKEN: usize = 8;

/// Opaque identity of a peered cluster.
///
/// The string itself is only ever used as key material: for store lookups,
/// route keys, and (through [`ClusterIdentity::chain_token`]) packet-filter
/// chain names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterIdentity(String);

impl ClusterIdentity {
    pub fn new(id: impl Into<String>) -> Result<Self, ParseError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ParseError::EmptyClusterIdentity);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the short, deterministic token used in per-cluster chain names.
    ///
    /// Identities of at most eight lowercase alphanumerics are used verbatim,
    /// upper-cased (`east` -> `EAST`). Anything else becomes `H` followed by
    /// eight hex digits of the FNV-1a hash of the full identity. The two forms
    /// have different lengths and therefore never collide with each other.
    pub fn chain_token(&self) -> String {
        let verbatim = self.0.len() <= MAX_VERBATIM_TOKEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if verbatim {
            self.0.to_ascii_uppercase()
        } else {
            format!("H{:08X}", (fnv1a(self.0.as_bytes()) >> 32) as u32)
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClusterIdentity {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ClusterIdentity> for String {
    fn from(id: ClusterIdentity) -> String {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_identity_verbatim() {
        let id = ClusterIdentity::new("east").unwrap();
        assert_eq!(id.chain_token(), "EAST");
    }

    #[test]
    fn test_long_identity_hashed_and_stable() {
        let id = ClusterIdentity::new("3f2a9c1e-5b7d-4e2f-9a1b-0c8d7e6f5a4b").unwrap();
        let token = id.chain_token();
        assert_eq!(token.len(), 9);
        assert!(token.starts_with('H'));
        assert_eq!(token, id.chain_token());
    }

    #[test]
    fn test_similar_identities_get_distinct_tokens() {
        let a = ClusterIdentity::new("east-1").unwrap();
        let b = ClusterIdentity::new("east-2").unwrap();
        assert_ne!(a.chain_token(), b.chain_token());
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(
            ClusterIdentity::new("  "),
            Err(ParseError::EmptyClusterIdentity)
        );
    }
}
