use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace every hoster identity lives under.
pub const DID_PREFIX: &str = "did:sight:hoster:";
/// Multicodec tag for an Ed25519 public key (`0xed` varint-encoded).
pub const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];
/// Role-based identity used by gateway nodes instead of a key-derived one.
pub const GATEWAY_DID: &str = "gateway";

/// Routing address of a relay node.
///
/// Envelopes on the shared topic carry a `to` field holding one of these; a
/// node only lifts envelopes whose `to` equals its own `Did` byte for byte.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(pub String);

impl Did {
    /// Maps a public key to the node identity. Gateways ignore the key.
    pub fn derive(public_key: &[u8], is_gateway: bool) -> Self {
        if is_gateway {
            Self::gateway()
        } else {
            Self::from_public_key(public_key)
        }
    }

    pub fn from_public_key(public_key: &[u8]) -> Self {
        let mut tagged = Vec::with_capacity(ED25519_MULTICODEC.len() + public_key.len());
        tagged.extend_from_slice(&ED25519_MULTICODEC);
        tagged.extend_from_slice(public_key);
        Self(format!("{DID_PREFIX}{}", bs58::encode(tagged).into_string()))
    }

    pub fn gateway() -> Self {
        Self(GATEWAY_DID.to_owned())
    }

    pub fn is_gateway(&self) -> bool {
        self.0 == GATEWAY_DID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Did {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Did {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for Did {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Did {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_matches_known_vectors() {
        assert_eq!(
            Did::from_public_key(&[0u8; 32]).as_str(),
            "did:sight:hoster:6MkeTG3bFFSLYVU7VqhgZxqr6YzpaGrQtFMh1uvqGy1vDnP"
        );
        let ascending: Vec<u8> = (0u8..32).collect();
        assert_eq!(
            Did::from_public_key(&ascending).as_str(),
            "did:sight:hoster:6MkeTGwHmLmuCmgg4ABYhzWVh6ZX7hTwWt8gguAretUfc9c"
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let key = [7u8; 32];
        assert_eq!(Did::derive(&key, false), Did::derive(&key, false));
    }

    #[test]
    fn distinct_keys_yield_distinct_identities() {
        let mut other = [7u8; 32];
        other[31] = 8;
        assert_ne!(Did::derive(&[7u8; 32], false), Did::derive(&other, false));
    }

    #[test]
    fn gateway_ignores_key() {
        assert_eq!(Did::derive(&[1u8; 32], true), "gateway");
        assert_eq!(Did::derive(&[2u8; 32], true), Did::gateway());
        assert!(Did::derive(&[], true).is_gateway());
    }

    #[test]
    fn serializes_as_plain_string() {
        let did = Did::from("did:sight:hoster:abc");
        assert_eq!(serde_json::to_string(&did).unwrap(), "\"did:sight:hoster:abc\"");
    }
}
