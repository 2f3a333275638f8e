//! Peer identities and the signing interface.
//!
//! Key generation and signature primitives are external collaborators; the
//! engine only names identities (`anonymous` or `ed25519:<base32>`) and
//! calls through [`IdentityProvider`] to sign handshake proofs and verify
//! the peer's.

use std::fmt;
use std::str::FromStr;

use crate::error::{RabbitError, Result};

/// A burrow identity as written in `Burrow-ID:` headers and rabbit URIs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Unauthenticated peer.
    Anonymous,
    /// Ed25519 public key, RFC 4648 base32 without padding.
    Ed25519(String),
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => f.write_str("anonymous"),
            Identity::Ed25519(key) => write!(f, "ed25519:{key}"),
        }
    }
}

impl FromStr for Identity {
    type Err = RabbitError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "anonymous" {
            return Ok(Identity::Anonymous);
        }
        match s.strip_prefix("ed25519:") {
            Some(key) if !key.is_empty() && is_base32(key) => {
                Ok(Identity::Ed25519(key.to_string()))
            }
            _ => Err(RabbitError::ProtocolViolation(format!(
                "bad identity: {s}"
            ))),
        }
    }
}

fn is_base32(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}

/// How far the peer's identity has been corroborated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustLevel {
    /// Key seen, nothing vouches for it (trust-on-first-use).
    SelfSigned,
    /// Key chains to a known warren anchor.
    Anchored,
    /// Key proven live via challenge signature.
    Verified,
}

/// Signing and verification, supplied by the embedding application.
pub trait IdentityProvider: Send + Sync {
    /// Identity presented in our `HELLO`.
    fn local_identity(&self) -> Identity;

    /// Sign a challenge message with the local key.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Verify `signature` over `message` against a peer identity.
    fn verify(&self, identity: &Identity, message: &[u8], signature: &[u8]) -> bool;
}

/// Provider for burrows that hold no key and connect anonymously.
pub struct AnonymousProvider;

impl IdentityProvider for AnonymousProvider {
    fn local_identity(&self) -> Identity {
        Identity::Anonymous
    }

    fn sign(&self, _message: &[u8]) -> Result<Vec<u8>> {
        Err(RabbitError::Unauthorized(
            "anonymous burrow cannot sign proofs".into(),
        ))
    }

    fn verify(&self, _identity: &Identity, _message: &[u8], _signature: &[u8]) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let id: Identity = "ed25519:MFRGGZDFMZTWQ2LK".parse().unwrap();
        assert_eq!(id.to_string(), "ed25519:MFRGGZDFMZTWQ2LK");
        let anon: Identity = "anonymous".parse().unwrap();
        assert!(anon.is_anonymous());
    }

    #[test]
    fn test_bad_identities_rejected() {
        assert!("ed25519:".parse::<Identity>().is_err());
        assert!("ed25519:lowercase!".parse::<Identity>().is_err());
        assert!("rsa:AAAA".parse::<Identity>().is_err());
        assert!("".parse::<Identity>().is_err());
    }

    #[test]
    fn test_trust_ordering() {
        assert!(TrustLevel::SelfSigned < TrustLevel::Anchored);
        assert!(TrustLevel::Anchored < TrustLevel::Verified);
    }

    #[test]
    fn test_anonymous_provider_cannot_sign() {
        let provider = AnonymousProvider;
        assert!(provider.sign(b"nonce").is_err());
        assert!(!provider.verify(&Identity::Anonymous, b"m", b"s"));
    }
}
