#![forbid(unsafe_code)]

//! Derived-key tokens: P_SHA-1 derivation and stub materialization.
//!
//! A `DerivedKeyToken` element that names its source token by reference may
//! appear in the header before the source token itself. Until the source is
//! resolvable the element is held as a stub; the stub pass materializes it
//! once the universal resolver can produce the source.

use crate::resolver::{KeyIdentifierClause, TokenResolver};
use crate::token::{SecurityToken, TokenKind};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use sigtuna_core::{algorithm, Error, Result};
use std::sync::Arc;

/// Default derivation label per WS-SecureConversation.
pub const DEFAULT_LABEL: &str = "WS-SecureConversationWS-SecureConversation";

/// Upper bound on the derivation-stream offset a single token may request.
/// The offset comes off the wire; without a cap one element could demand an
/// arbitrarily long P_SHA-1 expansion.
pub const MAX_DERIVATION_OFFSET: usize = 8 * 1024;

/// A parsed `DerivedKeyToken` element whose source token may not be known yet.
#[derive(Debug, Clone)]
pub struct DerivedKeyStub {
    pub id: Option<String>,
    /// Reference to the token the key is derived from.
    pub source_identifier: KeyIdentifierClause,
    pub derivation_algorithm: String,
    pub label: Option<String>,
    pub nonce: Vec<u8>,
    /// Byte offset into the derived key stream; mutually exclusive with
    /// `generation` on the wire, already normalized here.
    pub offset: usize,
    /// Requested key length in bytes.
    pub length: usize,
}

impl DerivedKeyStub {
    /// Attempt to resolve the source token. `None` is not an error during
    /// non-final passes.
    pub fn try_resolve_source(&self, resolver: &dyn TokenResolver) -> Option<Arc<SecurityToken>> {
        resolver.try_resolve_clause(&self.source_identifier)
    }

    /// Materialize the derived-key token from its resolved source.
    pub fn create_token(
        &self,
        source: Arc<SecurityToken>,
        max_key_length: usize,
    ) -> Result<Arc<SecurityToken>> {
        if self.length > max_key_length {
            return Err(Error::DerivedKeyQuota(format!(
                "derived key length {} exceeds the suite maximum {}",
                self.length, max_key_length
            )));
        }
        if self.offset > MAX_DERIVATION_OFFSET {
            return Err(Error::DerivedKeyQuota(format!(
                "derived key offset {} exceeds the maximum {}",
                self.offset, MAX_DERIVATION_OFFSET
            )));
        }
        let secret = source.symmetric_key().ok_or_else(|| {
            Error::TokenConsistency("derivation source carries no symmetric key".into())
        })?;

        let label = self.label.as_deref().unwrap_or(DEFAULT_LABEL);
        let mut seed = Vec::with_capacity(label.len() + self.nonce.len());
        seed.extend_from_slice(label.as_bytes());
        seed.extend_from_slice(&self.nonce);

        let stream_len = self.offset.checked_add(self.length).ok_or_else(|| {
            Error::DerivedKeyQuota("derived key offset plus length overflows".into())
        })?;
        let stream = match self.derivation_algorithm.as_str() {
            algorithm::PSHA1_KEY_DERIVATION | algorithm::PSHA1_KEY_DERIVATION_DEC2005 => {
                p_hash::<Hmac<Sha1>>(secret, &seed, stream_len)?
            }
            other => {
                return Err(Error::UnsupportedAlgorithm(format!(
                    "key derivation: {other}"
                )))
            }
        };

        let key = stream[self.offset..].to_vec();
        Ok(Arc::new(SecurityToken {
            id: self.id.clone(),
            name: None,
            kind: TokenKind::DerivedKey { root: source, key },
        }))
    }
}

/// TLS-style P_hash expansion (RFC 2246 Section 5), used by P_SHA-1
/// derivation:
///
///   A(0) = seed, A(i) = HMAC(secret, A(i-1))
///   output = HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || ...
fn p_hash<M: Mac + hmac::digest::KeyInit>(
    secret: &[u8],
    seed: &[u8],
    out_len: usize,
) -> Result<Vec<u8>> {
    let new_mac = |data: &[&[u8]]| -> Result<Vec<u8>> {
        let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(secret)
            .map_err(|e| Error::Crypto(format!("HMAC key: {e}")))?;
        for part in data {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    };

    let mut a = new_mac(&[seed])?;
    let mut out = Vec::with_capacity(out_len);
    while out.len() < out_len {
        out.extend_from_slice(&new_mac(&[&a, seed])?);
        a = new_mac(&[&a])?;
    }
    out.truncate(out_len);
    Ok(out)
}

/// P_SHA-256 variant, kept for suites that negotiate SHA-256 derivation.
pub fn p_sha256(secret: &[u8], seed: &[u8], out_len: usize) -> Result<Vec<u8>> {
    p_hash::<Hmac<Sha256>>(secret, seed, out_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{HeaderTokenResolver, ReferenceStyle};

    fn stub(length: usize, offset: usize) -> DerivedKeyStub {
        DerivedKeyStub {
            id: Some("dk-1".into()),
            source_identifier: KeyIdentifierClause::LocalId("src".into()),
            derivation_algorithm: algorithm::PSHA1_KEY_DERIVATION.into(),
            label: None,
            nonce: hex::decode("404142434445464748494a4b4c4d4e4f").expect("nonce"),
            offset,
            length,
        }
    }

    #[test]
    fn test_p_sha1_is_deterministic_and_length_exact() {
        let a = p_hash::<Hmac<Sha1>>(b"secret", b"seed", 40).expect("derive");
        let b = p_hash::<Hmac<Sha1>>(b"secret", b"seed", 40).expect("derive");
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        // different seed, different stream
        let c = p_hash::<Hmac<Sha1>>(b"secret", b"seeds", 40).expect("derive");
        assert_ne!(a, c);
    }

    #[test]
    fn test_offset_selects_a_window_of_the_stream() {
        let source = SecurityToken::symmetric(Some("src".into()), vec![7; 32]);
        let whole = stub(48, 0)
            .create_token(Arc::clone(&source), 64)
            .expect("derive");
        let windowed = stub(16, 32)
            .create_token(Arc::clone(&source), 64)
            .expect("derive");
        assert_eq!(
            &whole.symmetric_key().expect("key")[32..48],
            windowed.symmetric_key().expect("key")
        );
    }

    #[test]
    fn test_oversized_offset_is_rejected() {
        let source = SecurityToken::symmetric(Some("src".into()), vec![7; 32]);
        let err = stub(16, usize::MAX)
            .create_token(Arc::clone(&source), 32)
            .unwrap_err();
        assert!(matches!(err, Error::DerivedKeyQuota(_)));
        // a merely huge offset must be refused before any derivation work
        let err = stub(16, 1 << 40).create_token(source, 32).unwrap_err();
        assert!(matches!(err, Error::DerivedKeyQuota(_)));
    }

    #[test]
    fn test_length_above_suite_maximum_is_rejected() {
        let source = SecurityToken::symmetric(Some("src".into()), vec![7; 32]);
        let err = stub(33, 0).create_token(source, 32).unwrap_err();
        assert!(matches!(err, Error::DerivedKeyQuota(_)));
    }

    #[test]
    fn test_derivation_from_keyless_source_fails() {
        let source = SecurityToken::x509(Some("src".into()), vec![1; 64]);
        let err = stub(16, 0).create_token(source, 32).unwrap_err();
        assert!(matches!(err, Error::TokenConsistency(_)));
    }

    #[test]
    fn test_stub_source_resolution_against_header_resolver() {
        let resolver = HeaderTokenResolver::new();
        let s = stub(16, 0);
        assert!(s.try_resolve_source(&*resolver).is_none());

        let source = SecurityToken::symmetric(Some("src".into()), vec![7; 32]);
        resolver.add(Arc::clone(&source), ReferenceStyle::Internal);
        let hit = s.try_resolve_source(&*resolver).expect("source visible now");
        assert!(SecurityToken::same_identity(&hit, &source));
    }
}
