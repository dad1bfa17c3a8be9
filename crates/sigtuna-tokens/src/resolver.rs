#![forbid(unsafe_code)]

//! Key-identifier clauses and token resolution.
//!
//! Resolution failure is an expected negative outcome (`None`), handled by
//! falling through to the next resolver in an aggregate; only the caller
//! decides when an unresolved reference becomes fatal.

use crate::token::SecurityToken;
use sigtuna_core::Result;
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;

/// A single way of referring to a token.
#[derive(Debug, Clone)]
pub enum KeyIdentifierClause {
    /// Same-document reference (`#id`).
    LocalId(String),
    /// Reference by key name.
    KeyName(String),
    /// Reference by X.509 SHA-1 thumbprint.
    Thumbprint(Vec<u8>),
    /// Intrinsic: raw symmetric key bytes carried inline.
    RawSymmetric(Vec<u8>),
    /// Intrinsic: raw X.509 certificate data carried inline.
    RawX509(Vec<u8>),
    /// Intrinsic: a wrapped key that must itself be unwrapped using a
    /// recursively resolved unwrapping token.
    EncryptedKey {
        cipher_value: Vec<u8>,
        wrapping_reference: Box<KeyIdentifierClause>,
    },
}

/// An ordered set of clauses all naming the same token.
#[derive(Debug, Clone, Default)]
pub struct KeyIdentifier {
    pub clauses: Vec<KeyIdentifierClause>,
}

impl KeyIdentifier {
    pub fn single(clause: KeyIdentifierClause) -> Self {
        KeyIdentifier {
            clauses: vec![clause],
        }
    }
}

pub trait TokenResolver: Send + Sync {
    /// Attempt to resolve one clause. `None` means "not found here".
    fn try_resolve_clause(&self, clause: &KeyIdentifierClause) -> Option<Arc<SecurityToken>>;

    /// Attempt each clause in order; first hit wins.
    fn try_resolve(&self, identifier: &KeyIdentifier) -> Option<Arc<SecurityToken>> {
        identifier
            .clauses
            .iter()
            .find_map(|c| self.try_resolve_clause(c))
    }
}

/// How a token entered the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceStyle {
    /// The token appears inside this header and may be referenced by local id.
    Internal,
    /// The token was configured out of band and is referenced by value
    /// (thumbprint or name), never by local id.
    External,
}

/// The header-local resolver.
///
/// The processor maintains two instances: a universal one holding every token
/// seen, and a primary one holding only tokens relevant to the primary
/// signature and decryption.
pub struct HeaderTokenResolver {
    entries: RwLock<Vec<(Arc<SecurityToken>, ReferenceStyle)>>,
    expected_wrapper: RwLock<Option<Arc<SecurityToken>>>,
}

impl HeaderTokenResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(HeaderTokenResolver {
            entries: RwLock::new(Vec::new()),
            expected_wrapper: RwLock::new(None),
        })
    }

    pub fn add(&self, token: Arc<SecurityToken>, style: ReferenceStyle) {
        self.entries.write().expect("resolver lock").push((token, style));
    }

    /// Set the token expected to have wrapped any `EncryptedKey` in this
    /// header.
    pub fn set_expected_wrapper(&self, wrapper: Arc<SecurityToken>) {
        *self.expected_wrapper.write().expect("resolver lock") = Some(wrapper);
    }

    pub fn expected_wrapper(&self) -> Option<Arc<SecurityToken>> {
        self.expected_wrapper.read().expect("resolver lock").clone()
    }

    fn matches(token: &SecurityToken, style: ReferenceStyle, clause: &KeyIdentifierClause) -> bool {
        match clause {
            KeyIdentifierClause::LocalId(id) => {
                style == ReferenceStyle::Internal && token.id.as_deref() == Some(id.as_str())
            }
            KeyIdentifierClause::KeyName(name) => token.name.as_deref() == Some(name.as_str()),
            KeyIdentifierClause::Thumbprint(tp) => match token.thumbprint() {
                Some(t) => t.as_slice().ct_eq(tp.as_slice()).into(),
                None => false,
            },
            // Intrinsic clauses are synthesized by the aggregate, never
            // matched against stored entries.
            _ => false,
        }
    }
}

impl TokenResolver for HeaderTokenResolver {
    fn try_resolve_clause(&self, clause: &KeyIdentifierClause) -> Option<Arc<SecurityToken>> {
        let entries = self.entries.read().expect("resolver lock");
        for (token, style) in entries.iter() {
            if Self::matches(token, *style, clause) {
                return Some(Arc::clone(token));
            }
        }
        drop(entries);

        // The expected wrapper may be referenced by value even though it was
        // never stored as an entry.
        if let Some(wrapper) = self.expected_wrapper() {
            if Self::matches(&wrapper, ReferenceStyle::External, clause) {
                return Some(wrapper);
            }
        }
        None
    }
}

/// Capability to unwrap a wrapped key, supplied by the codec layer.
pub trait KeyUnwrap: Send + Sync {
    fn unwrap(&self, wrapping_token: &SecurityToken, cipher_value: &[u8]) -> Result<Vec<u8>>;
}

/// Layers the header-local resolver over externally supplied out-of-band
/// resolvers, then over intrinsic clause synthesis.
pub struct AggregateTokenResolver {
    header: Arc<HeaderTokenResolver>,
    out_of_band: Vec<Arc<dyn TokenResolver>>,
    unwrap: Option<Arc<dyn KeyUnwrap>>,
}

impl AggregateTokenResolver {
    pub fn new(
        header: Arc<HeaderTokenResolver>,
        out_of_band: Vec<Arc<dyn TokenResolver>>,
        unwrap: Option<Arc<dyn KeyUnwrap>>,
    ) -> Arc<Self> {
        Arc::new(AggregateTokenResolver {
            header,
            out_of_band,
            unwrap,
        })
    }

    fn try_resolve_intrinsic(&self, clause: &KeyIdentifierClause) -> Option<Arc<SecurityToken>> {
        match clause {
            KeyIdentifierClause::RawSymmetric(key) => {
                Some(SecurityToken::symmetric(None, key.clone()))
            }
            KeyIdentifierClause::RawX509(der) => Some(SecurityToken::x509(None, der.clone())),
            KeyIdentifierClause::EncryptedKey {
                cipher_value,
                wrapping_reference,
            } => {
                let wrapper = self.try_resolve_clause(wrapping_reference)?;
                let unwrap = self.unwrap.as_ref()?;
                match unwrap.unwrap(&wrapper, cipher_value) {
                    Ok(key) => Some(SecurityToken::wrapped(None, key, wrapper, None)),
                    Err(err) => {
                        tracing::debug!(error = %err, "intrinsic encrypted-key unwrap failed");
                        None
                    }
                }
            }
            _ => None,
        }
    }
}

impl TokenResolver for AggregateTokenResolver {
    fn try_resolve_clause(&self, clause: &KeyIdentifierClause) -> Option<Arc<SecurityToken>> {
        if let Some(token) = self.header.try_resolve_clause(clause) {
            return Some(token);
        }
        for resolver in &self.out_of_band {
            if let Some(token) = resolver.try_resolve_clause(clause) {
                return Some(token);
            }
        }
        self.try_resolve_intrinsic(clause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigtuna_core::Error;

    #[test]
    fn test_local_id_resolves_internal_tokens_only() {
        let resolver = HeaderTokenResolver::new();
        let internal = SecurityToken::symmetric(Some("tok-1".into()), vec![1; 16]);
        let external = SecurityToken::symmetric(Some("tok-2".into()), vec![2; 16]);
        resolver.add(Arc::clone(&internal), ReferenceStyle::Internal);
        resolver.add(Arc::clone(&external), ReferenceStyle::External);

        let hit = resolver
            .try_resolve_clause(&KeyIdentifierClause::LocalId("tok-1".into()))
            .expect("internal token resolves");
        assert!(SecurityToken::same_identity(&hit, &internal));

        assert!(resolver
            .try_resolve_clause(&KeyIdentifierClause::LocalId("tok-2".into()))
            .is_none());
    }

    #[test]
    fn test_thumbprint_resolves_expected_wrapper() {
        let resolver = HeaderTokenResolver::new();
        let wrapper = SecurityToken::x509(None, b"wrapper-cert".to_vec());
        resolver.set_expected_wrapper(Arc::clone(&wrapper));

        let tp = wrapper.thumbprint().expect("x509 thumbprint").to_vec();
        let hit = resolver
            .try_resolve_clause(&KeyIdentifierClause::Thumbprint(tp))
            .expect("wrapper resolves by thumbprint");
        assert!(SecurityToken::same_identity(&hit, &wrapper));
    }

    struct XorUnwrap;
    impl KeyUnwrap for XorUnwrap {
        fn unwrap(&self, wrapping: &SecurityToken, cipher: &[u8]) -> Result<Vec<u8>> {
            let key = wrapping
                .symmetric_key()
                .ok_or_else(|| Error::Crypto("no key".into()))?;
            Ok(cipher
                .iter()
                .zip(key.iter().cycle())
                .map(|(c, k)| c ^ k)
                .collect())
        }
    }

    #[test]
    fn test_aggregate_falls_through_to_intrinsic_encrypted_key() {
        let header = HeaderTokenResolver::new();
        let wrapper = SecurityToken::symmetric(Some("kek".into()), vec![0xAA; 16]);
        header.add(Arc::clone(&wrapper), ReferenceStyle::Internal);
        let aggregate = AggregateTokenResolver::new(header, Vec::new(), Some(Arc::new(XorUnwrap)));

        let clause = KeyIdentifierClause::EncryptedKey {
            cipher_value: vec![0xAA; 16],
            wrapping_reference: Box::new(KeyIdentifierClause::LocalId("kek".into())),
        };
        let token = aggregate
            .try_resolve_clause(&clause)
            .expect("intrinsic unwrap succeeds");
        assert_eq!(token.symmetric_key(), Some(vec![0u8; 16].as_slice()));
        assert!(SecurityToken::same_identity(
            token.wrapping_token().expect("wrapped token"),
            &wrapper
        ));
    }

    #[test]
    fn test_aggregate_prefers_header_resolver() {
        let header = HeaderTokenResolver::new();
        let local = SecurityToken::symmetric(Some("t".into()), vec![3; 16]);
        header.add(Arc::clone(&local), ReferenceStyle::Internal);

        struct NeverResolver;
        impl TokenResolver for NeverResolver {
            fn try_resolve_clause(&self, _: &KeyIdentifierClause) -> Option<Arc<SecurityToken>> {
                panic!("out-of-band resolver must not be consulted on header hit");
            }
        }
        let aggregate =
            AggregateTokenResolver::new(header, vec![Arc::new(NeverResolver)], None);
        let hit = aggregate
            .try_resolve_clause(&KeyIdentifierClause::LocalId("t".into()))
            .expect("resolved locally");
        assert!(SecurityToken::same_identity(&hit, &local));
    }
}
