#![forbid(unsafe_code)]

//! Security token types and identity semantics.
//!
//! Tokens are shared by reference (`Arc`) between the header element store,
//! the trackers and the resolvers; equality is identity equality. The only
//! by-value comparison the library performs is the X.509 thumbprint match
//! used for the out-of-band first-token carve-out.

use sha1::{Digest, Sha1};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// The underlying token material.
pub enum TokenKind {
    /// A symmetric key supplied directly (e.g. a security-context key).
    Symmetric { key: Vec<u8> },
    /// An X.509 certificate (DER-encoded).
    X509 { der: Vec<u8> },
    /// A session key wrapped for the recipient inside an `EncryptedKey`.
    WrappedKey {
        key: Vec<u8>,
        wrapping_token: Arc<SecurityToken>,
        /// Ids of the `DataReference` entries embedded in the
        /// `EncryptedKey`'s own reference list, if one was present.
        reference_list: Option<Vec<String>>,
    },
    /// A key derived from a longer-lived root token via P_SHA-1.
    DerivedKey {
        root: Arc<SecurityToken>,
        key: Vec<u8>,
    },
}

impl std::fmt::Debug for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Symmetric { key } => write!(f, "symmetric key ({} bytes)", key.len()),
            Self::X509 { der } => write!(f, "X.509 certificate ({} bytes)", der.len()),
            Self::WrappedKey { key, .. } => write!(f, "wrapped key ({} bytes)", key.len()),
            Self::DerivedKey { key, .. } => write!(f, "derived key ({} bytes)", key.len()),
        }
    }
}

/// A security token carried in (or referenced by) a security header.
#[derive(Debug)]
pub struct SecurityToken {
    /// The wire-form id (`wsu:Id`), if the token carried one.
    pub id: Option<String>,
    /// Optional key name for external references.
    pub name: Option<String>,
    pub kind: TokenKind,
}

impl SecurityToken {
    pub fn symmetric(id: impl Into<Option<String>>, key: Vec<u8>) -> Arc<Self> {
        Arc::new(SecurityToken {
            id: id.into(),
            name: None,
            kind: TokenKind::Symmetric { key },
        })
    }

    pub fn x509(id: impl Into<Option<String>>, der: Vec<u8>) -> Arc<Self> {
        Arc::new(SecurityToken {
            id: id.into(),
            name: None,
            kind: TokenKind::X509 { der },
        })
    }

    pub fn wrapped(
        id: impl Into<Option<String>>,
        key: Vec<u8>,
        wrapping_token: Arc<SecurityToken>,
        reference_list: Option<Vec<String>>,
    ) -> Arc<Self> {
        Arc::new(SecurityToken {
            id: id.into(),
            name: None,
            kind: TokenKind::WrappedKey {
                key,
                wrapping_token,
                reference_list,
            },
        })
    }

    /// Identity comparison. Tokens are equal only if they are the same
    /// allocation.
    pub fn same_identity(a: &Arc<SecurityToken>, b: &Arc<SecurityToken>) -> bool {
        Arc::ptr_eq(a, b)
    }

    /// Whether this token carries symmetric key material.
    pub fn has_symmetric_key(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Symmetric { .. } | TokenKind::WrappedKey { .. } | TokenKind::DerivedKey { .. }
        )
    }

    /// The symmetric key bytes, if any.
    pub fn symmetric_key(&self) -> Option<&[u8]> {
        match &self.kind {
            TokenKind::Symmetric { key }
            | TokenKind::WrappedKey { key, .. }
            | TokenKind::DerivedKey { key, .. } => Some(key),
            TokenKind::X509 { .. } => None,
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, TokenKind::DerivedKey { .. })
    }

    /// For a derived key, the token it was derived from; otherwise the token
    /// itself.
    pub fn root_token(self: &Arc<Self>) -> Arc<SecurityToken> {
        match &self.kind {
            TokenKind::DerivedKey { root, .. } => Arc::clone(root),
            _ => Arc::clone(self),
        }
    }

    pub fn wrapping_token(&self) -> Option<&Arc<SecurityToken>> {
        match &self.kind {
            TokenKind::WrappedKey { wrapping_token, .. } => Some(wrapping_token),
            _ => None,
        }
    }

    pub fn reference_list(&self) -> Option<&[String]> {
        match &self.kind {
            TokenKind::WrappedKey { reference_list, .. } => reference_list.as_deref(),
            _ => None,
        }
    }

    /// SHA-1 thumbprint of an X.509 token's DER encoding.
    pub fn thumbprint(&self) -> Option<[u8; 20]> {
        match &self.kind {
            TokenKind::X509 { der } => {
                let mut hasher = Sha1::new();
                hasher.update(der);
                Some(hasher.finalize().into())
            }
            _ => None,
        }
    }

    /// By-value comparison supported only for X.509 tokens, via thumbprint.
    ///
    /// This is the narrow interop carve-out used when an out-of-band
    /// certificate is re-supplied by value in the header; it must not be
    /// generalized to other token kinds.
    pub fn matches_by_thumbprint(&self, other: &SecurityToken) -> bool {
        match (self.thumbprint(), other.thumbprint()) {
            (Some(a), Some(b)) => a.ct_eq(&b).into(),
            _ => false,
        }
    }
}

/// A single authorization claim produced by token authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    pub claim: String,
}

/// The authorization evidence produced by the authenticator that validated a
/// token.
pub type AuthorizationPolicies = Vec<AuthorizationPolicy>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_by_reference() {
        let a = SecurityToken::symmetric(None, vec![1, 2, 3]);
        let b = SecurityToken::symmetric(None, vec![1, 2, 3]);
        assert!(SecurityToken::same_identity(&a, &Arc::clone(&a)));
        assert!(!SecurityToken::same_identity(&a, &b));
    }

    #[test]
    fn test_thumbprint_only_for_x509() {
        let cert = SecurityToken::x509(None, b"not-a-real-cert".to_vec());
        let sym = SecurityToken::symmetric(None, vec![0; 16]);
        assert!(cert.thumbprint().is_some());
        assert!(sym.thumbprint().is_none());
        assert!(!cert.matches_by_thumbprint(&sym));

        let same = SecurityToken::x509(None, b"not-a-real-cert".to_vec());
        assert!(cert.matches_by_thumbprint(&same));
    }

    #[test]
    fn test_root_token_unwraps_derivation() {
        let root = SecurityToken::symmetric(Some("src".into()), vec![7; 32]);
        let derived = Arc::new(SecurityToken {
            id: None,
            name: None,
            kind: TokenKind::DerivedKey {
                root: Arc::clone(&root),
                key: vec![1; 16],
            },
        });
        assert!(SecurityToken::same_identity(&derived.root_token(), &root));
        assert!(SecurityToken::same_identity(&root.root_token(), &root));
    }
}
