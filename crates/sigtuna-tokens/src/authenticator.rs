#![forbid(unsafe_code)]

//! Token authenticators.
//!
//! An authenticator either declines a candidate token (`can_validate` false)
//! or validates it, producing authorization evidence. Validation may call out
//! to a remote validator, so it receives the remaining time budget.

use crate::token::{AuthorizationPolicies, AuthorizationPolicy, SecurityToken, TokenKind};
use sigtuna_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

pub trait TokenAuthenticator: Send + Sync {
    /// Whether this authenticator recognizes the token kind at all.
    fn can_validate(&self, token: &SecurityToken) -> bool;

    /// Validate the token within the given time budget.
    fn validate(
        &self,
        token: &SecurityToken,
        budget: Duration,
    ) -> Result<AuthorizationPolicies>;
}

/// Authenticator identity is reference identity, like token identity.
pub fn same_authenticator(
    a: &Arc<dyn TokenAuthenticator>,
    b: &Arc<dyn TokenAuthenticator>,
) -> bool {
    Arc::ptr_eq(a, b)
}

/// Accepts any token carrying symmetric key material.
pub struct SymmetricTokenAuthenticator {
    claim: String,
}

impl SymmetricTokenAuthenticator {
    pub fn new(claim: impl Into<String>) -> Arc<dyn TokenAuthenticator> {
        Arc::new(SymmetricTokenAuthenticator {
            claim: claim.into(),
        })
    }
}

impl TokenAuthenticator for SymmetricTokenAuthenticator {
    fn can_validate(&self, token: &SecurityToken) -> bool {
        token.has_symmetric_key()
    }

    fn validate(&self, token: &SecurityToken, _budget: Duration) -> Result<AuthorizationPolicies> {
        if token.has_symmetric_key() {
            Ok(vec![AuthorizationPolicy {
                claim: self.claim.clone(),
            }])
        } else {
            Err(Error::FailedAuthentication(
                "token carries no symmetric key".into(),
            ))
        }
    }
}

/// Accepts only X.509 tokens whose thumbprint matches one of the pinned
/// certificates.
pub struct PinnedX509Authenticator {
    pinned: Vec<Arc<SecurityToken>>,
}

impl PinnedX509Authenticator {
    pub fn new(pinned: Vec<Arc<SecurityToken>>) -> Arc<dyn TokenAuthenticator> {
        Arc::new(PinnedX509Authenticator { pinned })
    }
}

impl TokenAuthenticator for PinnedX509Authenticator {
    fn can_validate(&self, token: &SecurityToken) -> bool {
        matches!(token.kind, TokenKind::X509 { .. })
    }

    fn validate(&self, token: &SecurityToken, _budget: Duration) -> Result<AuthorizationPolicies> {
        for candidate in &self.pinned {
            if candidate.matches_by_thumbprint(token) {
                return Ok(vec![AuthorizationPolicy {
                    claim: "x509-pinned".into(),
                }]);
            }
        }
        Err(Error::FailedAuthentication(
            "certificate does not match any pinned certificate".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_authenticator_declines_x509() {
        let auth = SymmetricTokenAuthenticator::new("session");
        let sym = SecurityToken::symmetric(None, vec![1; 16]);
        let cert = SecurityToken::x509(None, vec![2; 64]);
        assert!(auth.can_validate(&sym));
        assert!(!auth.can_validate(&cert));
    }

    #[test]
    fn test_pinned_x509_rejects_unknown_certificate() {
        let pinned = SecurityToken::x509(None, b"trusted".to_vec());
        let auth = PinnedX509Authenticator::new(vec![pinned]);
        let stranger = SecurityToken::x509(None, b"stranger".to_vec());
        assert!(auth
            .validate(&stranger, Duration::from_secs(1))
            .is_err());

        let same_cert = SecurityToken::x509(None, b"trusted".to_vec());
        assert!(auth.validate(&same_cert, Duration::from_secs(1)).is_ok());
    }
}
