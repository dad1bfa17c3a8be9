#![forbid(unsafe_code)]

//! Per-token consistency trackers.
//!
//! The signature and encryption operations must each be keyed by exactly one
//! token, and every supporting token must end the run in the state its
//! attachment mode demands. Trackers accumulate those observations as the
//! header is walked; the verdicts are rendered once, at the end.

use crate::element::BindingMode;
use sigtuna_core::{Error, Result};
use sigtuna_tokens::{SecurityToken, TokenAuthenticator};
use std::sync::Arc;

/// Tracks the token keying one cryptographic operation (signature or
/// encryption) across everything the header attributes to that operation.
#[derive(Default)]
pub struct OperationTracker {
    token: Option<Arc<SecurityToken>>,
    is_derived_token: bool,
}

impl OperationTracker {
    pub fn new() -> Self {
        OperationTracker::default()
    }

    /// Record the token used by one instance of the operation. All instances
    /// must use the same token.
    pub fn record_token(&mut self, token: Arc<SecurityToken>) -> Result<()> {
        match &self.token {
            None => {
                self.token = Some(token);
                Ok(())
            }
            Some(existing) if SecurityToken::same_identity(existing, &token) => Ok(()),
            Some(_) => Err(Error::TokenConsistency(
                "mismatched tokens used for the same security operation".into(),
            )),
        }
    }

    /// Collapse a derived key to its derivation source, remembering that
    /// derivation happened.
    pub fn set_derivation_source_if_required(&mut self) {
        if let Some(token) = &self.token {
            if token.is_derived() {
                self.is_derived_token = true;
                self.token = Some(token.root_token());
            }
        }
    }

    pub fn token(&self) -> Option<&Arc<SecurityToken>> {
        self.token.as_ref()
    }

    pub fn is_derived_token(&self) -> bool {
        self.is_derived_token
    }
}

/// How a supporting token is attached to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentMode {
    /// Endorses the primary signature with its own signature.
    Endorsing,
    /// Signed by the primary signature.
    Signed,
    /// Signed and encrypted ("basic").
    SignedEncrypted,
    /// Both signed and endorsing.
    SignedEndorsing,
}

impl AttachmentMode {
    pub fn is_basic(self) -> bool {
        matches!(self, AttachmentMode::SignedEncrypted)
    }

    pub fn is_endorsing(self) -> bool {
        matches!(self, AttachmentMode::Endorsing | AttachmentMode::SignedEndorsing)
    }

    /// The binding mode recorded in the element store for a token attached
    /// this way.
    pub fn binding_mode(self) -> BindingMode {
        if self.is_endorsing() {
            BindingMode::Endorsing
        } else {
            BindingMode::Unknown
        }
    }
}

/// The configured expectation for one supporting token.
pub struct SupportingTokenSpec {
    pub authenticator: Arc<dyn TokenAuthenticator>,
    pub attachment_mode: AttachmentMode,
    pub is_optional: bool,
    pub require_derived_keys: bool,
    /// Asymmetric-key tokens endorse with their own key and are exempt from
    /// the derived-key requirement.
    pub has_asymmetric_key: bool,
}

/// Which result collection a verified supporting token lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportingTokenCategory {
    Basic,
    Signed,
    Endorsing,
    SignedEndorsing,
}

/// Tracks one expected (or spawned) supporting token through the run.
pub struct TokenTracker {
    pub spec: Option<Arc<SupportingTokenSpec>>,
    pub token: Option<Arc<SecurityToken>>,
    pub is_derived_from: bool,
    pub is_signed: bool,
    pub is_encrypted: bool,
    pub is_endorsing: bool,
    pub already_read_endorsing_signature: bool,
    allow_first_token_mismatch: bool,
}

impl TokenTracker {
    pub fn new(spec: Option<Arc<SupportingTokenSpec>>) -> Self {
        TokenTracker {
            spec,
            token: None,
            is_derived_from: false,
            is_signed: false,
            is_encrypted: false,
            is_endorsing: false,
            already_read_endorsing_signature: false,
            allow_first_token_mismatch: false,
        }
    }

    /// A tracker pre-seeded with an out-of-band token. When
    /// `allow_first_token_mismatch` is set, the first in-band token may
    /// replace the seeded one if both are X.509 tokens with equal
    /// thumbprints.
    pub fn with_expected_token(
        token: Arc<SecurityToken>,
        allow_first_token_mismatch: bool,
    ) -> Self {
        TokenTracker {
            spec: None,
            token: Some(token),
            is_derived_from: false,
            is_signed: false,
            is_encrypted: false,
            is_endorsing: false,
            already_read_endorsing_signature: false,
            allow_first_token_mismatch,
        }
    }

    pub fn record_token(&mut self, token: Arc<SecurityToken>) -> Result<()> {
        match &self.token {
            None => {
                self.token = Some(token);
                Ok(())
            }
            Some(existing) if self.allow_first_token_mismatch => {
                if !existing.matches_by_thumbprint(&token) {
                    return Err(Error::TokenConsistency(
                        "in-band token does not match the expected certificate".into(),
                    ));
                }
                self.token = Some(token);
                self.allow_first_token_mismatch = false;
                Ok(())
            }
            Some(existing) if SecurityToken::same_identity(existing, &token) => Ok(()),
            Some(_) => Err(Error::TokenConsistency(
                "mismatched tokens attributed to the same party".into(),
            )),
        }
    }

    /// Render the end-of-run verdict for this tracker against its spec.
    /// `Ok(None)` means an optional token that never showed up.
    pub fn verify(
        &self,
        require_message_protection: bool,
        enforce_derived_key_requirement: bool,
    ) -> Result<Option<SupportingTokenCategory>> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| Error::TokenConsistency("tracker has no supporting spec".into()))?;

        if self.token.is_none() {
            if spec.is_optional {
                return Ok(None);
            }
            return Err(Error::MissingElement(
                "a required supporting token was not provided".into(),
            ));
        }

        if spec.require_derived_keys
            && !spec.has_asymmetric_key
            && !self.is_derived_from
            && enforce_derived_key_requirement
        {
            return Err(Error::TokenConsistency(
                "supporting token was required to be used via derived keys".into(),
            ));
        }

        let category = match spec.attachment_mode {
            AttachmentMode::SignedEncrypted => {
                if require_message_protection {
                    if !self.is_signed {
                        return Err(Error::TokenConsistency(
                            "basic supporting token was not signed".into(),
                        ));
                    }
                    if !self.is_encrypted {
                        return Err(Error::TokenConsistency(
                            "basic supporting token was not encrypted".into(),
                        ));
                    }
                }
                SupportingTokenCategory::Basic
            }
            AttachmentMode::Signed => {
                if require_message_protection && !self.is_signed {
                    return Err(Error::TokenConsistency(
                        "signed supporting token was not signed".into(),
                    ));
                }
                SupportingTokenCategory::Signed
            }
            AttachmentMode::Endorsing => {
                if !self.is_endorsing {
                    return Err(Error::TokenConsistency(
                        "endorsing supporting token did not endorse the primary signature".into(),
                    ));
                }
                SupportingTokenCategory::Endorsing
            }
            AttachmentMode::SignedEndorsing => {
                if require_message_protection && !self.is_signed {
                    return Err(Error::TokenConsistency(
                        "signed endorsing supporting token was not signed".into(),
                    ));
                }
                if !self.is_endorsing {
                    return Err(Error::TokenConsistency(
                        "signed endorsing supporting token did not endorse the primary signature"
                            .into(),
                    ));
                }
                SupportingTokenCategory::SignedEndorsing
            }
        };
        Ok(Some(category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigtuna_tokens::authenticator::SymmetricTokenAuthenticator;

    fn spec(mode: AttachmentMode, optional: bool, derived: bool) -> Arc<SupportingTokenSpec> {
        Arc::new(SupportingTokenSpec {
            authenticator: SymmetricTokenAuthenticator::new("support"),
            attachment_mode: mode,
            is_optional: optional,
            require_derived_keys: derived,
            has_asymmetric_key: false,
        })
    }

    #[test]
    fn test_operation_tracker_rejects_second_token() {
        let mut t = OperationTracker::new();
        let a = SecurityToken::symmetric(None, vec![1; 16]);
        let b = SecurityToken::symmetric(None, vec![2; 16]);
        t.record_token(Arc::clone(&a)).expect("first token");
        t.record_token(Arc::clone(&a)).expect("same token again");
        assert!(matches!(
            t.record_token(b).unwrap_err(),
            Error::TokenConsistency(_)
        ));
    }

    #[test]
    fn test_operation_tracker_collapses_derivation() {
        use sigtuna_tokens::token::TokenKind;
        let root = SecurityToken::symmetric(Some("root".into()), vec![7; 32]);
        let derived = Arc::new(SecurityToken {
            id: None,
            name: None,
            kind: TokenKind::DerivedKey {
                root: Arc::clone(&root),
                key: vec![1; 16],
            },
        });
        let mut t = OperationTracker::new();
        t.record_token(derived).expect("derived token");
        t.set_derivation_source_if_required();
        assert!(t.is_derived_token());
        assert!(SecurityToken::same_identity(t.token().expect("token"), &root));
    }

    #[test]
    fn test_first_token_mismatch_allows_thumbprint_equal_x509() {
        let expected = SecurityToken::x509(None, b"the-cert".to_vec());
        let in_band = SecurityToken::x509(Some("bst-1".into()), b"the-cert".to_vec());
        let other = SecurityToken::x509(None, b"other-cert".to_vec());

        let mut t = TokenTracker::with_expected_token(Arc::clone(&expected), true);
        t.record_token(Arc::clone(&in_band)).expect("replaced");
        assert!(SecurityToken::same_identity(
            t.token.as_ref().expect("token"),
            &in_band
        ));
        // the carve-out is single use
        assert!(t.record_token(other).is_err());
    }

    #[test]
    fn test_first_token_mismatch_is_x509_only() {
        let expected = SecurityToken::symmetric(None, vec![1; 16]);
        let in_band = SecurityToken::symmetric(None, vec![1; 16]);
        let mut t = TokenTracker::with_expected_token(expected, true);
        assert!(matches!(
            t.record_token(in_band).unwrap_err(),
            Error::TokenConsistency(_)
        ));
    }

    #[test]
    fn test_verify_optional_absent_token_is_skipped() {
        let t = TokenTracker::new(Some(spec(AttachmentMode::Signed, true, false)));
        assert_eq!(t.verify(true, true).expect("skip"), None);

        let t = TokenTracker::new(Some(spec(AttachmentMode::Signed, false, false)));
        assert!(matches!(
            t.verify(true, true).unwrap_err(),
            Error::MissingElement(_)
        ));
    }

    #[test]
    fn test_verify_basic_token_requires_signed_and_encrypted() {
        let mut t = TokenTracker::new(Some(spec(AttachmentMode::SignedEncrypted, false, false)));
        t.record_token(SecurityToken::symmetric(None, vec![1; 16]))
            .expect("token");
        assert!(t.verify(true, true).is_err());

        t.is_signed = true;
        assert!(t.verify(true, true).is_err());
        t.is_encrypted = true;
        assert_eq!(
            t.verify(true, true).expect("basic"),
            Some(SupportingTokenCategory::Basic)
        );

        // without message protection the flags are not checkable
        let mut unprotected =
            TokenTracker::new(Some(spec(AttachmentMode::SignedEncrypted, false, false)));
        unprotected
            .record_token(SecurityToken::symmetric(None, vec![1; 16]))
            .expect("token");
        assert_eq!(
            unprotected.verify(false, true).expect("basic"),
            Some(SupportingTokenCategory::Basic)
        );
    }

    #[test]
    fn test_verify_endorsing_token_must_endorse() {
        let mut t = TokenTracker::new(Some(spec(AttachmentMode::Endorsing, false, false)));
        t.record_token(SecurityToken::symmetric(None, vec![1; 16]))
            .expect("token");
        assert!(t.verify(false, true).is_err());
        t.is_endorsing = true;
        assert_eq!(
            t.verify(false, true).expect("endorsing"),
            Some(SupportingTokenCategory::Endorsing)
        );
    }

    #[test]
    fn test_verify_derived_key_requirement() {
        let mut t = TokenTracker::new(Some(spec(AttachmentMode::Endorsing, false, true)));
        t.record_token(SecurityToken::symmetric(None, vec![1; 16]))
            .expect("token");
        t.is_endorsing = true;
        assert!(matches!(
            t.verify(false, true).unwrap_err(),
            Error::TokenConsistency(_)
        ));
        // enforcement can be relaxed by configuration
        assert!(t.verify(false, false).is_ok());
        t.is_derived_from = true;
        assert!(t.verify(false, true).is_ok());
    }
}
