#![forbid(unsafe_code)]

//! Protection-order tracking.
//!
//! A small automaton fed one event per cryptographic operation observed while
//! walking the header: `on_process_signature` when a signature is verified,
//! `on_process_reference_list` when a reference list triggers decryption, and
//! `on_encrypted_key` when a wrapped key is unwrapped. The final state decides
//! whether the header honored the required sign/encrypt ordering.

use sigtuna_core::{Error, Result};

/// The sign/encrypt ordering a binding requires of incoming messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionOrder {
    SignBeforeEncrypt,
    /// Sign first, then encrypt, with the signature itself encrypted.
    SignBeforeEncryptAndEncryptSignature,
    EncryptBeforeSign,
}

impl ProtectionOrder {
    pub fn requires_encrypted_signature(self) -> bool {
        matches!(self, ProtectionOrder::SignBeforeEncryptAndEncryptSignature)
    }
}

/// Observed interleaving of verification and decryption, coarsened to the six
/// states the ordering check needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SigningOrder {
    None = 0,
    Verify = 1,
    Decrypt = 2,
    /// All decryption happened before any verification.
    DecryptVerify = 3,
    /// All verification happened before any decryption.
    VerifyDecrypt = 4,
    Mixed = 5,
}

const ON_DECRYPT: [SigningOrder; 6] = [
    SigningOrder::Decrypt,       // None
    SigningOrder::VerifyDecrypt, // Verify
    SigningOrder::Decrypt,       // Decrypt
    SigningOrder::Mixed,         // DecryptVerify
    SigningOrder::VerifyDecrypt, // VerifyDecrypt
    SigningOrder::Mixed,         // Mixed
];

const ON_VERIFY: [SigningOrder; 6] = [
    SigningOrder::Verify,        // None
    SigningOrder::Verify,        // Verify
    SigningOrder::DecryptVerify, // Decrypt
    SigningOrder::DecryptVerify, // DecryptVerify
    SigningOrder::Mixed,         // VerifyDecrypt
    SigningOrder::Mixed,         // Mixed
];

#[derive(Debug)]
pub struct OrderTracker {
    state: SigningOrder,
    reference_list_count: u32,
    signature_count: u32,
    unencrypted_signature_count: u32,
    wrapped_key_count: u32,
    enforce: Option<ProtectionOrder>,
}

impl OrderTracker {
    pub fn new(enforce: Option<ProtectionOrder>) -> Self {
        OrderTracker {
            state: SigningOrder::None,
            reference_list_count: 0,
            signature_count: 0,
            unencrypted_signature_count: 0,
            wrapped_key_count: 0,
            enforce,
        }
    }

    pub fn on_process_signature(&mut self, is_encrypted: bool) -> Result<()> {
        if self.signature_count > 0 {
            return Err(Error::Structure(
                "more than one primary signature in the security header".into(),
            ));
        }
        self.signature_count += 1;
        if !is_encrypted {
            self.unencrypted_signature_count += 1;
        }
        self.state = ON_VERIFY[self.state as usize];
        self.enforce_protection_order()
    }

    pub fn on_process_reference_list(&mut self) -> Result<()> {
        if self.reference_list_count > 0 {
            return Err(Error::Structure(
                "more than one reference list in the security header".into(),
            ));
        }
        self.reference_list_count += 1;
        self.state = ON_DECRYPT[self.state as usize];
        self.enforce_protection_order()
    }

    pub fn on_encrypted_key(&mut self) -> Result<()> {
        if self.wrapped_key_count > 0 {
            return Err(Error::Structure(
                "more than one wrapped key token in the security header".into(),
            ));
        }
        self.wrapped_key_count += 1;
        Ok(())
    }

    pub fn primary_signature_done(&self) -> bool {
        self.signature_count > 0
    }

    pub fn all_signatures_encrypted(&self) -> bool {
        self.unencrypted_signature_count == 0
    }

    pub fn enforced_order(&self) -> Option<ProtectionOrder> {
        self.enforce
    }

    /// Relax the enforced order, used when the binding downgrades
    /// encrypt-signature enforcement because the body was not encrypted.
    pub fn set_enforced_order(&mut self, order: Option<ProtectionOrder>) {
        self.enforce = order;
    }

    /// Whether the enforced order (if any) tolerates the observed
    /// interleaving. Runs after every event so violations fail fast, and once
    /// more after the whole header has been walked (the encrypted-signature
    /// requirement can only be confirmed then).
    pub fn enforce_protection_order(&self) -> Result<()> {
        let order = match self.enforce {
            Some(order) => order,
            None => return Ok(()),
        };
        match order {
            ProtectionOrder::SignBeforeEncryptAndEncryptSignature => {
                if self.signature_count > 0 && !self.all_signatures_encrypted() {
                    return Err(Error::ProtectionOrder(
                        "primary signature was required to be encrypted but was not".into(),
                    ));
                }
                self.check_sign_before_encrypt()
            }
            ProtectionOrder::SignBeforeEncrypt => self.check_sign_before_encrypt(),
            ProtectionOrder::EncryptBeforeSign => {
                if matches!(
                    self.state,
                    SigningOrder::DecryptVerify | SigningOrder::Mixed
                ) {
                    return Err(Error::ProtectionOrder(
                        "message protection order was not encrypt-before-sign".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn check_sign_before_encrypt(&self) -> Result<()> {
        if matches!(
            self.state,
            SigningOrder::VerifyDecrypt | SigningOrder::Mixed
        ) {
            return Err(Error::ProtectionOrder(
                "message protection order was not sign-before-encrypt".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_before_encrypt_accepts_decrypt_then_verify() {
        // Encrypted signature arrives, gets decrypted, then verified.
        let mut t = OrderTracker::new(Some(ProtectionOrder::SignBeforeEncrypt));
        t.on_process_reference_list().expect("reference list");
        t.on_process_signature(true).expect("signature");
        t.enforce_protection_order().expect("order honored");
        assert!(t.all_signatures_encrypted());
    }

    #[test]
    fn test_sign_before_encrypt_rejects_verify_then_decrypt() {
        let mut t = OrderTracker::new(Some(ProtectionOrder::SignBeforeEncrypt));
        t.on_process_signature(false).expect("signature");
        let err = t.on_process_reference_list().unwrap_err();
        assert!(matches!(err, Error::ProtectionOrder(_)));
    }

    #[test]
    fn test_encrypt_before_sign_rejects_decrypt_then_verify() {
        let mut t = OrderTracker::new(Some(ProtectionOrder::EncryptBeforeSign));
        t.on_process_reference_list().expect("reference list");
        let err = t.on_process_signature(false).unwrap_err();
        assert!(matches!(err, Error::ProtectionOrder(_)));
    }

    #[test]
    fn test_encrypt_before_sign_accepts_verify_then_decrypt() {
        let mut t = OrderTracker::new(Some(ProtectionOrder::EncryptBeforeSign));
        t.on_process_signature(false).expect("signature");
        t.on_process_reference_list().expect("reference list");
        t.enforce_protection_order().expect("order honored");
    }

    #[test]
    fn test_encrypted_signature_requirement() {
        let mut t = OrderTracker::new(Some(
            ProtectionOrder::SignBeforeEncryptAndEncryptSignature,
        ));
        t.on_process_reference_list().expect("reference list");
        let err = t.on_process_signature(false).unwrap_err();
        assert!(matches!(err, Error::ProtectionOrder(_)));
    }

    #[test]
    fn test_duplicate_operations_are_rejected() {
        let mut t = OrderTracker::new(None);
        t.on_process_signature(false).expect("first signature");
        assert!(matches!(
            t.on_process_signature(false).unwrap_err(),
            Error::Structure(_)
        ));

        let mut t = OrderTracker::new(None);
        t.on_process_reference_list().expect("first reference list");
        assert!(matches!(
            t.on_process_reference_list().unwrap_err(),
            Error::Structure(_)
        ));

        let mut t = OrderTracker::new(None);
        t.on_encrypted_key().expect("first wrapped key");
        assert!(matches!(
            t.on_encrypted_key().unwrap_err(),
            Error::Structure(_)
        ));
    }

    #[test]
    fn test_no_enforcement_accepts_any_interleaving() {
        let mut t = OrderTracker::new(None);
        t.on_process_signature(false).expect("signature");
        t.on_process_reference_list().expect("reference list");
        t.enforce_protection_order().expect("unenforced");
    }

    // With at most one signature and one reference list, every legal event
    // sequence must land in a state the matching enforcement accepts, and
    // enforcement must never panic on any interleaving.
    proptest::proptest! {
        #[test]
        fn prop_enforcement_is_total(
            sig_first in proptest::bool::ANY,
            sig_encrypted in proptest::bool::ANY,
            with_sig in proptest::bool::ANY,
            with_reflist in proptest::bool::ANY,
            order in proptest::option::of(0u8..3),
        ) {
            let enforce = order.map(|o| match o {
                0 => ProtectionOrder::SignBeforeEncrypt,
                1 => ProtectionOrder::SignBeforeEncryptAndEncryptSignature,
                _ => ProtectionOrder::EncryptBeforeSign,
            });
            let mut t = OrderTracker::new(enforce);
            let mut run = |t: &mut OrderTracker, sig: bool| {
                // events fail fast under enforcement; either outcome is fine
                if sig && with_sig {
                    let _ = t.on_process_signature(sig_encrypted);
                } else if !sig && with_reflist {
                    let _ = t.on_process_reference_list();
                }
            };
            run(&mut t, sig_first);
            run(&mut t, !sig_first);
            // outcome may be Ok or Err; it must simply be consistent
            let first = t.enforce_protection_order().is_ok();
            let second = t.enforce_protection_order().is_ok();
            proptest::prop_assert_eq!(first, second);
        }
    }
}
