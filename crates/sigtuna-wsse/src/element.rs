#![forbid(unsafe_code)]

//! The ordered header element store.
//!
//! Every top-level child of the security header occupies one position, in
//! wire order. Positions never move: decrypting an `EncryptedData` replaces
//! the payload at its position, and materializing a derived-key stub does the
//! same. Per-position bookkeeping (signed/encrypted flags, encrypted-form
//! ids) lives here so protection accounting can run over the final store.

use sigtuna_core::{Error, Result};
use sigtuna_tokens::{DerivedKeyStub, KeyIdentifier, SecurityTimestamp, SecurityToken};
use std::sync::Arc;

/// How an element is bound to the message security: by the primary token, by
/// an endorsing supporting token, or not yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    Primary,
    Endorsing,
    Unknown,
}

/// A parsed `ds:Signature`, crypto not yet verified.
#[derive(Debug, Clone)]
pub struct SignatureElement {
    pub id: Option<String>,
    pub signature_value: Vec<u8>,
    /// Reference to the signing key.
    pub key_identifier: KeyIdentifier,
    /// Ids (without the `#`) of the elements covered by the signature.
    pub reference_ids: Vec<String>,
}

/// A parsed `xenc:ReferenceList`.
#[derive(Debug, Clone)]
pub struct ReferenceListElement {
    pub data_references: Vec<String>,
}

/// A parsed `xenc:EncryptedData`, not yet decrypted.
#[derive(Debug, Clone)]
pub struct EncryptedDataElement {
    pub id: Option<String>,
    pub wsu_id: Option<String>,
    pub cipher_value: Vec<u8>,
    /// Key reference from the element's own `ds:KeyInfo`, if present.
    pub key_identifier: Option<KeyIdentifier>,
}

/// A parsed `wsse11:SignatureConfirmation`.
#[derive(Debug, Clone)]
pub struct SignatureConfirmationElement {
    pub value: Vec<u8>,
}

/// A token-position payload: either a resolved token or a derived-key stub
/// waiting for its source.
#[derive(Debug, Clone)]
pub enum TokenEntry {
    Resolved(Arc<SecurityToken>),
    Stub(DerivedKeyStub),
}

/// The payload currently held at a store position.
#[derive(Debug, Clone)]
pub enum ElementPayload {
    Signature(SignatureElement),
    ReferenceList(ReferenceListElement),
    Timestamp(SecurityTimestamp),
    /// The wrapped-key token produced by unwrapping an `EncryptedKey`.
    EncryptedKey(Arc<SecurityToken>),
    EncryptedData(EncryptedDataElement),
    Token(TokenEntry),
    SignatureConfirmation(SignatureConfirmationElement),
    /// A `wsse:SecurityTokenReference` appearing as a top-level child; kept
    /// for protection accounting, otherwise uninterpreted.
    TokenReference { id: Option<String> },
}

/// Element kinds, used for classification and protection-part configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Signature,
    ReferenceList,
    Timestamp,
    EncryptedKey,
    EncryptedData,
    Token,
    SignatureConfirmation,
    TokenReference,
}

impl ElementPayload {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementPayload::Signature(_) => ElementKind::Signature,
            ElementPayload::ReferenceList(_) => ElementKind::ReferenceList,
            ElementPayload::Timestamp(_) => ElementKind::Timestamp,
            ElementPayload::EncryptedKey(_) => ElementKind::EncryptedKey,
            ElementPayload::EncryptedData(_) => ElementKind::EncryptedData,
            ElementPayload::Token(_) => ElementKind::Token,
            ElementPayload::SignatureConfirmation(_) => ElementKind::SignatureConfirmation,
            ElementPayload::TokenReference { .. } => ElementKind::TokenReference,
        }
    }

    /// The wire-form id of the payload, if it carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            ElementPayload::Signature(s) => s.id.as_deref(),
            ElementPayload::ReferenceList(_) => None,
            ElementPayload::Timestamp(t) => t.id.as_deref(),
            ElementPayload::EncryptedKey(t) => t.id.as_deref(),
            ElementPayload::EncryptedData(d) => d.id.as_deref(),
            ElementPayload::Token(TokenEntry::Resolved(t)) => t.id.as_deref(),
            ElementPayload::Token(TokenEntry::Stub(s)) => s.id.as_deref(),
            ElementPayload::SignatureConfirmation(_) => None,
            ElementPayload::TokenReference { id } => id.as_deref(),
        }
    }
}

/// One position in the store.
#[derive(Debug, Clone)]
pub struct ElementEntry {
    pub payload: ElementPayload,
    pub binding_mode: BindingMode,
    /// The element arrived inside an `EncryptedData` and was decrypted.
    pub encrypted: bool,
    /// The element is covered by the primary signature.
    pub signed: bool,
    /// Wire id of the `EncryptedData` the element arrived inside.
    pub encrypted_form_id: Option<String>,
    pub encrypted_form_wsu_id: Option<String>,
    /// Set when a token was nested in two layers of encryption; signature
    /// references may then name either layer's id.
    pub double_encrypted: bool,
    /// Plaintext captured at decryption, kept for signature verification over
    /// the decrypted form.
    pub decrypted_buffer: Option<Vec<u8>>,
}

impl ElementEntry {
    fn new(payload: ElementPayload, binding_mode: BindingMode) -> Self {
        ElementEntry {
            payload,
            binding_mode,
            encrypted: false,
            signed: false,
            encrypted_form_id: None,
            encrypted_form_wsu_id: None,
            double_encrypted: false,
            decrypted_buffer: None,
        }
    }

    /// Whether a signature reference naming `id` covers this entry. The
    /// decrypted-form id is tried first; for double-encrypted entries either
    /// encrypted-form id also matches.
    pub fn matches_id(&self, id: &str) -> bool {
        if self.payload.id() == Some(id) {
            return true;
        }
        if self.double_encrypted {
            return self.encrypted_form_id.as_deref() == Some(id)
                || self.encrypted_form_wsu_id.as_deref() == Some(id);
        }
        false
    }
}

/// The ordered, mutable element store.
#[derive(Debug, Default)]
pub struct ElementManager {
    entries: Vec<ElementEntry>,
}

impl ElementManager {
    pub fn new() -> Self {
        ElementManager::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&ElementEntry> {
        self.entries.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ElementEntry)> {
        self.entries.iter().enumerate()
    }

    /// Append a new wire element; returns its position.
    pub fn append(&mut self, payload: ElementPayload, binding_mode: BindingMode) -> usize {
        self.entries.push(ElementEntry::new(payload, binding_mode));
        self.entries.len() - 1
    }

    /// Replace the payload at a position in place, keeping flags. Used when a
    /// derived-key stub is materialized into its token.
    pub fn replace_payload(&mut self, position: usize, payload: ElementPayload) {
        self.entries[position].payload = payload;
    }

    /// Replace the payload at a position with its decrypted form, recording
    /// the encrypted-form ids and the captured plaintext.
    pub fn replace_after_decryption(
        &mut self,
        position: usize,
        payload: ElementPayload,
        encrypted_form_id: Option<String>,
        encrypted_form_wsu_id: Option<String>,
        decrypted_buffer: Vec<u8>,
    ) {
        let entry = &mut self.entries[position];
        entry.payload = payload;
        entry.encrypted = true;
        entry.encrypted_form_id = encrypted_form_id;
        entry.encrypted_form_wsu_id = encrypted_form_wsu_id;
        entry.decrypted_buffer = Some(decrypted_buffer);
    }

    pub fn set_binding_mode(&mut self, position: usize, mode: BindingMode) {
        self.entries[position].binding_mode = mode;
    }

    pub fn set_double_encrypted(&mut self, position: usize) {
        self.entries[position].double_encrypted = true;
    }

    /// Mark every entry matching `id` as covered by the primary signature.
    /// Returns whether anything matched.
    pub fn mark_signed(&mut self, id: &str) -> bool {
        let mut matched = false;
        for entry in &mut self.entries {
            if entry.matches_id(id) {
                entry.signed = true;
                matched = true;
            }
        }
        matched
    }

    /// Find the position of a not-yet-decrypted `EncryptedData` matching the
    /// given data-reference id.
    pub fn find_encrypted_data(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| {
            matches!(&e.payload, ElementPayload::EncryptedData(d)
                if d.id.as_deref() == Some(id) || d.wsu_id.as_deref() == Some(id))
        })
    }

    /// The primary signature entry, if one has been recorded.
    pub fn primary_signature(&self) -> Option<(usize, &SignatureElement)> {
        self.entries.iter().enumerate().find_map(|(i, e)| {
            match (&e.payload, e.binding_mode) {
                (ElementPayload::Signature(sig), BindingMode::Primary) => Some((i, sig)),
                _ => None,
            }
        })
    }

    pub fn has_timestamp(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.payload, ElementPayload::Timestamp(_)))
    }

    pub fn timestamp(&self) -> Option<&SecurityTimestamp> {
        self.entries.iter().find_map(|e| match &e.payload {
            ElementPayload::Timestamp(t) => Some(t),
            _ => None,
        })
    }

    /// Confirm that at least one `SignatureConfirmation` element was present.
    pub fn verify_signature_confirmation_was_found(&self) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|e| matches!(e.payload, ElementPayload::SignatureConfirmation(_)))
        {
            Ok(())
        } else {
            Err(Error::MissingElement(
                "a signature confirmation was expected but none was present".into(),
            ))
        }
    }

    /// Enforce the configured per-kind protection requirements over the final
    /// store state.
    pub fn ensure_required_targets_protected(
        &self,
        required_signed: &[ElementKind],
        required_encrypted: &[ElementKind],
    ) -> Result<()> {
        // a required kind with no entry at all is as much a violation as an
        // unprotected one: stripping the element must not bypass the check
        for kind in required_signed {
            let mut present = false;
            for entry in &self.entries {
                if entry.payload.kind() != *kind {
                    continue;
                }
                present = true;
                if !entry.signed {
                    return Err(Error::Structure(format!(
                        "required element {kind:?} was not signed"
                    )));
                }
            }
            if !present {
                return Err(Error::MissingElement(format!(
                    "required element {kind:?} was absent from the security header"
                )));
            }
        }
        for kind in required_encrypted {
            let mut present = false;
            for entry in &self.entries {
                if entry.payload.kind() != *kind {
                    continue;
                }
                present = true;
                if !entry.encrypted {
                    return Err(Error::Structure(format!(
                        "required element {kind:?} was not encrypted"
                    )));
                }
            }
            if !present {
                return Err(Error::MissingElement(format!(
                    "required element {kind:?} was absent from the security header"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypted_data(id: &str) -> ElementPayload {
        ElementPayload::EncryptedData(EncryptedDataElement {
            id: Some(id.into()),
            wsu_id: None,
            cipher_value: vec![0xCC; 8],
            key_identifier: None,
        })
    }

    fn token(id: &str) -> ElementPayload {
        ElementPayload::Token(TokenEntry::Resolved(SecurityToken::symmetric(
            Some(id.to_string()),
            vec![1; 16],
        )))
    }

    #[test]
    fn test_positions_are_stable_across_decryption() {
        let mut store = ElementManager::new();
        let p0 = store.append(encrypted_data("ed-1"), BindingMode::Unknown);
        let p1 = store.append(token("tok-1"), BindingMode::Unknown);
        assert_eq!((p0, p1), (0, 1));

        store.replace_after_decryption(
            p0,
            token("inner-tok"),
            Some("ed-1".into()),
            None,
            b"plaintext".to_vec(),
        );
        let entry = store.get(p0).expect("entry");
        assert!(entry.encrypted);
        assert_eq!(entry.payload.id(), Some("inner-tok"));
        assert_eq!(entry.decrypted_buffer.as_deref(), Some(&b"plaintext"[..]));
        assert_eq!(store.get(p1).expect("entry").payload.id(), Some("tok-1"));
    }

    #[test]
    fn test_signature_reference_matches_decrypted_form_id() {
        let mut store = ElementManager::new();
        let p = store.append(encrypted_data("ed-1"), BindingMode::Unknown);
        store.replace_after_decryption(p, token("inner"), Some("ed-1".into()), None, Vec::new());

        assert!(store.mark_signed("inner"));
        // without the double-encrypted flag the encrypted-form id does not match
        assert!(!store.mark_signed("ed-1"));
    }

    #[test]
    fn test_double_encrypted_entry_matches_either_id() {
        let mut store = ElementManager::new();
        let p = store.append(encrypted_data("outer"), BindingMode::Unknown);
        store.replace_after_decryption(
            p,
            token("inner"),
            Some("outer".into()),
            Some("outer-wsu".into()),
            Vec::new(),
        );
        store.set_double_encrypted(p);

        assert!(store.get(p).expect("entry").matches_id("inner"));
        assert!(store.mark_signed("outer"));
        assert!(store.mark_signed("outer-wsu"));
        assert!(!store.mark_signed("unrelated"));
    }

    #[test]
    fn test_primary_signature_lookup() {
        let mut store = ElementManager::new();
        store.append(token("tok"), BindingMode::Primary);
        let p = store.append(
            ElementPayload::Signature(SignatureElement {
                id: Some("sig-1".into()),
                signature_value: vec![9; 4],
                key_identifier: KeyIdentifier::default(),
                reference_ids: vec!["tok".into()],
            }),
            BindingMode::Primary,
        );
        let (pos, sig) = store.primary_signature().expect("primary signature");
        assert_eq!(pos, p);
        assert_eq!(sig.id.as_deref(), Some("sig-1"));
    }

    #[test]
    fn test_required_targets_accounting() {
        let mut store = ElementManager::new();
        let ts = store.append(
            ElementPayload::Timestamp(SecurityTimestamp::new(
                Some("ts".into()),
                chrono::Utc::now(),
                chrono::Utc::now() + chrono::Duration::seconds(300),
            )),
            BindingMode::Unknown,
        );
        store
            .ensure_required_targets_protected(&[], &[])
            .expect("nothing required");
        let err = store
            .ensure_required_targets_protected(&[ElementKind::Timestamp], &[])
            .unwrap_err();
        assert!(matches!(err, Error::Structure(_)));

        store.mark_signed("ts");
        assert!(store.get(ts).expect("entry").signed);
        store
            .ensure_required_targets_protected(&[ElementKind::Timestamp], &[])
            .expect("timestamp signed");
    }

    #[test]
    fn test_absent_required_kind_is_rejected() {
        let store = ElementManager::new();
        let err = store
            .ensure_required_targets_protected(&[ElementKind::Timestamp], &[])
            .unwrap_err();
        assert!(matches!(err, Error::MissingElement(_)));
        let err = store
            .ensure_required_targets_protected(&[], &[ElementKind::Token])
            .unwrap_err();
        assert!(matches!(err, Error::MissingElement(_)));
    }

    #[test]
    fn test_signature_confirmation_presence_check() {
        let mut store = ElementManager::new();
        assert!(store.verify_signature_confirmation_was_found().is_err());
        store.append(
            ElementPayload::SignatureConfirmation(SignatureConfirmationElement {
                value: vec![1, 2, 3],
            }),
            BindingMode::Unknown,
        );
        store
            .verify_signature_confirmation_was_found()
            .expect("confirmation present");
    }
}
