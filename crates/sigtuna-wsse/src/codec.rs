#![forbid(unsafe_code)]

//! The codec seam.
//!
//! The processor never touches XML. A [`SecurityHeaderCodec`] owns all
//! parsing and cryptography over some raw element representation; the
//! processor drives it positionally and interprets the structured results.
//! [`HeaderSource`] is the enclosing message's view of the header: a
//! positional element reader plus the understood mark.

use crate::element::{
    ElementKind, EncryptedDataElement, ReferenceListElement, SignatureConfirmationElement,
    SignatureElement,
};
use sigtuna_core::Result;
use sigtuna_tokens::{DerivedKeyStub, SecurityTimestamp, SecurityToken, TokenResolver};
use std::sync::Arc;

/// A token parsed off the wire: resolved, or a derived-key stub whose source
/// is not yet known.
pub enum ParsedToken {
    Token(Arc<SecurityToken>),
    DerivedKeyStub(DerivedKeyStub),
}

/// The result of decrypting one `EncryptedData`: the plaintext re-parsed into
/// a raw element, the token that keyed the decryption, and the captured
/// plaintext bytes.
pub struct DecryptedContent<R> {
    pub raw: R,
    pub encryption_token: Arc<SecurityToken>,
    pub buffer: Vec<u8>,
}

/// Parsing and cryptography over raw header elements.
pub trait SecurityHeaderCodec {
    type Raw;

    /// Classify a raw element by its qualified name.
    fn kind_of(&self, raw: &Self::Raw) -> ElementKind;

    fn read_signature(&self, raw: &Self::Raw) -> Result<SignatureElement>;

    fn read_reference_list(&self, raw: &Self::Raw) -> Result<ReferenceListElement>;

    fn read_timestamp(&self, raw: &Self::Raw) -> Result<SecurityTimestamp>;

    fn read_encrypted_data(&self, raw: &Self::Raw) -> Result<EncryptedDataElement>;

    fn read_signature_confirmation(&self, raw: &Self::Raw)
        -> Result<SignatureConfirmationElement>;

    /// Read a top-level `SecurityTokenReference`, returning its id if any.
    fn read_token_reference(&self, raw: &Self::Raw) -> Result<Option<String>>;

    /// Parse a token element. Derived-key tokens come back as stubs; the
    /// processor decides when failure to resolve their source is fatal.
    fn read_token(&self, raw: &Self::Raw, resolver: &dyn TokenResolver) -> Result<ParsedToken>;

    /// Unwrap an `EncryptedKey` into a wrapped-key token, including its
    /// embedded reference list if one is present.
    fn decrypt_wrapped_key(&self, raw: &Self::Raw) -> Result<Arc<SecurityToken>>;

    /// Decrypt one `EncryptedData`. The key comes from the element's own key
    /// identifier resolved against `resolver`, or from `wrapped_key` when the
    /// element was referenced by a wrapped key's reference list.
    fn decrypt_element(
        &self,
        data: &EncryptedDataElement,
        wrapped_key: Option<&Arc<SecurityToken>>,
        resolver: &dyn TokenResolver,
    ) -> Result<DecryptedContent<Self::Raw>>;

    /// Verify a signature cryptographically, resolving its key identifier
    /// against `resolver`. Returns the signing token.
    fn verify_signature(
        &self,
        signature: &SignatureElement,
        is_primary: bool,
        resolver: &dyn TokenResolver,
    ) -> Result<Arc<SecurityToken>>;
}

/// The enclosing message's view of one security header.
pub trait HeaderSource {
    type Raw;

    /// The next top-level child element, in wire order.
    fn next_element(&mut self) -> Option<Self::Raw>;

    /// Mark the header as understood. Called only after processing succeeds.
    fn mark_understood(&mut self);
}

/// An in-memory header source over pre-collected elements.
pub struct VecHeaderSource<R> {
    elements: std::vec::IntoIter<R>,
    understood: bool,
}

impl<R> VecHeaderSource<R> {
    pub fn new(elements: Vec<R>) -> Self {
        VecHeaderSource {
            elements: elements.into_iter(),
            understood: false,
        }
    }

    pub fn is_understood(&self) -> bool {
        self.understood
    }
}

impl<R> HeaderSource for VecHeaderSource<R> {
    type Raw = R;

    fn next_element(&mut self) -> Option<R> {
        self.elements.next()
    }

    fn mark_understood(&mut self) {
        self.understood = true;
    }
}
