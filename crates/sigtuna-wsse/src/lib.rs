#![forbid(unsafe_code)]

//! Receive-side WS-Security header processing.
//!
//! The processor consumes the elements of one `wsse:Security` header through
//! a [`codec::SecurityHeaderCodec`], decrypts and verifies them under the
//! configured binding, and returns the tokens and evidence the message layer
//! needs. XML never crosses the crate boundary.

pub mod codec;
pub mod element;
pub mod order;
pub mod processor;
pub mod tracker;

pub use codec::{DecryptedContent, HeaderSource, ParsedToken, SecurityHeaderCodec, VecHeaderSource};
pub use element::{
    BindingMode, ElementEntry, ElementKind, ElementManager, ElementPayload, EncryptedDataElement,
    ReferenceListElement, SignatureConfirmationElement, SignatureElement, TokenEntry,
};
pub use order::{OrderTracker, ProtectionOrder};
pub use processor::{
    ProcessedSecurityHeader, ProcessorConfig, ProtectionParts, SecurityHeaderLayout,
    SecurityHeaderProcessor, SignatureValueEntry, TimeBudget, TokenParameters,
};
pub use tracker::{
    AttachmentMode, OperationTracker, SupportingTokenCategory, SupportingTokenSpec, TokenTracker,
};
