#![forbid(unsafe_code)]

//! XML namespace constants used across the library.

/// WS-Security extension namespace (wsse)
pub const WSSE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";

/// WS-Security 1.1 extension namespace (wsse11)
pub const WSSE11: &str =
    "http://docs.oasis-open.org/wss/oasis-wss-wssecurity-secext-1.1.xsd";

/// WS-Security utility namespace (wsu)
pub const WSU: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";

/// WS-SecureConversation namespace (derived key tokens)
pub const WSC: &str = "http://schemas.xmlsoap.org/ws/2005/02/sc";

/// XML Digital Signature namespace
pub const DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";

/// XML Encryption namespace
pub const ENC: &str = "http://www.w3.org/2001/04/xmlenc#";

// ── Element names ────────────────────────────────────────────────────

pub mod node {
    // Security header and wsse elements
    pub const SECURITY: &str = "Security";
    pub const BINARY_SECURITY_TOKEN: &str = "BinarySecurityToken";
    pub const SECURITY_TOKEN_REFERENCE: &str = "SecurityTokenReference";
    pub const SIGNATURE_CONFIRMATION: &str = "SignatureConfirmation";
    pub const KEY_IDENTIFIER: &str = "KeyIdentifier";

    // wsu elements
    pub const TIMESTAMP: &str = "Timestamp";
    pub const CREATED: &str = "Created";
    pub const EXPIRES: &str = "Expires";

    // WS-SecureConversation elements
    pub const DERIVED_KEY_TOKEN: &str = "DerivedKeyToken";
    pub const SECURITY_CONTEXT_TOKEN: &str = "SecurityContextToken";
    pub const NONCE: &str = "Nonce";
    pub const LABEL: &str = "Label";
    pub const GENERATION: &str = "Generation";
    pub const OFFSET: &str = "Offset";
    pub const LENGTH: &str = "Length";

    // DSig elements
    pub const SIGNATURE: &str = "Signature";
    pub const SIGNED_INFO: &str = "SignedInfo";
    pub const SIGNATURE_VALUE: &str = "SignatureValue";
    pub const REFERENCE: &str = "Reference";
    pub const KEY_INFO: &str = "KeyInfo";

    // XML-Enc elements
    pub const ENCRYPTED_KEY: &str = "EncryptedKey";
    pub const ENCRYPTED_DATA: &str = "EncryptedData";
    pub const REFERENCE_LIST: &str = "ReferenceList";
    pub const DATA_REFERENCE: &str = "DataReference";
    pub const CIPHER_DATA: &str = "CipherData";
    pub const CIPHER_VALUE: &str = "CipherValue";
}

// ── Attribute names ──────────────────────────────────────────────────

pub mod attr {
    pub const ID: &str = "Id";
    pub const URI: &str = "URI";
    pub const VALUE_TYPE: &str = "ValueType";
    pub const ALGORITHM: &str = "Algorithm";
    pub const TYPE: &str = "Type";
}
