#![forbid(unsafe_code)]

/// Errors produced by the Sigtuna WS-Security library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid security header structure: {0}")]
    Structure(String),

    #[error("message protection order violated: {0}")]
    ProtectionOrder(String),

    #[error("security token mismatch: {0}")]
    TokenConsistency(String),

    #[error("derived key limit exceeded: {0}")]
    DerivedKeyQuota(String),

    #[error("replayed or stale message: {0}")]
    Replay(String),

    #[error("cannot resolve key identifier: {0}")]
    Resolution(String),

    #[error("token authentication failed: {0}")]
    FailedAuthentication(String),

    /// Raised by codec implementations when a wire reader exceeds its size or
    /// depth quotas; the engine itself never constructs it.
    #[error("reader quota exceeded: {0}")]
    Quota(String),

    #[error("security header processing timed out: {0}")]
    Timeout(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("missing required element: {0}")]
    MissingElement(String),

    /// Raised by codec implementations decoding base64 wire values; the
    /// engine itself never constructs it.
    #[error("base64 decode error: {0}")]
    Base64(String),
}

/// Coarse fault classification exposed to protocol-level fault mapping.
///
/// Callers must not echo the concrete error text to the wire; the class is
/// the only distinction a remote peer may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// The header could not be parsed or is structurally malformed.
    Malformed,
    /// A token failed authentication.
    FailedAuthentication,
    /// Any other security violation (order, consistency, replay, quota).
    InvalidSecurity,
}

impl Error {
    /// Classify this error for fault mapping.
    pub fn fault_class(&self) -> FaultClass {
        match self {
            Error::Structure(_)
            | Error::MissingElement(_)
            | Error::Base64(_)
            | Error::UnsupportedAlgorithm(_) => FaultClass::Malformed,
            Error::FailedAuthentication(_) => FaultClass::FailedAuthentication,
            _ => FaultClass::InvalidSecurity,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_class_mapping() {
        assert_eq!(
            Error::Structure("two signatures".into()).fault_class(),
            FaultClass::Malformed
        );
        assert_eq!(
            Error::FailedAuthentication("bad token".into()).fault_class(),
            FaultClass::FailedAuthentication
        );
        assert_eq!(
            Error::Replay("nonce seen".into()).fault_class(),
            FaultClass::InvalidSecurity
        );
        assert_eq!(
            Error::ProtectionOrder("mixed".into()).fault_class(),
            FaultClass::InvalidSecurity
        );
    }
}
