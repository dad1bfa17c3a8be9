#![forbid(unsafe_code)]

//! Algorithm URI constants and algorithm-suite descriptions.
//!
//! Each constant is the canonical URI string that appears in `Algorithm`
//! attributes of WS-Security header elements.

// ── Digest algorithms ────────────────────────────────────────────────

pub const SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

// ── Signature algorithms ─────────────────────────────────────────────

pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const HMAC_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#hmac-sha1";
pub const HMAC_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256";

// ── Encryption algorithms ────────────────────────────────────────────

pub const AES128_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";
pub const AES256_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";
pub const KW_AES128: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes128";
pub const KW_AES256: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes256";

// ── Key derivation ───────────────────────────────────────────────────

/// P_SHA-1 key derivation (WS-SecureConversation February 2005).
pub const PSHA1_KEY_DERIVATION: &str =
    "http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha1";

/// P_SHA-1 key derivation (WS-SecureConversation December 2005 / 1.3).
pub const PSHA1_KEY_DERIVATION_DEC2005: &str =
    "http://docs.oasis-open.org/ws-sx/ws-secureconversation/200512/dk/p_sha1";

/// A named family of algorithms negotiated for one binding.
///
/// The processing engine only consumes the derivation lengths and the digest
/// URI; concrete signature/encryption algorithm dispatch happens behind the
/// codec seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmSuite {
    pub name: &'static str,
    pub default_digest: &'static str,
    pub default_signature_algorithm: &'static str,
    pub default_encryption_algorithm: &'static str,
    pub default_key_derivation_algorithm: &'static str,
    /// Bits of derived key material for signing keys.
    pub default_signature_key_derivation_length: usize,
    /// Bits of derived key material for encryption keys.
    pub default_encryption_key_derivation_length: usize,
}

impl AlgorithmSuite {
    pub const fn basic128() -> Self {
        AlgorithmSuite {
            name: "Basic128",
            default_digest: SHA1,
            default_signature_algorithm: HMAC_SHA1,
            default_encryption_algorithm: AES128_CBC,
            default_key_derivation_algorithm: PSHA1_KEY_DERIVATION,
            default_signature_key_derivation_length: 128,
            default_encryption_key_derivation_length: 128,
        }
    }

    pub const fn basic256() -> Self {
        AlgorithmSuite {
            name: "Basic256",
            default_digest: SHA256,
            default_signature_algorithm: HMAC_SHA256,
            default_encryption_algorithm: AES256_CBC,
            default_key_derivation_algorithm: PSHA1_KEY_DERIVATION,
            default_signature_key_derivation_length: 192,
            default_encryption_key_derivation_length: 256,
        }
    }

    /// Upper bound, in bytes, on a single derived key this suite permits.
    pub fn max_derived_key_length(&self) -> usize {
        let bits = self
            .default_signature_key_derivation_length
            .max(self.default_encryption_key_derivation_length);
        bits / 8
    }
}

impl Default for AlgorithmSuite {
    fn default() -> Self {
        Self::basic256()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_derived_key_length() {
        assert_eq!(AlgorithmSuite::basic128().max_derived_key_length(), 16);
        assert_eq!(AlgorithmSuite::basic256().max_derived_key_length(), 32);
    }
}
