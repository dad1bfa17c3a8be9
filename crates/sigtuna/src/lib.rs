#![forbid(unsafe_code)]

pub use sigtuna_core as core;
pub use sigtuna_tokens as tokens;
pub use sigtuna_wsse as wsse;

pub use sigtuna_core::{Error, FaultClass, Result};
pub use sigtuna_wsse::{ProcessedSecurityHeader, ProcessorConfig, SecurityHeaderProcessor};
