#![forbid(unsafe_code)]

//! Core types shared across the Sigtuna WS-Security library.

pub mod algorithm;
pub mod error;
pub mod ns;

pub use algorithm::AlgorithmSuite;
pub use error::{Error, FaultClass, Result};
