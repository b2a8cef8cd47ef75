//! Certificate digests and server trust evaluation.

pub mod digest;
pub mod trust;
pub mod verifier;
