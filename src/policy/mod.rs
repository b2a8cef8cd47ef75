//! Admission policy.

pub mod admission;
