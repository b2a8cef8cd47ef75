//! Traffic metering.

pub mod counter;
