//! Durable license storage.

pub mod file;
pub mod format;
