//! Management protocol schema and wire framing.

pub mod codec;
pub mod models;
