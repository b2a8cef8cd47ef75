//! Management channel client: transport, session and reconnect supervision.

pub mod backoff;
pub mod session;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
