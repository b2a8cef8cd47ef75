//! Session devices: persisted records, the live system view and the
//! reconciliation job between them.

pub mod reconcile;
pub mod records;
pub mod system;
