//! Environmental sensor logger.
//!
//! Samples a set of sensors on a fixed interval, rejects implausible
//! readings, and writes one batch per cycle to InfluxDB. Batches that
//! cannot be delivered are kept in a bounded on-disk spool and replayed
//! oldest first once the database is reachable again.

pub mod agent;
pub mod batch;
pub mod config;
pub mod delivery;
pub mod export;
pub mod metric;
pub mod sensor;
pub mod spool;
pub mod stabilize;
