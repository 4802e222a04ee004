//! Application layer.
//!
//! Port definitions the infrastructure adapters implement.

/// Port interfaces for transports and event storage.
pub mod ports;
