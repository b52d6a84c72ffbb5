//! Liveness tracking for long-lived duplex sessions.

pub mod manager;
pub mod record;

pub use manager::{ConnectionStateManager, ConnectionStatistics};
pub use record::{ConnectionRecord, ConnectionState};
