//! Agent Runtime: task execution engine and connection state manager.

pub mod config;
pub mod connection;
pub mod error;
pub mod listeners;
pub mod task;
