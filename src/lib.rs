//! VIGIL - File Integrity Monitoring agent
//!
//! Tracks a configured set of filesystem paths and raises change events
//! when content, metadata, or existence changes. Three detection paths
//! feed one shared entry index: a scheduled tree scan, real-time
//! filesystem notifications, and kernel-audit-backed whodata records.
//!
//! This library provides the monitoring engine. The binary in main.rs
//! uses this library to run the agent.

pub mod agent;
pub mod config;
pub mod events;
pub mod hasher;
pub mod index;
pub mod metrics;
pub mod policy;
pub mod realtime;
pub mod scanner;
pub mod transport;
pub mod whodata;

// Re-export commonly used types
pub use config::*;
pub use events::*;
