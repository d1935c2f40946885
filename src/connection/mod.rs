//! Connection management for the persistent hub link
//!
//! This module handles:
//! - A persistent TCP connection with automatic reconnection
//! - Exponential backoff between connection attempts
//! - Bidirectional envelope streaming

mod manager;

pub use manager::{ConnectionConfig, ConnectionEvent, ConnectionManager};
