//! Session management for tracking connected devices
//!
//! This module handles:
//! - Tracking all connected device sessions
//! - Bidirectional message routing
//! - Liveness monitoring and dead session removal
//! - Command delivery to specific devices

mod connection;
mod manager;

pub use connection::{DeviceSession, SessionHandle, SessionSink, HUB_ID};
pub use manager::SessionManager;
