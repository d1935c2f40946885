//! Twin state tracking and firmware catalog
//!
//! This module handles:
//! - Reported and desired property state per device
//! - Versioning and ack matching for desired writes
//! - Firmware update decisions for device-initiated checks

mod firmware;
mod store;

pub use firmware::FirmwareCatalog;
pub use store::{DesiredProperty, DesiredState, TwinStore};
