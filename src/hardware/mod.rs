//! Simulated device hardware

mod firmware;
mod thermostat;

pub use firmware::FirmwareInstaller;
pub use thermostat::Thermostat;
