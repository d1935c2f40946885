//! Firmware catalog and update decisions

use tracing::warn;
use twinlink_shared::schema::{FirmwareUpdateRequest, FirmwareUpdateResponse};

/// The firmware image the hub can offer to devices
pub struct FirmwareCatalog {
    latest_version: String,
    image: Vec<u8>,
}

impl FirmwareCatalog {
    pub fn new(latest_version: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            latest_version: latest_version.into(),
            image,
        }
    }

    pub fn latest_version(&self) -> &str {
        &self.latest_version
    }

    /// Decide whether a device should update.
    ///
    /// A version that does not parse on either side produces a no-update
    /// decision rather than an error; the device keeps running what it
    /// has.
    pub fn evaluate(&self, request: &FirmwareUpdateRequest) -> FirmwareUpdateResponse {
        let current = match parse_version(&request.current_version) {
            Some(parts) => parts,
            None => {
                warn!(
                    version = %request.current_version,
                    "device reported unparseable firmware version"
                );
                return self.no_update(&request.current_version);
            }
        };
        let latest = match parse_version(&self.latest_version) {
            Some(parts) => parts,
            None => {
                warn!(version = %self.latest_version, "catalog version is unparseable");
                return self.no_update(&request.current_version);
            }
        };

        if current < latest {
            FirmwareUpdateResponse {
                should_update: true,
                version: self.latest_version.clone(),
                image: self.image.clone(),
            }
        } else {
            self.no_update(&request.current_version)
        }
    }

    fn no_update(&self, current_version: &str) -> FirmwareUpdateResponse {
        FirmwareUpdateResponse {
            should_update: false,
            version: current_version.to_string(),
            image: Vec::new(),
        }
    }
}

/// Parse a dotted numeric version like "2.1.0".
/// Segments compare numerically, so "2.10.0" is newer than "2.9.0".
fn parse_version(version: &str) -> Option<Vec<u64>> {
    version
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect()
}
