//! Firmware installer for the simulated device

use anyhow::{bail, Result};
use tokio::sync::Mutex;
use tracing::info;

/// Tracks the installed firmware version and applies updates
pub struct FirmwareInstaller {
    installed: Mutex<String>,
}

impl FirmwareInstaller {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            installed: Mutex::new(version.into()),
        }
    }

    /// Currently installed firmware version
    pub async fn installed_version(&self) -> String {
        self.installed.lock().await.clone()
    }

    /// Install a firmware image and record its version
    pub async fn install(&self, version: &str, image: &[u8]) -> Result<()> {
        if version.is_empty() {
            bail!("firmware version missing");
        }
        if image.is_empty() {
            bail!("firmware image is empty");
        }

        let mut installed = self.installed.lock().await;
        info!(
            from = %installed,
            to = version,
            bytes = image.len(),
            "installing firmware"
        );
        *installed = version.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_updates_version() {
        let installer = FirmwareInstaller::new("2.0.0");
        installer.install("2.1.0", b"image").await.unwrap();
        assert_eq!(installer.installed_version().await, "2.1.0");
    }

    #[tokio::test]
    async fn test_empty_image_refused() {
        let installer = FirmwareInstaller::new("2.0.0");
        assert!(installer.install("2.1.0", b"").await.is_err());
        assert_eq!(installer.installed_version().await, "2.0.0");
    }

    #[tokio::test]
    async fn test_missing_version_refused() {
        let installer = FirmwareInstaller::new("2.0.0");
        assert!(installer.install("", b"image").await.is_err());
    }
}
