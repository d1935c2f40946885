//! Per-device twin state
//!
//! The hub keeps two views of every device: the properties the device has
//! reported, and the desired writes operators have issued. Each desired
//! write gets a version from a per-device counter; acks are matched
//! against that version so a late ack for an older write can never
//! overwrite the state of a newer one.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use twinlink_shared::{AckCode, PropertyAck, PropertyWrite, ReportedEntry};

/// Lifecycle of one desired property write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    /// Issued but not yet acknowledged by the device
    Pending,
    /// Acknowledged with the given code
    Acked(AckCode),
}

/// One desired property value plus its delivery state
#[derive(Debug, Clone)]
pub struct DesiredProperty {
    pub component: String,
    pub name: String,
    pub value_json: String,
    pub version: u64,
    pub state: DesiredState,
}

#[derive(Debug, Clone, Default)]
struct DeviceTwin {
    reported: HashMap<(String, String), String>,
    desired: HashMap<(String, String), DesiredProperty>,
    /// Highest version handed out for this device's desired writes
    version: u64,
}

/// Twin state for every device the hub has seen
pub struct TwinStore {
    twins: RwLock<HashMap<String, DeviceTwin>>,
}

impl TwinStore {
    pub fn new() -> Self {
        Self {
            twins: RwLock::new(HashMap::new()),
        }
    }

    /// Record a desired write and return the version assigned to it
    pub async fn set_desired(
        &self,
        device_id: &str,
        component: &str,
        name: &str,
        value_json: &str,
    ) -> u64 {
        let mut twins = self.twins.write().await;
        let twin = twins.entry(device_id.to_string()).or_default();

        twin.version += 1;
        let version = twin.version;
        twin.desired.insert(
            (component.to_string(), name.to_string()),
            DesiredProperty {
                component: component.to_string(),
                name: name.to_string(),
                value_json: value_json.to_string(),
                version,
                state: DesiredState::Pending,
            },
        );
        version
    }

    /// Record a device ack for a desired write.
    ///
    /// Returns false when the ack did not apply: unknown device or
    /// property, or an ack for an older version than the one currently
    /// desired.
    pub async fn record_ack(&self, device_id: &str, ack: &PropertyAck) -> bool {
        let mut twins = self.twins.write().await;
        let Some(twin) = twins.get_mut(device_id) else {
            debug!(device = %device_id, "ack for unknown device");
            return false;
        };

        let key = (ack.component.clone(), ack.name.clone());
        let Some(desired) = twin.desired.get_mut(&key) else {
            debug!(device = %device_id, name = %ack.name, "ack for unknown desired property");
            return false;
        };

        if ack.version < desired.version {
            debug!(
                device = %device_id,
                name = %ack.name,
                acked = ack.version,
                current = desired.version,
                "stale ack ignored"
            );
            return false;
        }

        desired.state = DesiredState::Acked(AckCode::try_from(ack.code).unwrap_or(AckCode::AckUnknown));
        true
    }

    /// Merge a batch of reported values into the device's twin
    pub async fn update_reported(&self, device_id: &str, entries: &[ReportedEntry]) {
        let mut twins = self.twins.write().await;
        let twin = twins.entry(device_id.to_string()).or_default();
        for entry in entries {
            twin.reported.insert(
                (entry.component.clone(), entry.name.clone()),
                entry.value_json.clone(),
            );
        }
    }

    /// All reported values for a device, in a stable order
    pub async fn reported_snapshot(&self, device_id: &str) -> Vec<ReportedEntry> {
        let twins = self.twins.read().await;
        let Some(twin) = twins.get(device_id) else {
            return Vec::new();
        };

        let mut entries: Vec<ReportedEntry> = twin
            .reported
            .iter()
            .map(|((component, name), value_json)| ReportedEntry {
                component: component.clone(),
                name: name.clone(),
                value_json: value_json.clone(),
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.component.as_str(), a.name.as_str()).cmp(&(b.component.as_str(), b.name.as_str()))
        });
        entries
    }

    /// Desired writes not yet acknowledged, oldest version first
    pub async fn pending_writes(&self, device_id: &str) -> Vec<PropertyWrite> {
        let twins = self.twins.read().await;
        let Some(twin) = twins.get(device_id) else {
            return Vec::new();
        };

        let mut writes: Vec<PropertyWrite> = twin
            .desired
            .values()
            .filter(|desired| desired.state == DesiredState::Pending)
            .map(|desired| PropertyWrite {
                component: desired.component.clone(),
                name: desired.name.clone(),
                value_json: desired.value_json.clone(),
                version: desired.version,
            })
            .collect();
        writes.sort_by_key(|write| write.version);
        writes
    }

    /// Whether a desired value has ever been set for this property
    pub async fn has_desired(&self, device_id: &str, component: &str, name: &str) -> bool {
        let twins = self.twins.read().await;
        twins
            .get(device_id)
            .map(|twin| {
                twin.desired
                    .contains_key(&(component.to_string(), name.to_string()))
            })
            .unwrap_or(false)
    }
}

impl Default for TwinStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(component: &str, name: &str, version: u64, code: AckCode) -> PropertyAck {
        PropertyAck {
            component: component.to_string(),
            name: name.to_string(),
            value_json: "25.0".to_string(),
            version,
            code: code.into(),
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_desired_versions_increase_per_device() {
        let store = TwinStore::new();

        let v1 = store
            .set_desired("therm-001", "thermostat", "targetTemperature", "24.0")
            .await;
        let v2 = store
            .set_desired("therm-001", "thermostat", "ecoMode", "true")
            .await;
        assert_eq!((v1, v2), (1, 2));

        // A different device has its own counter
        let other = store
            .set_desired("therm-002", "thermostat", "targetTemperature", "20.0")
            .await;
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn test_stale_ack_ignored() {
        let store = TwinStore::new();

        store
            .set_desired("therm-001", "thermostat", "targetTemperature", "24.0")
            .await;
        let v2 = store
            .set_desired("therm-001", "thermostat", "targetTemperature", "26.0")
            .await;
        assert_eq!(v2, 2);

        // Ack for the overwritten version must not settle the newer write
        let stale = ack("thermostat", "targetTemperature", 1, AckCode::AckAccepted);
        assert!(!store.record_ack("therm-001", &stale).await);
        assert_eq!(store.pending_writes("therm-001").await.len(), 1);

        let current = ack("thermostat", "targetTemperature", 2, AckCode::AckAccepted);
        assert!(store.record_ack("therm-001", &current).await);
        assert!(store.pending_writes("therm-001").await.is_empty());
    }

    #[tokio::test]
    async fn test_ack_for_unknown_property_ignored() {
        let store = TwinStore::new();
        store
            .set_desired("therm-001", "thermostat", "targetTemperature", "24.0")
            .await;

        let unknown = ack("thermostat", "fanSpeed", 1, AckCode::AckRejected);
        assert!(!store.record_ack("therm-001", &unknown).await);
        assert!(!store.record_ack("therm-999", &unknown).await);
    }

    #[tokio::test]
    async fn test_pending_writes_ordered_by_version() {
        let store = TwinStore::new();

        store
            .set_desired("therm-001", "thermostat", "ecoMode", "true")
            .await;
        store
            .set_desired("therm-001", "thermostat", "targetTemperature", "24.0")
            .await;
        let acked = ack("thermostat", "ecoMode", 1, AckCode::AckAccepted);
        store.record_ack("therm-001", &acked).await;
        store
            .set_desired("therm-001", "deviceConfig", "logLevel", "\"debug\"")
            .await;

        let pending = store.pending_writes("therm-001").await;
        let versions: Vec<u64> = pending.iter().map(|w| w.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(pending[0].name, "targetTemperature");
        assert_eq!(pending[1].name, "logLevel");
    }

    #[tokio::test]
    async fn test_reported_snapshot_is_stable() {
        let store = TwinStore::new();

        let entries = vec![
            ReportedEntry {
                component: "thermostat".to_string(),
                name: "targetTemperature".to_string(),
                value_json: "22.0".to_string(),
            },
            ReportedEntry {
                component: "deviceConfig".to_string(),
                name: "serialNumber".to_string(),
                value_json: "\"JAMESD1234\"".to_string(),
            },
        ];
        store.update_reported("therm-001", &entries).await;

        // Later update overwrites the earlier value
        let update = vec![ReportedEntry {
            component: "thermostat".to_string(),
            name: "targetTemperature".to_string(),
            value_json: "25.0".to_string(),
        }];
        store.update_reported("therm-001", &update).await;

        let snapshot = store.reported_snapshot("therm-001").await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].component, "deviceConfig");
        assert_eq!(snapshot[1].value_json, "25.0");

        assert!(store.reported_snapshot("therm-999").await.is_empty());
    }
}
