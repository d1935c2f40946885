//! Simulated thermostat hardware
//!
//! Holds the target setpoint and an ambient temperature that closes part
//! of the gap to the target on every sample, standing in for a real
//! control loop.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use twinlink_engine::SetpointSink;

/// Fraction of the target/ambient gap closed per sample
const DRIFT_RATE: f64 = 0.2;

struct ThermostatState {
    target: f64,
    ambient: f64,
}

/// Simulated thermostat: one setpoint, one temperature sensor
pub struct Thermostat {
    state: Mutex<ThermostatState>,
}

impl Thermostat {
    pub fn new(initial_target: f64, initial_ambient: f64) -> Self {
        Self {
            state: Mutex::new(ThermostatState {
                target: initial_target,
                ambient: initial_ambient,
            }),
        }
    }

    /// Sample the ambient temperature, advancing the simulation one step
    pub async fn sample(&self) -> f64 {
        let mut state = self.state.lock().await;
        let gap = state.target - state.ambient;
        state.ambient += gap * DRIFT_RATE;
        state.ambient
    }

    pub async fn target(&self) -> f64 {
        self.state.lock().await.target
    }
}

#[async_trait]
impl SetpointSink for Thermostat {
    async fn apply(&self, value: f64) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.target = value;
        info!(setpoint = value, "thermostat setpoint applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ambient_drifts_toward_target() {
        let thermostat = Thermostat::new(22.0, 18.0);

        let first = thermostat.sample().await;
        let second = thermostat.sample().await;

        assert!(first > 18.0 && first < 22.0);
        assert!(second > first, "ambient keeps approaching the target");
    }

    #[tokio::test]
    async fn test_applied_setpoint_steers_ambient() {
        let thermostat = Thermostat::new(22.0, 22.0);

        thermostat.apply(25.0).await.unwrap();
        assert_eq!(thermostat.target().await, 25.0);

        let sample = thermostat.sample().await;
        assert!(sample > 22.0, "ambient moves toward the new setpoint");
    }
}
