//! Interception hub configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the [`crate::hub::InterceptionHub`] correlator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// How long an allowed request may hold the gate waiting for its
    /// response before new requests are let through anyway (seconds).
    pub gate_timeout_secs: f64,
}

impl HubConfig {
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.gate_timeout_secs.max(0.0))
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            gate_timeout_secs: 4.0,
        }
    }
}
