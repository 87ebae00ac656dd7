//! Bridge daemon HTTP probe
//!
//! The bridge exposes a local control port. A POST to `/enumerate` returns
//! a JSON array of attached devices; any answer at all means the bridge is
//! running.

use signet_core::{HardwareError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Default bridge control endpoint
pub const DEFAULT_BRIDGE_URL: &str = "http://localhost:21320";

/// Probe timeout for the enumerate call
pub const BRIDGE_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct BridgeClient {
    client: reqwest::Client,
    base_url: String,
}

impl BridgeClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HardwareError::BridgeUnreachable(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn enumerate_url(&self) -> String {
        format!("{}/enumerate", self.base_url)
    }

    /// Devices currently attached through the bridge
    pub async fn enumerate(&self) -> Result<Vec<serde_json::Value>> {
        let url = self.enumerate_url();
        let response = self.client.post(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                HardwareError::timed_out("bridge_enumerate", BRIDGE_PROBE_TIMEOUT)
            } else {
                HardwareError::BridgeUnreachable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(HardwareError::BridgeUnreachable(format!(
                "status {}",
                response.status()
            )));
        }

        let devices: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| HardwareError::Decode(format!("bridge enumerate: {}", e)))?;
        debug!(url = %url, count = devices.len(), "Bridge enumerate");
        Ok(devices)
    }

    /// At least one device is attached through a reachable bridge
    pub async fn has_devices(&self) -> bool {
        match self.enumerate().await {
            Ok(devices) => !devices.is_empty(),
            Err(e) => {
                warn!(error = %e, "Bridge probe failed");
                false
            }
        }
    }
}
