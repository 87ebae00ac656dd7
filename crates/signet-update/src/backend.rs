//! Release verification backend
//!
//! After a release check, the backend is asked for the download and
//! release-page metadata of each target version. Components without an
//! upgrade are sent as `0.0.0`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use signet_core::{DeviceType, FirmwareComponent, FirmwareType, HardwareError, ReleaseUrls, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Version sent for components that are not being updated
pub const UNCHANGED_VERSION: &str = "0.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub device_type: DeviceType,
    pub firmware_version: String,
    pub ble_version: String,
    pub bootloader_version: String,
    pub firmware_type: FirmwareType,
}

/// One entry of the backend response
#[derive(Debug, Clone, Deserialize)]
pub struct ServerVerifyInfo {
    /// `firmware`, `bluetooth` or `bootloader`
    pub component: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub release_url: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Release metadata per device component
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifiedVersionInfos {
    pub firmware: Option<ReleaseUrls>,
    pub ble: Option<ReleaseUrls>,
    pub bootloader: Option<ReleaseUrls>,
}

impl VerifiedVersionInfos {
    pub fn from_server(infos: Vec<ServerVerifyInfo>) -> Self {
        let mut result = Self::default();
        for info in infos {
            let urls = ReleaseUrls {
                download_url: info.download_url,
                github_release_url: info.release_url,
                fingerprint: info.fingerprint,
            };
            match info.component.as_str() {
                "firmware" => result.firmware = Some(urls),
                "bluetooth" | "ble" => result.ble = Some(urls),
                "bootloader" => result.bootloader = Some(urls),
                other => debug!(component = %other, "Ignoring unknown verify component"),
            }
        }
        result
    }

    pub fn get(&self, component: FirmwareComponent) -> Option<&ReleaseUrls> {
        match component {
            FirmwareComponent::Firmware => self.firmware.as_ref(),
            FirmwareComponent::Ble => self.ble.as_ref(),
            FirmwareComponent::Bootloader => self.bootloader.as_ref(),
            FirmwareComponent::Bridge => None,
        }
    }
}

#[async_trait]
pub trait ReleaseBackend: Send + Sync {
    async fn fetch_verified_version_info(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifiedVersionInfos>;
}

/// Backend reached over HTTP
pub struct HttpReleaseBackend {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpReleaseBackend {
    /// `url` of `None` disables verification
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HardwareError::Backend(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ReleaseBackend for HttpReleaseBackend {
    async fn fetch_verified_version_info(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifiedVersionInfos> {
        let Some(url) = &self.url else {
            debug!("No release backend configured, skipping verification");
            return Ok(VerifiedVersionInfos::default());
        };

        debug!(url = %url, device_type = %request.device_type, "Fetching verified versions");
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| HardwareError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            warn!(url = %url, status = %response.status(), "Release verification failed");
            return Err(HardwareError::Backend(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let infos: Vec<ServerVerifyInfo> = response
            .json()
            .await
            .map_err(|e| HardwareError::Decode(e.to_string()))?;
        Ok(VerifiedVersionInfos::from_server(infos))
    }
}
