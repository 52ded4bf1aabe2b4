//! Command-line side of the device authorization flow.

use crate::device_flow::{DeviceAuthorization, PollStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DeviceLoginError {
    /// The handshake expired before it was approved.
    #[error("Device code expired; start the login again")]
    Expired,

    /// The server does not know this device code.
    #[error("Device code not recognized by the server")]
    UnknownCode,

    #[error("Timeout waiting for approval")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to store credentials: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode credentials: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Client for the device authorization endpoints of a stashpoint server.
pub struct DeviceLoginClient {
    http_client: reqwest::Client,
    device_endpoint: String,
    token_endpoint: String,
}

impl DeviceLoginClient {
    pub fn new(server_url: &str) -> Result<Self, DeviceLoginError> {
        let base = server_url.trim_end_matches('/');

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("stashpoint-cli/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeviceLoginError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            device_endpoint: format!("{}/device", base),
            token_endpoint: format!("{}/token", base),
        })
    }

    /// Start a handshake. The returned user code and verify URL are shown to the user.
    pub async fn start(&self) -> Result<DeviceAuthorization, DeviceLoginError> {
        let response = self
            .http_client
            .post(&self.device_endpoint)
            .send()
            .await
            .map_err(|e| DeviceLoginError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DeviceLoginError::InvalidResponse(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        response
            .json::<DeviceAuthorization>()
            .await
            .map_err(|e| DeviceLoginError::InvalidResponse(e.to_string()))
    }

    /// Make a single poll request.
    pub async fn poll_once(&self, device_code: &str) -> Result<PollStatus, DeviceLoginError> {
        let response = self
            .http_client
            .post(&self.token_endpoint)
            .json(&serde_json::json!({ "deviceCode": device_code }))
            .send()
            .await
            .map_err(|e| DeviceLoginError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DeviceLoginError::UnknownCode);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DeviceLoginError::InvalidResponse(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        response
            .json::<PollStatus>()
            .await
            .map_err(|e| DeviceLoginError::InvalidResponse(e.to_string()))
    }

    /// Poll every `authorization.interval` seconds until the handshake resolves.
    ///
    /// Returns the API key once approved. Transient network failures are
    /// retried on the next tick.
    pub async fn wait_for_approval(
        &self,
        authorization: &DeviceAuthorization,
        timeout: Duration,
    ) -> Result<String, DeviceLoginError> {
        let start = Instant::now();
        let interval = Duration::from_secs(authorization.interval.max(1));

        loop {
            if start.elapsed() >= timeout {
                return Err(DeviceLoginError::Timeout);
            }

            tokio::time::sleep(interval).await;

            match self.poll_once(&authorization.device_code).await {
                Ok(PollStatus::Approved { api_key }) => return Ok(api_key),
                Ok(PollStatus::Expired) => return Err(DeviceLoginError::Expired),
                Ok(PollStatus::Pending) => debug!("authorization pending"),
                Err(DeviceLoginError::Network(e)) => warn!(error = %e, "poll failed, retrying"),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Credentials written by `stashpoint login`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub server: String,
    pub api_key: String,
}

impl Credentials {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stashpoint").join("credentials.json"))
    }

    pub fn load(path: &Path) -> Result<Self, DeviceLoginError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write the credentials file, readable only by the owner on unix.
    pub fn save(&self, path: &Path) -> Result<(), DeviceLoginError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}
