//! CLI device authorization handshake.
//!
//! A command-line client calls [`DeviceFlow::initiate`] to obtain a secret
//! device code and a short user code. The user opens the verification URL in
//! a signed-in browser and approves the user code, which mints an API key
//! bound to that user. Meanwhile the CLI calls [`DeviceFlow::poll`] with its
//! device code until the handshake is approved or expired.
//!
//! ```text
//! PENDING --approve--> APPROVED
//!    |
//!    +--expires_at passed--> EXPIRED (derived at read time)
//! ```
use crate::clock::Clock;
use crate::errors::{DeviceFlowError, StashError};
use crate::settings::Settings;
use crate::storage::{self, ApiKey, DeviceCode, DeviceCodeStatus};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Issued to the CLI when a handshake starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub expires_at: DateTime<Utc>,
    pub verify_url: String,
    /// Recommended seconds between polls
    pub interval: u64,
}

/// Effective state of a handshake as seen by a polling client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PollStatus {
    Pending,
    Approved {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    Expired,
}

impl PollStatus {
    /// Expiry wins over approval; an approved record without a key reads as pending.
    pub fn from_record(record: &DeviceCode, now: i64) -> Self {
        if record.is_expired(now) {
            return PollStatus::Expired;
        }
        match (&record.status, &record.api_key) {
            (DeviceCodeStatus::Approved, Some(api_key)) => PollStatus::Approved {
                api_key: api_key.clone(),
            },
            _ => PollStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollStatus::Pending)
    }
}

/// Request metadata of the initiating CLI, shown to the approving user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Canonical `XXXX-XXXX` form of a typed user code.
///
/// Whitespace is dropped and letters are uppercased; a hyphen is inserted
/// when exactly eight characters were typed without one.
pub fn normalize_user_code(input: &str) -> Option<String> {
    let compact: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();

    if compact.is_empty() {
        return None;
    }

    if compact.len() == 8 && compact.is_ascii() && !compact.contains('-') {
        return Some(format!("{}-{}", &compact[..4], &compact[4..]));
    }

    Some(compact)
}

#[derive(Clone)]
pub struct DeviceFlow {
    db: DatabaseConnection,
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
}

impl DeviceFlow {
    pub fn new(db: DatabaseConnection, settings: Arc<Settings>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            settings,
            clock,
        }
    }

    pub fn poll_interval(&self) -> u64 {
        self.settings.device_flow.poll_interval_secs
    }

    /// Start a handshake. Requires no authentication; the CLI holds no credential yet.
    pub async fn initiate(
        &self,
        client_info: Option<ClientInfo>,
    ) -> Result<DeviceAuthorization, DeviceFlowError> {
        let now = self.clock.now_millis();
        let ttl_secs = self.settings.device_flow.code_ttl_secs;
        let expires_at = ttl_secs
            .checked_mul(1000)
            .and_then(|ttl_ms| now.checked_add(ttl_ms))
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| {
                DeviceFlowError::CreationFailed(StashError::Other(format!(
                    "code ttl out of range: {}s",
                    ttl_secs
                )))
            })?;

        let client_info = client_info
            .map(|info| serde_json::to_string(&info))
            .transpose()
            .map_err(|e| DeviceFlowError::CreationFailed(e.into()))?;

        let record = storage::create_device_code(
            &self.db,
            client_info,
            now,
            expires_at.timestamp_millis(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "failed to create device code");
            DeviceFlowError::CreationFailed(e)
        })?;

        info!(user_code = %record.user_code, %expires_at, "device authorization started");

        Ok(DeviceAuthorization {
            verify_url: format!(
                "{}/device?user_code={}",
                self.settings.public_url(),
                urlencoding::encode(&record.user_code)
            ),
            device_code: record.device_code,
            user_code: record.user_code,
            expires_at,
            interval: self.poll_interval(),
        })
    }

    /// Approve a user code on behalf of an authenticated user and mint its API key.
    ///
    /// Succeeds at most once per handshake. Later attempts fail with
    /// `AlreadyApproved`, and attempts past expiry fail with `Expired`.
    pub async fn approve(
        &self,
        user_code: &str,
        subject: &str,
    ) -> Result<ApiKey, DeviceFlowError> {
        let user_code =
            normalize_user_code(user_code).ok_or(DeviceFlowError::MissingField("userCode"))?;
        let now = self.clock.now_millis();

        if let Some(minted) =
            storage::approve_device_code(&self.db, &user_code, subject, now).await?
        {
            info!(
                %user_code,
                key_id = %minted.key.key_id,
                %subject,
                "device authorization approved"
            );
            return Ok(minted.key);
        }

        // Nothing was written; work out why from the current row.
        let rejection = match storage::get_device_code_by_user_code(&self.db, &user_code).await? {
            None => DeviceFlowError::InvalidCode,
            Some(record) if record.status == DeviceCodeStatus::Approved => {
                DeviceFlowError::AlreadyApproved
            }
            Some(record) if record.is_expired(now) => DeviceFlowError::Expired,
            Some(_) => {
                return Err(StashError::Other(format!(
                    "approval of {} did not apply to a pending code",
                    user_code
                ))
                .into())
            }
        };

        warn!(%user_code, %subject, reason = rejection.code(), "device authorization rejected");
        Err(rejection)
    }

    /// Read the effective state of a handshake. Never writes.
    pub async fn poll(&self, device_code: &str) -> Result<PollStatus, DeviceFlowError> {
        let device_code = device_code.trim();
        if device_code.is_empty() {
            return Err(DeviceFlowError::MissingField("deviceCode"));
        }

        let record = storage::get_device_code(&self.db, device_code)
            .await?
            .ok_or(DeviceFlowError::InvalidCode)?;

        Ok(PollStatus::from_record(&record, self.clock.now_millis()))
    }

    /// Look up a handshake by user code for display on the verification page.
    pub async fn pending_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<DeviceCode, DeviceFlowError> {
        let user_code =
            normalize_user_code(user_code).ok_or(DeviceFlowError::MissingField("userCode"))?;
        let record = storage::get_device_code_by_user_code(&self.db, &user_code)
            .await?
            .ok_or(DeviceFlowError::InvalidCode)?;

        if record.status == DeviceCodeStatus::Approved {
            return Err(DeviceFlowError::AlreadyApproved);
        }
        if record.is_expired(self.clock.now_millis()) {
            return Err(DeviceFlowError::Expired);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: DeviceCodeStatus, api_key: Option<&str>, expires_at: i64) -> DeviceCode {
        DeviceCode {
            device_code: "dc".to_string(),
            user_code: "BCDF-GHJK".to_string(),
            status,
            api_key: api_key.map(String::from),
            approved_by: None,
            client_info: None,
            created_at: 0,
            expires_at,
            approved_at: None,
        }
    }

    #[test]
    fn test_normalize_user_code() {
        assert_eq!(normalize_user_code("bcdf-ghjk").as_deref(), Some("BCDF-GHJK"));
        assert_eq!(normalize_user_code("  BCDFGHJK ").as_deref(), Some("BCDF-GHJK"));
        assert_eq!(normalize_user_code("bcdf ghjk").as_deref(), Some("BCDF-GHJK"));
        // Unusual shapes pass through for the lookup to reject
        assert_eq!(normalize_user_code("abc").as_deref(), Some("ABC"));
        assert_eq!(normalize_user_code(""), None);
        assert_eq!(normalize_user_code("   "), None);
    }

    #[test]
    fn test_poll_status_pending() {
        let r = record(DeviceCodeStatus::Pending, None, 1_000);
        assert_eq!(PollStatus::from_record(&r, 999), PollStatus::Pending);
    }

    #[test]
    fn test_poll_status_approved() {
        let r = record(DeviceCodeStatus::Approved, Some("stp_key"), 1_000);
        assert_eq!(
            PollStatus::from_record(&r, 500),
            PollStatus::Approved {
                api_key: "stp_key".to_string()
            }
        );
    }

    #[test]
    fn test_poll_status_expiry_takes_precedence() {
        let r = record(DeviceCodeStatus::Approved, Some("stp_key"), 1_000);
        assert_eq!(PollStatus::from_record(&r, 1_000), PollStatus::Expired);
        assert_eq!(PollStatus::from_record(&r, 1_001), PollStatus::Expired);

        let r = record(DeviceCodeStatus::Pending, None, 1_000);
        assert_eq!(PollStatus::from_record(&r, 1_001), PollStatus::Expired);
    }

    #[test]
    fn test_poll_status_approved_without_key_reads_pending() {
        let r = record(DeviceCodeStatus::Approved, None, 1_000);
        assert_eq!(PollStatus::from_record(&r, 0), PollStatus::Pending);
    }

    #[test]
    fn test_poll_status_wire_format() {
        let pending = serde_json::to_value(PollStatus::Pending).unwrap();
        assert_eq!(pending, serde_json::json!({"status": "pending"}));

        let approved = serde_json::to_value(PollStatus::Approved {
            api_key: "stp_key".to_string(),
        })
        .unwrap();
        assert_eq!(
            approved,
            serde_json::json!({"status": "approved", "apiKey": "stp_key"})
        );

        let expired = serde_json::to_value(PollStatus::Expired).unwrap();
        assert_eq!(expired, serde_json::json!({"status": "expired"}));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!PollStatus::Pending.is_terminal());
        assert!(PollStatus::Expired.is_terminal());
        assert!(PollStatus::Approved {
            api_key: String::new()
        }
        .is_terminal());
    }
}
