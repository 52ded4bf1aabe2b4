use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StashError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(stashpoint::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(stashpoint::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(stashpoint::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(stashpoint::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("{0}")]
    #[diagnostic(code(stashpoint::other))]
    Other(String),
}

/// Caller-visible failures of the device authorization handshake.
#[derive(Debug, Error, Diagnostic)]
pub enum DeviceFlowError {
    #[error("authentication required")]
    #[diagnostic(code(stashpoint::device::unauthenticated))]
    Unauthenticated,

    #[error("{0} is required")]
    #[diagnostic(code(stashpoint::device::missing_field))]
    MissingField(&'static str),

    #[error("invalid code")]
    #[diagnostic(code(stashpoint::device::invalid_code))]
    InvalidCode,

    #[error("code already approved")]
    #[diagnostic(code(stashpoint::device::already_approved))]
    AlreadyApproved,

    #[error("code expired")]
    #[diagnostic(code(stashpoint::device::expired))]
    Expired,

    #[error("device code creation failed: {0}")]
    #[diagnostic(code(stashpoint::device::creation_failed))]
    CreationFailed(#[source] StashError),

    #[error(transparent)]
    #[diagnostic(code(stashpoint::device::storage))]
    Storage(#[from] StashError),
}

impl DeviceFlowError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceFlowError::Unauthenticated => "unauthenticated",
            DeviceFlowError::MissingField(_) => "invalid_request",
            DeviceFlowError::InvalidCode => "invalid_code",
            DeviceFlowError::AlreadyApproved => "already_approved",
            DeviceFlowError::Expired => "expired",
            DeviceFlowError::CreationFailed(_) | DeviceFlowError::Storage(_) => "server_error",
        }
    }
}

impl From<sea_orm::DbErr> for DeviceFlowError {
    fn from(value: sea_orm::DbErr) -> Self {
        DeviceFlowError::Storage(StashError::Db(value))
    }
}
