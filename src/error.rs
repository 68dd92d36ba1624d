use thiserror::Error;

use crate::rate_limiter::LimitReason;
use crate::validator::ValidationError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a push attempt that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    // Retrying cannot help, e.g. the token is unregistered
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Why a candidate was dropped at admission. Never surfaced to producers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("invalid candidate: {0}")]
    Invalid(#[from] ValidationError),
    #[error("recipient disabled this kind")]
    Disabled,
    #[error("rate limited: {0}")]
    RateLimited(LimitReason),
    #[error("duplicate of a recent notification")]
    Duplicate,
    #[error("recipient preferences unavailable")]
    PreferencesUnavailable,
    #[error("pipeline state could not be persisted")]
    Persistence,
    #[error("pipeline is closed")]
    Closed,
}

impl Rejection {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::Disabled => "disabled",
            Self::RateLimited(reason) => reason.as_str(),
            Self::Duplicate => "duplicate",
            Self::PreferencesUnavailable => "preferences-unavailable",
            Self::Persistence => "persistence",
            Self::Closed => "closed",
        }
    }
}
