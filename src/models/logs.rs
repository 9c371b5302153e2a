//! Delivery log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DeliveryOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown outcome: {}", s)),
        }
    }
}

/// How much of the delivery history gets written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// 0: nothing.
    None = 0,
    /// 1: failures only.
    Failures = 1,
    /// 2: every attempt.
    All = 2,
}

impl LogLevel {
    pub fn records(self, outcome: DeliveryOutcome) -> bool {
        match self {
            Self::None => false,
            Self::Failures => outcome == DeliveryOutcome::Failed,
            Self::All => true,
        }
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = ConfigError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Failures),
            2 => Ok(Self::All),
            other => Err(ConfigError::InvalidValue {
                key: "log_level".into(),
                message: format!("{other} is not one of 0, 1, 2"),
            }),
        }
    }
}

/// One recorded delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: Uuid,
    pub email_id: Uuid,
    pub date: DateTime<Utc>,
    pub status: DeliveryOutcome,
    /// Error variant label, empty on success.
    #[serde(default)]
    pub exception_type: String,
    #[serde(default)]
    pub message: String,
}

impl DeliveryLogEntry {
    pub fn sent(email_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            email_id,
            date: super::now(),
            status: DeliveryOutcome::Sent,
            exception_type: String::new(),
            message: String::new(),
        }
    }

    pub fn failed(email_id: Uuid, exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email_id,
            date: super::now(),
            status: DeliveryOutcome::Failed,
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }
}
