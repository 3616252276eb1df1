use std::{
    fmt::{Display, Formatter, Result},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::models::validation::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sended,
    Failed,
}

/// Lifecycle of an outbox row. `Delivering` marks a row a worker has
/// claimed and not yet settled; `Sended` is the terminal success state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    Delivering,
    Sended,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sended => "sended",
            NotificationStatus::Failed => "failed",
        }
    }
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Delivering => "delivering",
            OutboxStatus::Sended => "sended",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl Display for OutboxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(NotificationStatus::Pending),
            "processing" => Ok(NotificationStatus::Processing),
            "sended" => Ok(NotificationStatus::Sended),
            "failed" => Ok(NotificationStatus::Failed),
            _ => Err(ValidationError::InvalidStatus(s.to_string())),
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "delivering" => Ok(OutboxStatus::Delivering),
            "sended" => Ok(OutboxStatus::Sended),
            "failed" => Ok(OutboxStatus::Failed),
            _ => Err(ValidationError::InvalidStatus(s.to_string())),
        }
    }
}
