use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    models::{
        notification::{Channel, NewNotification, Priority},
        status::NotificationStatus,
        validation::{MAX_BATCH_SIZE, ValidationError, require},
    },
    repository::ListFilter,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateNotificationForm {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default, rename = "scheduledAt", alias = "scheduled_at")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateNotificationBatchForm {
    #[serde(default)]
    pub data: Vec<CreateNotificationForm>,
}

/// Query string of the list endpoint. Everything arrives as text so that
/// malformed pages and dates degrade to defaults instead of rejecting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListForm {
    pub page: Option<String>,
    pub status: Option<String>,
    pub channel: Option<String>,
    pub startdate: Option<String>,
    pub enddate: Option<String>,
}

impl CreateNotificationForm {
    pub fn validate(self) -> Result<NewNotification, ValidationError> {
        let recipient = require("recipient", &self.recipient)?;
        let content = require("content", &self.content)?;

        if self.channel.trim().is_empty() {
            return Err(ValidationError::MissingField("channel"));
        }
        if self.priority.trim().is_empty() {
            return Err(ValidationError::MissingField("priority"));
        }

        Ok(NewNotification {
            recipient,
            channel: self.channel.parse::<Channel>()?,
            content,
            priority: self.priority.parse::<Priority>()?,
            scheduled_at: self.scheduled_at,
        })
    }
}

impl CreateNotificationBatchForm {
    pub fn validate(self) -> Result<Vec<NewNotification>, ValidationError> {
        if self.data.is_empty() || self.data.len() > MAX_BATCH_SIZE {
            return Err(ValidationError::BatchSize(self.data.len()));
        }

        self.data
            .into_iter()
            .enumerate()
            .map(|(index, form)| {
                form.validate()
                    .map_err(|source| ValidationError::InvalidItem {
                        index,
                        source: Box::new(source),
                    })
            })
            .collect()
    }
}

impl ListForm {
    pub fn page(&self) -> u32 {
        self.page
            .as_deref()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| *p > 0)
            .unwrap_or(1)
    }

    pub fn filter(&self) -> Result<ListFilter, ValidationError> {
        let status = match non_blank(&self.status) {
            Some(s) => Some(s.parse::<NotificationStatus>()?),
            None => None,
        };
        let channel = match non_blank(&self.channel) {
            Some(c) => Some(c.parse::<Channel>()?),
            None => None,
        };

        Ok(ListFilter {
            status,
            channel,
            start_date: non_blank(&self.startdate).and_then(parse_rfc3339),
            end_date: non_blank(&self.enddate).and_then(parse_rfc3339),
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
