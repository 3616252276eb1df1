use serde::Serialize;
use uuid::Uuid;

use crate::models::notification::Notification;

pub const ACCEPTED: &str = "Accepted";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub message_id: Uuid,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationListResponse {
    pub total: i64,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_detail: String,
}

impl AcceptedResponse {
    pub fn new(message_id: Uuid, created_at: String) -> Self {
        Self {
            message_id,
            status: ACCEPTED.to_string(),
            created_at,
        }
    }
}
