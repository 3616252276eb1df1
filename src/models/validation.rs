use thiserror::Error;

pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("channel must be one of sms, email, push (got '{0}')")]
    InvalidChannel(String),

    #[error("priority must be one of high, medium, low (got '{0}')")]
    InvalidPriority(String),

    #[error("unknown status '{0}'")]
    InvalidStatus(String),

    #[error("request must include between 1 to 1000 notifications (got {0})")]
    BatchSize(usize),

    #[error("data[{index}]: {source}")]
    InvalidItem {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },

    #[error("invalid device token: {0}")]
    InvalidDeviceToken(&'static str),
}

pub fn require(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(field));
    }

    Ok(trimmed.to_string())
}

pub fn validate_fcm_token(token: &str) -> Result<(), ValidationError> {
    if token.is_empty() {
        return Err(ValidationError::InvalidDeviceToken("token cannot be empty"));
    }

    if token.len() < 20 {
        return Err(ValidationError::InvalidDeviceToken(
            "token too short (minimum 20 characters)",
        ));
    }

    if token.len() > 200 {
        return Err(ValidationError::InvalidDeviceToken(
            "token too long (maximum 200 characters)",
        ));
    }

    let valid_chars = token
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.');

    if !valid_chars {
        return Err(ValidationError::InvalidDeviceToken(
            "token contains invalid characters",
        ));
    }

    Ok(())
}
