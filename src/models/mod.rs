pub mod fcm;
pub mod forms;
pub mod health;
pub mod message;
pub mod notification;
pub mod outbox;
pub mod response;
pub mod retry;
pub mod status;
pub mod validation;
