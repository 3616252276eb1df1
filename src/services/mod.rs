pub mod notification;
pub mod outbox;
