pub mod envelope;
pub mod message;
pub mod message_bus;
