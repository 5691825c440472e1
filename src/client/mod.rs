pub mod callback;
pub mod client;
