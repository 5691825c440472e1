pub mod challenge;
pub mod client;
pub mod payload;
pub mod server;
