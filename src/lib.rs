pub mod channel;
pub mod client;
pub mod config;
pub mod local;
pub mod messaging;
pub mod registration;
pub mod rpc;
pub mod server;
pub mod test_util;
pub mod transport;
pub mod util;
