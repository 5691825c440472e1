pub mod registry;
pub mod relay;
pub mod routing;
pub mod server;
