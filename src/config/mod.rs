pub mod endpoint;
pub mod tree;
