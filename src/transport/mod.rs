pub mod cache;
pub mod codec;
pub mod compression;
pub mod config;
pub mod controller;
pub mod encryption;
pub mod statistics;
