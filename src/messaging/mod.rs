pub mod address;
pub mod client;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod handler;
pub mod server;
