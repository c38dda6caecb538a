pub mod config;
pub mod connection;
pub mod frame;
pub mod presence;
pub mod transport;
