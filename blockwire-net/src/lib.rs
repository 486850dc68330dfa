//! Client and server connections speaking the block protocol, on top of the world 
//! engine.

pub mod config;
pub mod proto;
pub mod transport;
pub mod endpoint;
pub mod dispatch;
pub mod connection;
pub mod client;
pub mod server;
