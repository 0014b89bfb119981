#![recursion_limit = "384"]

pub mod api;
pub mod attr;
pub mod channel;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod instance;
pub mod lifecycle;
pub mod mcast;
pub mod route;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod table;
pub mod utils;

pub use config::ServerConfig;
pub use server::{serve, Server};
