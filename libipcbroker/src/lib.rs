use std::path::PathBuf;

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
mod error;
pub mod message;
pub mod periodic;

pub use broker::Broker;
pub use client::{Client, Function};
pub use config::Config;
pub use connection::{ConnId, Connection, Reader, Writer};
pub use error::{CallError, Error};
pub use message::{Action, Args, CorrelationId, Flag, Message, Payload};
pub use periodic::{Periodic, Work};

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable overriding [broker_socket]
pub const SOCKET_ENV: &str = "IPCBROKER_SOCKET";

/// The path to broker socket
pub fn broker_socket() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(SOCKET_ENV) {
        return Some(PathBuf::from(path));
    }
    let home = dirs::runtime_dir().or_else(dirs::home_dir)?;
    Some(home.as_path().join("ipcbroker.socket"))
}
