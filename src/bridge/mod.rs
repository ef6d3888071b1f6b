//! Bridge module for communicating with the wa-bridge subprocess.

pub mod client;
pub mod process;
pub mod protocol;

pub use client::{BridgeClient, OutgoingMedia, SendReceipt};
pub use process::{default_data_dir, find_bridge_binary, BridgeConfig, BridgeProcess, SESSION_DB};
pub use protocol::{BridgeEvent, ConnectionState, EventKind};
