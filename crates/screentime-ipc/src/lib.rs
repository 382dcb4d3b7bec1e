//! Unix-socket transport between screentimed and its helper processes.
//!
//! Every message is one JSON object per line. The monitor extension reports
//! usage as a reporter, display processes subscribe to events as observers,
//! and roles come from the connecting peer's UID.

mod client;
mod server;

pub use client::{EventStream, IpcClient};
pub use server::{IpcServer, ServerMessage, role_for_uid};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON line: {0}")]
    Json(#[from] serde_json::Error),

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("unexpected message: {0}")]
    InvalidMessage(String),

    #[error("screentimed error: {0}")]
    ServerError(String),
}

pub type IpcResult<T> = Result<T, IpcError>;
