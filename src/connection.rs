//! Per-participant connection handle.
//!
//! Each accepted WebSocket is split into a receive loop (owned by
//! `server.rs`) and a send-side mailbox that any other component may hold a
//! clone of. This generalizes the SDK client's single-stream wrapper
//! (`send`/`send_json`/`receive`) to the Hub's fan-out case: many
//! participants, one Hub, broadcasts going to an arbitrary subset.

use axum::extract::ws::{CloseFrame, Message};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// A stable identifier for one WebSocket connection, assigned at accept time.
pub type ConnId = u64;

/// Send-only handle to a participant's socket. Cheap to clone; the
/// underlying mpsc channel is the only shared state.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn_id: ConnId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn new(conn_id: ConnId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Serialize and enqueue a message for delivery. Returns an error if the
    /// connection's send task has already exited (disconnect race).
    pub fn send_json<T: Serialize>(&self, message: &T) -> Result<()> {
        let text = serde_json::to_string(message)?;
        debug!(conn_id = self.conn_id, "send: {}", text);
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::ConnectionClosed(format!("conn {} gone", self.conn_id)))
    }

    /// Close the underlying socket with a WebSocket close code (e.g. 4001
    /// for a rejected registration token).
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        self.tx
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into().into(),
            })))
            .map_err(|_| Error::ConnectionClosed(format!("conn {} gone", self.conn_id)))
    }
}
