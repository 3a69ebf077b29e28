// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound half of a message transport (player socket or worker channel).
//!
//! The socket task owns the real WebSocket sink and drains an [`Outbound`]
//! queue; everything else holds a [`Transport`] handle whose `send` never
//! blocks. Inbound frames are pushed into the owning component by the socket
//! task itself.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint is going away (instance or worker shut down).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Rejected by policy.
pub const CLOSE_POLICY: u16 = 1008;
/// Temporary failure; the client may retry.
pub const CLOSE_TRY_AGAIN: u16 = 1013;
/// A newer transport took over this one's role.
pub const CLOSE_REPLACED: u16 = 4000;

/// Errors from sending on a transport.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The socket task is gone.
    #[error("transport closed")]
    Closed,
}

/// Item queued for the socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One text frame.
    Text(String),
    /// Close the socket with this code and reason; nothing follows.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Non-blocking outbound message handle.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queue one text frame.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Queue a close frame. Later sends may still succeed until the socket
    /// task drains the queue, but they will never reach the peer.
    fn close(&self, code: u16, reason: &str);
}

/// [`Transport`] backed by an unbounded channel to the socket task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    /// Create a transport and the receiver the socket task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_then_close() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send("hello".to_string()).unwrap();
        transport.close(CLOSE_REPLACED, "replaced");

        assert_eq!(rx.recv().await, Some(Outbound::Text("hello".to_string())));
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: CLOSE_REPLACED,
                reason: "replaced".to_string()
            })
        );
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        assert_eq!(
            transport.send("lost".to_string()),
            Err(TransportError::Closed)
        );
    }
}
