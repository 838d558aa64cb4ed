//! Crate-wide error type.

use thiserror::Error;

use crate::bus::TransportError;
use crate::capture::CaptureError;
use crate::endpoint::{Duty, Role};
use crate::frame::PacketError;
use crate::state::ConnectionState;
use crate::stream::StreamError;

/// Everything an endpoint operation can fail with.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// A received frame does not fit the protocol step it arrived in.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The three-way handshake could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The stimulus was asked for a frame past its end.
    #[error("stimulus exhausted: frame {index} requested but only {total} available")]
    ExhaustedStimulus { index: usize, total: usize },

    /// The role has no implementation for this duty.
    #[error("{duty} duty is not supported for {role} endpoints")]
    UnsupportedDuty { role: Role, duty: Duty },

    /// An operation was called on an endpoint of the wrong role.
    #[error("{operation} requires a {expected} endpoint, this one is a {actual} endpoint")]
    WrongRole {
        operation: &'static str,
        expected: Role,
        actual: Role,
    },

    /// A TCP operation was called before the handshake completed.
    #[error("{operation} requires an established connection, state is {state}")]
    NotEstablished {
        state: ConnectionState,
        operation: &'static str,
    },

    /// A duty task panicked or was aborted.
    #[error("duty task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EndpointError {
    /// `true` when the error is a transport close rather than a fault.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Closed))
    }
}
