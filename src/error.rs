// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use thiserror::Error;

use crate::proto::StatusCode;
use crate::{ConnectionContext, MessageContext};

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; most carry enough
/// connection/byte-position context to find the offending packet in a
/// capture. Errors are cheaply clonable so a single terminal error can be
/// handed to both the media sink and the caller.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the device status code, if the error came from a non-success
    /// `Ret` in a reply.
    pub fn status_code(&self) -> Option<i64> {
        match self.0.as_ref() {
            ErrorInt::RemoteStatus { status, .. } => Some(*status),
            ErrorInt::AuthRejected { status } => Some(*status as i64),
            _ => None,
        }
    }

    /// Returns true if the device rejected the supplied credentials.
    ///
    /// Useful for callers that reconnect on transport errors but want to
    /// stop retrying on a bad password.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::AuthRejected { .. })
    }

    /// Returns true if the error indicates the session is no longer valid
    /// (a failed keep-alive); the caller should reconnect and log in again.
    pub fn is_session_lost(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::SessionLost { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The supplied [`crate::client::Settings`] failed validation.
    #[error("invalid settings: {0}")]
    ConfigInvalid(String),

    /// Dial failure: the device could not be reached at all.
    #[error("unable to connect to device: {source}")]
    ConnectError {
        #[source]
        source: std::io::Error,
    },

    /// The transport dropped after a successful dial.
    #[error("transport unavailable: {description}\n\nconn: {conn_ctx}")]
    TransportUnavailable {
        conn_ctx: ConnectionContext,
        description: String,
    },

    /// A read or write timed out, or a read was truncated mid-packet.
    #[error("transport interrupted: {description}\n\nconn: {conn_ctx}")]
    TransportInterrupted {
        conn_ctx: ConnectionContext,
        description: String,
    },

    /// Operation on a session whose transport was already shut down locally.
    #[error("transport closed")]
    TransportClosed,

    #[error("malformed packet header: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    MalformedHeader {
        conn_ctx: ConnectionContext,
        msg_ctx: MessageContext,
        description: String,
    },

    #[error("malformed packet trailer: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    MalformedTrailer {
        conn_ctx: ConnectionContext,
        msg_ctx: MessageContext,
        description: String,
    },

    /// Unexpected JSON shape, missing fields, or bad field types in a reply.
    #[error("protocol error: {description}")]
    ProtocolError { description: String },

    /// The media reassembler saw a chunk magic it doesn't recognize.
    #[error("unknown media chunk type {data_type:#010x}")]
    UnknownChunkType { data_type: u32 },

    /// A packed device timestamp had out-of-range fields.
    #[error("malformed packed timestamp {value:#010x}")]
    MalformedTimestamp { value: u32 },

    /// Login was refused because of the supplied credentials.
    #[error("authentication rejected: {status}")]
    AuthRejected { status: StatusCode },

    /// The device answered with a non-success status code.
    #[error("device returned status {status}: {message}")]
    RemoteStatus { status: i64, message: String },

    /// A keep-alive failed; the session marker is no longer trusted.
    #[error("session lost: {description}")]
    SessionLost { description: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_accessor() {
        let e = Error(Arc::new(ErrorInt::RemoteStatus {
            status: 103,
            message: "request not permitted".to_owned(),
        }));
        assert_eq!(e.status_code(), Some(103));
        assert!(!e.is_auth_rejected());

        let e = Error(Arc::new(ErrorInt::AuthRejected {
            status: StatusCode::UsernameOrPasswordIncorrect,
        }));
        assert_eq!(e.status_code(), Some(106));
        assert!(e.is_auth_rejected());
    }
}
