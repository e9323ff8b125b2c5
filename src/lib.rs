// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Async client for the Sofia/DVR-IP protocol spoken by Xiongmai-family
//! DVRs, NVRs, and IP cameras.
//!
//! The client logs in, keeps the session alive, subscribes to a live
//! audio/video stream, and reassembles the device's proprietary media
//! framing into discrete [`media::Frame`]s with decoded metadata. Decoding
//! the compressed payloads themselves (H.264/H.265/G.711A) is out of scope;
//! frames are handed over as-is.
//!
//! ```no_run
//! use futures::StreamExt;
//! use dvrip::client::{MonitorSpec, Session, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::new("192.168.1.147").password("");
//!     let mut session = Session::connect(settings).await?;
//!     session.login().await?;
//!     let mut monitor = session.monitor(MonitorSpec::new("Main")).await?;
//!     while let Some(frame) = monitor.next().await {
//!         let frame = frame?;
//!         if frame.meta().is_video() {
//!             // feed a decoder, write to disk, ...
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::Display;

mod error;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod client;
mod conn;
mod hex;
pub mod media;
pub mod proto;

/// A wall time taken from the local machine's realtime clock, used in error
/// reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// Connection context: enough information to pick the flow out of a packet
/// capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: std::net::SocketAddr,
    peer_addr: std::net::SocketAddr,
    established_wall: WallTime,
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received packet (or read error) within a connection.
///
/// Paired with a [`ConnectionContext`], this should allow picking the packet
/// out of a capture: the bottom 32 bits of `pos` can be compared to the
/// relative TCP sequence number.
#[derive(Copy, Clone, Debug)]
pub struct MessageContext {
    /// Starting byte position within the input stream.
    pos: u64,

    received_wall: WallTime,
}

impl MessageContext {
    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}
