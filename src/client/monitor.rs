// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Live monitoring: subscription setup and the media pump.
//!
//! Once a subscription starts, the device pushes media packets unsolicited
//! on the same connection, so the pump becomes the connection's only reader.
//! Keep-alives are folded into the pump's poll loop: they're sent on a timer
//! without blocking the stream, and their replies are recognized by message
//! id and swallowed before the reassembler sees them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use log::{debug, trace, warn};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Instant, Sleep};

use crate::error::ErrorInt;
use crate::media::{Frame, Reassembler};
use crate::proto::RequestCode;
use crate::Error;

use super::{parse, Session};

/// What to subscribe to.
///
/// Production deployments use stream `"Main"` (high-res) or `"Sub"`
/// (low-res); the set of valid names is device-defined.
#[derive(Clone, Debug)]
pub struct MonitorSpec {
    stream: String,
    channel: u32,
}

impl MonitorSpec {
    pub fn new(stream: impl Into<String>) -> Self {
        MonitorSpec {
            stream: stream.into(),
            channel: 0,
        }
    }

    pub fn channel(self, channel: u32) -> Self {
        Self { channel, ..self }
    }

    /// The `Parameter` object sent in both the Claim and Start envelopes.
    fn parameter(&self) -> serde_json::Value {
        serde_json::json!({
            "Channel": self.channel,
            "CombinMode": "NONE",
            "StreamType": self.stream,
            "TransMode": "TCP",
        })
    }
}

impl Default for MonitorSpec {
    fn default() -> Self {
        MonitorSpec::new("Main")
    }
}

impl Session {
    /// Claims and starts a live subscription, converting the session into a
    /// [`Monitor`] stream of frames.
    ///
    /// Taking the session by value is what enforces the protocol's
    /// single-reader rule: while the subscription lives, nothing else can
    /// issue a read. Call [`Monitor::into_session`] to get the session back
    /// for another subscription.
    pub async fn monitor(mut self, spec: MonitorSpec) -> Result<Monitor, Error> {
        let parameter = spec.parameter();
        self.command(
            RequestCode::OP_MONITOR_CLAIM,
            serde_json::json!({ "Action": "Claim", "Parameter": parameter.clone() }),
        )
        .await?;
        // Start is fire-and-forget: the device answers it with the media
        // stream itself, not a reply.
        let body = parse::envelope(
            "OPMonitor",
            self.session_id,
            &serde_json::json!({ "Action": "Start", "Parameter": parameter }),
        )?;
        self.conn
            .send(RequestCode::OP_MONITOR_START.0, self.session_id, body.into())
            .await?;
        debug!("monitoring {}/channel {}", spec.stream, spec.channel);
        Ok(Monitor::new(self))
    }

    /// Like [`Session::monitor`], but pumps frames into `sink` from a
    /// spawned task.
    ///
    /// The channel closing signals termination: a clean stop (via
    /// [`MonitorHandle::stop`] or the receiver being dropped) yields `Ok`
    /// from [`MonitorHandle::join`], a transport or protocol failure yields
    /// the terminal error. A bounded channel gives natural backpressure: a
    /// slow consumer stalls the pump and, in turn, the TCP window.
    pub async fn spawn_monitor(
        self,
        spec: MonitorSpec,
        sink: mpsc::Sender<Frame>,
    ) -> Result<MonitorHandle, Error> {
        let mut monitor = self.monitor(spec).await?;
        let stop = Arc::new(Notify::new());
        let stop_pump = stop.clone();
        let task = tokio::spawn(async move {
            let result = run_pump(&mut monitor, sink, &stop_pump).await;
            if let Err(ref e) = result {
                warn!("monitor terminated: {e}");
            }
            (monitor.into_session(), result)
        });
        Ok(MonitorHandle { stop, task })
    }
}

async fn run_pump(
    monitor: &mut Monitor,
    sink: mpsc::Sender<Frame>,
    stop: &Notify,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            biased;
            _ = stop.notified() => {
                debug!("monitor stop requested");
                return Ok(());
            }
            item = monitor.next() => match item {
                Some(Ok(frame)) => {
                    tokio::select! {
                        biased;
                        _ = stop.notified() => return Ok(()),
                        sent = sink.send(frame) => {
                            if sent.is_err() {
                                debug!("frame sink dropped; stopping monitor");
                                return Ok(());
                            }
                        }
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

/// Handle to a monitor pump started by [`Session::spawn_monitor`].
pub struct MonitorHandle {
    stop: Arc<Notify>,
    task: tokio::task::JoinHandle<(Session, Result<(), Error>)>,
}

impl MonitorHandle {
    /// Requests a cooperative stop. Idempotent; the pump observes it by its
    /// next emission attempt.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// Waits for the pump to finish, returning the session (for re-login or
    /// another subscription) and the terminal result: `Ok(())` after a clean
    /// stop, otherwise the error that ended the subscription.
    pub async fn join(self) -> (Session, Result<(), Error>) {
        self.task.await.expect("monitor pump task panicked")
    }
}

enum KeepaliveState {
    Idle,
    /// Queued to the transport but not yet flushed.
    Flushing,
    /// Flushed; the reply hasn't been seen yet.
    Waiting,
}

/// An active subscription, yielding reassembled frames as a
/// [`futures::Stream`].
///
/// The stream is terminal-error-fused: after yielding an `Err`, it yields
/// `None` forever. Dropping it tears the transport down with it; use
/// [`Monitor::into_session`] to keep the session instead.
pub struct Monitor {
    session: Session,
    reassembler: Reassembler,
    keepalive_state: KeepaliveState,
    // Boxed so `Monitor` stays `Unpin` and the session can be recovered
    // from the stream by value.
    keepalive_timer: Pin<Box<Sleep>>,
    idle_timer: Pin<Box<Sleep>>,
    done: bool,
}

impl Monitor {
    fn new(session: Session) -> Self {
        let keepalive_timer = Box::pin(sleep(session.alive_interval));
        let idle_timer = Box::pin(sleep(session.settings.read_timeout));
        Monitor {
            session,
            reassembler: Reassembler::new(),
            keepalive_state: KeepaliveState::Idle,
            keepalive_timer,
            idle_timer,
            done: false,
        }
    }

    /// Abandons the subscription and returns the session.
    ///
    /// The device keeps pushing media until it notices silence; callers
    /// normally log in again or re-subscribe right away, which resets the
    /// device side.
    pub fn into_session(self) -> Session {
        self.session
    }

    fn terminal(&mut self, e: Error) -> Poll<Option<Result<Frame, Error>>> {
        self.done = true;
        Poll::Ready(Some(Err(e)))
    }
}

impl futures::Stream for Monitor {
    type Item = Result<Frame, Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            // First try receiving data; media is allowed to starve the
            // timers. If we can't keep up the device will drop us anyway.
            match this.session.conn.poll_recv(cx) {
                Poll::Ready(Some(Ok(pkt))) => {
                    this.idle_timer
                        .as_mut()
                        .reset(Instant::now() + this.session.settings.read_timeout);
                    let msg_id = pkt.header.message_id;
                    if matches!(this.keepalive_state, KeepaliveState::Waiting)
                        && (msg_id == RequestCode::KEEP_ALIVE.0
                            || msg_id == RequestCode::KEEP_ALIVE.0 + 1)
                    {
                        this.keepalive_state = KeepaliveState::Idle;
                        match parse::parse_reply(&pkt.body) {
                            Ok(reply) if reply.ret == 100 => {
                                trace!("keep-alive acknowledged during monitor")
                            }
                            Ok(reply) => {
                                return this.terminal(wrap!(ErrorInt::SessionLost {
                                    description: format!(
                                        "keep-alive rejected with Ret {}",
                                        reply.ret
                                    ),
                                }));
                            }
                            Err(e) => warn!("unparseable keep-alive reply: {e}"),
                        }
                        continue;
                    }
                    match this.reassembler.push(pkt.body) {
                        Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                        Ok(None) => continue,
                        Err(e) => return this.terminal(e),
                    }
                }
                Poll::Ready(Some(Err(e))) => return this.terminal(e),
                Poll::Ready(None) => {
                    let conn_ctx = *this.session.conn.ctx();
                    return this.terminal(wrap!(ErrorInt::TransportUnavailable {
                        conn_ctx,
                        description: "device closed the connection mid-stream".to_owned(),
                    }));
                }
                Poll::Pending => {}
            }

            // Then check whether a keep-alive is due.
            if this.keepalive_timer.as_mut().poll(cx).is_ready() {
                match this.keepalive_state {
                    KeepaliveState::Flushing | KeepaliveState::Waiting => {
                        let interval = this.session.alive_interval;
                        return this.terminal(wrap!(ErrorInt::SessionLost {
                            description: format!(
                                "device did not answer the keep-alive within {interval:?}"
                            ),
                        }));
                    }
                    KeepaliveState::Idle => {}
                }
                match this.session.conn.poll_send_ready(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return this.terminal(e),
                    Poll::Pending => {
                        // The pump is the only writer and the previous
                        // keep-alive has been flushed, so the sink should
                        // always be ready here.
                        let conn_ctx = *this.session.conn.ctx();
                        return this.terminal(wrap!(ErrorInt::TransportInterrupted {
                            conn_ctx,
                            description: "write stalled before keep-alive".to_owned(),
                        }));
                    }
                }
                let body = parse::keep_alive_body(this.session.session_id);
                if let Err(e) = this.session.conn.start_send(
                    RequestCode::KEEP_ALIVE.0,
                    this.session.session_id,
                    body.into(),
                ) {
                    return this.terminal(e);
                }
                this.keepalive_state = KeepaliveState::Flushing;
                this.keepalive_timer
                    .as_mut()
                    .reset(Instant::now() + this.session.alive_interval);
            }

            // Then finish flushing the current keep-alive if necessary.
            if matches!(this.keepalive_state, KeepaliveState::Flushing) {
                match this.session.conn.poll_flush(cx) {
                    Poll::Ready(Ok(())) => this.keepalive_state = KeepaliveState::Waiting,
                    Poll::Ready(Err(e)) => return this.terminal(e),
                    Poll::Pending => {}
                }
            }

            // A silent device is indistinguishable from a dead one.
            if this.idle_timer.as_mut().poll(cx).is_ready() {
                let conn_ctx = *this.session.conn.ctx();
                let read_timeout = this.session.settings.read_timeout;
                return this.terminal(wrap!(ErrorInt::TransportInterrupted {
                    conn_ctx,
                    description: format!("no packet within {read_timeout:?}"),
                }));
            }

            // Nothing to do. The poll calls above have already registered
            // cx as necessary.
            return Poll::Pending;
        }
    }
}
