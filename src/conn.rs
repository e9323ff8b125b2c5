// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based transport: one framed connection to one device.
//!
//! TCP is the default; UDP uses the same packet framing with one packet per
//! datagram. Either way the [`Connection`] owns the outbound sequence
//! counter, so packets hit the wire with strictly increasing sequence
//! numbers in write order.

use std::net::SocketAddr;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use tokio_util::udp::UdpFramed;

use crate::error::ErrorInt;
use crate::proto::{self, PacketHeader, HEADER_LEN, MAGIC_END};
use crate::{ConnectionContext, Error, MessageContext, WallTime};

/// One packet received from the device.
#[derive(Debug)]
pub(crate) struct Packet {
    pub(crate) header: PacketHeader,

    /// Body with the two-byte trailer already stripped.
    pub(crate) body: Bytes,

    pub(crate) ctx: MessageContext,
}

/// One packet queued for transmission.
#[derive(Debug)]
pub(crate) struct OutboundPacket {
    pub(crate) message_id: u16,
    pub(crate) session_id: u32,
    pub(crate) sequence: u32,
    pub(crate) body: Bytes,
}

/// Encodes and decodes DVR-IP packets.
struct Codec {
    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    Io(std::io::Error),
    Header { description: String, pos: u64 },
    Trailer { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }
        let header_bytes: &[u8; HEADER_LEN] = src[..HEADER_LEN]
            .try_into()
            .expect("slice length just checked");
        let header = PacketHeader::parse(header_bytes).map_err(|e| CodecError::Header {
            description: e.to_string(),
            pos: self.read_pos,
        })?;
        let total = HEADER_LEN + header.body_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut msg = src.split_to(total);
        msg.advance(HEADER_LEN);
        let trailer_at = msg.len() - MAGIC_END.len();
        if msg[trailer_at..] != MAGIC_END {
            return Err(CodecError::Trailer {
                description: format!(
                    "expected 0a 00, got {:?}",
                    crate::hex::LimitedHex::new(&msg[trailer_at..], 2)
                ),
                pos: self.read_pos + trailer_at as u64,
            });
        }
        msg.truncate(trailer_at);
        let ctx = MessageContext {
            pos: self.read_pos,
            received_wall: WallTime::now(),
        };
        self.read_pos += total as u64;
        Ok(Some(Packet {
            header,
            body: msg.freeze(),
            ctx,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        match self.decode(src)? {
            Some(pkt) => Ok(Some(pkt)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection dropped mid-packet with {} bytes buffered", src.len()),
            ))),
        }
    }
}

impl tokio_util::codec::Encoder<OutboundPacket> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: OutboundPacket, dst: &mut BytesMut) -> Result<(), CodecError> {
        proto::encode_packet(
            dst,
            item.message_id,
            item.session_id,
            item.sequence,
            &item.body,
        );
        Ok(())
    }
}

enum Inner {
    Tcp(Framed<TcpStream, Codec>),
    Udp {
        framed: UdpFramed<Codec>,
        peer: SocketAddr,
    },
}

/// A framed connection to a device.
///
/// Owns the outbound sequence counter; exactly one task may use the
/// connection at a time (`&mut self` throughout), which is what makes the
/// counter and the single-reader discipline sound.
pub(crate) struct Connection {
    inner: Inner,
    ctx: ConnectionContext,
    next_sequence: u32,
    read_timeout: std::time::Duration,
    write_timeout: std::time::Duration,
}

impl Connection {
    pub(crate) async fn connect_tcp(
        addr: &str,
        dial_timeout: std::time::Duration,
        read_timeout: std::time::Duration,
        write_timeout: std::time::Duration,
    ) -> Result<Self, Error> {
        let stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => bail!(ErrorInt::ConnectError { source }),
            Err(_) => bail!(ErrorInt::ConnectError {
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no connection to {addr} within {dial_timeout:?}"),
                ),
            }),
        };
        let ctx = ConnectionContext {
            local_addr: stream.local_addr().map_err(|source| wrap!(ErrorInt::ConnectError { source }))?,
            peer_addr: stream.peer_addr().map_err(|source| wrap!(ErrorInt::ConnectError { source }))?,
            established_wall: WallTime::now(),
        };
        Ok(Self {
            inner: Inner::Tcp(Framed::new(stream, Codec { read_pos: 0 })),
            ctx,
            next_sequence: 0,
            read_timeout,
            write_timeout,
        })
    }

    pub(crate) async fn connect_udp(
        addr: &str,
        dial_timeout: std::time::Duration,
        read_timeout: std::time::Duration,
        write_timeout: std::time::Duration,
    ) -> Result<Self, Error> {
        let setup = async {
            let peer = tokio::net::lookup_host(addr)
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{addr} resolved to no addresses"),
                    )
                })?;
            let local: SocketAddr = if peer.is_ipv4() {
                "0.0.0.0:0".parse().expect("valid local addr")
            } else {
                "[::]:0".parse().expect("valid local addr")
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(peer).await?;
            Ok::<_, std::io::Error>((socket, peer))
        };
        let (socket, peer) = match tokio::time::timeout(dial_timeout, setup).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => bail!(ErrorInt::ConnectError { source }),
            Err(_) => bail!(ErrorInt::ConnectError {
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no route to {addr} within {dial_timeout:?}"),
                ),
            }),
        };
        let ctx = ConnectionContext {
            local_addr: socket.local_addr().map_err(|source| wrap!(ErrorInt::ConnectError { source }))?,
            peer_addr: peer,
            established_wall: WallTime::now(),
        };
        Ok(Self {
            inner: Inner::Udp {
                framed: UdpFramed::new(socket, Codec { read_pos: 0 }),
                peer,
            },
            ctx,
            next_sequence: 0,
            read_timeout,
            write_timeout,
        })
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Polls for the next inbound packet. `Ready(None)` means the device
    /// closed the connection at a packet boundary.
    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Packet, Error>>> {
        let polled = match &mut self.inner {
            Inner::Tcp(framed) => framed.poll_next_unpin(cx),
            Inner::Udp { framed, .. } => match framed.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok((pkt, _addr)))) => Poll::Ready(Some(Ok(pkt))),
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        };
        match polled {
            Poll::Ready(Some(Ok(pkt))) => Poll::Ready(Some(Ok(pkt))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(self.wrap_read_err(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) fn poll_send_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let polled = match &mut self.inner {
            Inner::Tcp(framed) => framed.poll_ready_unpin(cx),
            Inner::Udp { framed, .. } => framed.poll_ready_unpin(cx),
        };
        polled.map_err(|e| self.wrap_write_err(e))
    }

    /// Queues one packet, stamping and advancing the sequence counter.
    /// Call [`Self::poll_send_ready`] first and [`Self::poll_flush`] after.
    pub(crate) fn start_send(
        &mut self,
        message_id: u16,
        session_id: u32,
        body: Bytes,
    ) -> Result<(), Error> {
        let pkt = OutboundPacket {
            message_id,
            session_id,
            sequence: self.next_sequence,
            body,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let res = match &mut self.inner {
            Inner::Tcp(framed) => framed.start_send_unpin(pkt),
            Inner::Udp { framed, peer } => {
                let peer = *peer;
                framed.start_send_unpin((pkt, peer))
            }
        };
        res.map_err(|e| self.wrap_write_err(e))
    }

    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let polled = match &mut self.inner {
            Inner::Tcp(framed) => framed.poll_flush_unpin(cx),
            Inner::Udp { framed, .. } => framed.poll_flush_unpin(cx),
        };
        polled.map_err(|e| self.wrap_write_err(e))
    }

    /// Writes one packet, honoring the configured write timeout.
    pub(crate) async fn send(
        &mut self,
        message_id: u16,
        session_id: u32,
        body: Bytes,
    ) -> Result<(), Error> {
        let conn_ctx = self.ctx;
        let write_timeout = self.write_timeout;
        let fut = async {
            futures::future::poll_fn(|cx| self.poll_send_ready(cx)).await?;
            self.start_send(message_id, session_id, body)?;
            futures::future::poll_fn(|cx| self.poll_flush(cx)).await
        };
        match tokio::time::timeout(write_timeout, fut).await {
            Ok(r) => r,
            Err(_) => bail!(ErrorInt::TransportInterrupted {
                conn_ctx,
                description: format!("write timed out after {write_timeout:?}"),
            }),
        }
    }

    /// Reads one packet, honoring the configured read timeout.
    pub(crate) async fn recv(&mut self) -> Result<Packet, Error> {
        let conn_ctx = self.ctx;
        let read_timeout = self.read_timeout;
        let fut = futures::future::poll_fn(|cx| self.poll_recv(cx));
        match tokio::time::timeout(read_timeout, fut).await {
            Ok(Some(r)) => r,
            Ok(None) => bail!(ErrorInt::TransportUnavailable {
                conn_ctx,
                description: "connection closed by device".to_owned(),
            }),
            Err(_) => bail!(ErrorInt::TransportInterrupted {
                conn_ctx,
                description: format!("read timed out after {read_timeout:?}"),
            }),
        }
    }

    /// Shuts down the write half (TCP) so the device sees a clean close.
    pub(crate) async fn shutdown(&mut self) {
        if let Inner::Tcp(framed) = &mut self.inner {
            if let Err(e) = framed.get_mut().shutdown().await {
                log::debug!("shutdown of {} failed: {e}", self.ctx.peer_addr);
            }
        }
    }

    fn wrap_read_err(&self, e: CodecError) -> Error {
        wrap!(match e {
            CodecError::Io(source) if source.kind() == std::io::ErrorKind::UnexpectedEof => {
                ErrorInt::TransportInterrupted {
                    conn_ctx: self.ctx,
                    description: source.to_string(),
                }
            }
            CodecError::Io(source) => ErrorInt::TransportUnavailable {
                conn_ctx: self.ctx,
                description: format!("read error: {source}"),
            },
            CodecError::Header { description, pos } => ErrorInt::MalformedHeader {
                conn_ctx: self.ctx,
                msg_ctx: MessageContext {
                    pos,
                    received_wall: WallTime::now(),
                },
                description,
            },
            CodecError::Trailer { description, pos } => ErrorInt::MalformedTrailer {
                conn_ctx: self.ctx,
                msg_ctx: MessageContext {
                    pos,
                    received_wall: WallTime::now(),
                },
                description,
            },
        })
    }

    fn wrap_write_err(&self, e: CodecError) -> Error {
        match e {
            CodecError::Io(source) => match source.kind() {
                std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::ConnectionReset => wrap!(ErrorInt::TransportClosed),
                _ => wrap!(ErrorInt::TransportUnavailable {
                    conn_ctx: self.ctx,
                    description: format!("write error: {source}"),
                }),
            },
            CodecError::Header { .. } | CodecError::Trailer { .. } => {
                unreachable!("encoding is infallible")
            }
        }
    }
}
