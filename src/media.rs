// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Media-side types and the chunk reassembler.
//!
//! After `OPMonitor` Start, the device pushes packets whose bodies carry a
//! proprietary chunked framing: a 4-byte big-endian magic tags the chunk
//! kind, a short little-endian header declares the payload length, and the
//! payload may span any number of subsequent packet bodies. [`Reassembler`]
//! turns that stream of bodies back into whole [`Frame`]s.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::ErrorInt;
use crate::Error;

/// Chunk magic for an I-frame (full picture header).
const CHUNK_IFRAME: u32 = 0x1FC;

/// Chunk magic for a P-frame continuation.
const CHUNK_PFRAME: u32 = 0x1FD;

/// Chunk magic for a G.711 audio block.
const CHUNK_AUDIO: u32 = 0x1FA;

/// Chunk magic for an informational record.
const CHUNK_INFO: u32 = 0x1F9;

/// Chunk magic for a JPEG picture header.
const CHUNK_JPEG: u32 = 0x1FE;

/// A raw JPEG start-of-image marker in place of a chunk header; the whole
/// packet body is one picture.
const JPEG_SOI: u32 = 0xFFD8_FFE0;

/// Compressed-stream encoding named by a chunk header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Mpeg4,
    H264,
    H265,
    G711a,
    Jpeg,
    /// Device informational record, not media proper.
    Info,
    Unknown,
}

impl MediaKind {
    /// The name as it appears in device documentation and tooling.
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Mpeg4 => "MPEG4",
            MediaKind::H264 => "H264",
            MediaKind::H265 => "H265",
            MediaKind::G711a => "G711A",
            MediaKind::Jpeg => "JPEG",
            MediaKind::Info => "info",
            MediaKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Video picture class, as tagged by the chunk magic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PictureKind {
    /// Intra-coded: decodable on its own.
    I,
    /// Predicted: depends on the preceding pictures.
    P,
}

impl std::fmt::Display for PictureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            PictureKind::I => "I",
            PictureKind::P => "P",
        })
    }
}

/// Decoded metadata attached to a [`Frame`].
///
/// Fields are populated from the chunk header that opened the frame; P-frame
/// continuations only carry a length, so most fields stay at their defaults
/// there.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaInfo {
    /// Picture width in pixels (the wire carries it divided by 8).
    pub width: u32,
    /// Picture height in pixels (the wire carries it divided by 8).
    pub height: u32,
    /// Device-stamped capture time.
    pub datetime: Option<DateTime<Utc>>,
    /// Frames per second as advertised in the I-frame header.
    pub fps: u8,
    /// `Some` for video pictures; `None` for audio and info records.
    pub picture: Option<PictureKind>,
    /// Encoding, where the chunk header names one.
    pub kind: Option<MediaKind>,
}

impl MetaInfo {
    /// True if this frame belongs in a video elementary stream.
    #[inline]
    pub fn is_video(&self) -> bool {
        self.picture.is_some()
    }

    /// True if this frame is an audio block.
    #[inline]
    pub fn is_audio(&self) -> bool {
        self.kind == Some(MediaKind::G711a)
    }
}

/// One reassembled media unit: an encoded picture, an audio block, or an
/// info record, together with its decoded metadata.
pub struct Frame {
    data: Bytes,
    meta: MetaInfo,
}

impl Frame {
    #[inline]
    pub fn meta(&self) -> &MetaInfo {
        &self.meta
    }

    /// Returns the payload with chunk headers and the packet trailer already
    /// stripped: for video, the raw NAL-unit stream; for audio, the G.711
    /// samples.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// Unpacks the 32-bit packed timestamp used in I-frame and JPEG headers.
///
/// Layout, LSB first: 6 bits second, 6 minute, 5 hour, 5 day, 4 month,
/// 6 year-since-2000. Values that don't name a real UTC instant (month 0 or
/// 13, hour 24, ...) are rejected.
pub fn parse_datetime(value: u32) -> Result<DateTime<Utc>, Error> {
    let second = value & 0x3F;
    let minute = (value >> 6) & 0x3F;
    let hour = (value >> 12) & 0x1F;
    let day = (value >> 17) & 0x1F;
    let month = (value >> 22) & 0x0F;
    let year = ((value >> 26) & 0x3F) + 2000;
    match Utc
        .with_ymd_and_hms(year as i32, month, day, hour, minute, second)
        .single()
    {
        Some(dt) => Ok(dt),
        None => bail!(ErrorInt::MalformedTimestamp { value }),
    }
}

/// Maps a `(chunk magic, media code)` pair to the encoding it names.
pub fn parse_media_type(data_type: u32, media_code: u8) -> MediaKind {
    match (data_type, media_code) {
        (CHUNK_IFRAME | CHUNK_PFRAME, 1) => MediaKind::Mpeg4,
        (CHUNK_IFRAME | CHUNK_PFRAME, 2) => MediaKind::H264,
        (CHUNK_IFRAME | CHUNK_PFRAME, 3) => MediaKind::H265,
        (CHUNK_INFO, 1 | 6) => MediaKind::Info,
        (CHUNK_AUDIO, 0x0E) => MediaKind::G711a,
        (CHUNK_JPEG, 0) => MediaKind::Jpeg,
        _ => MediaKind::Unknown,
    }
}

/// Stateful reassembly of pushed packet bodies into [`Frame`]s.
///
/// Feed each inbound packet body to [`Reassembler::push`] in arrival order;
/// TCP's FIFO delivery is what keeps the length accounting sound. A chunk
/// header is only ever looked for at a frame boundary: the payload is never
/// scanned for magics.
///
/// This interface is unstable and for internal use; it's exposed for direct
/// fuzzing and benchmarking.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Payload bytes still owed to the current frame. Zero means the next
    /// body must open with a chunk header.
    pending: u64,
    meta: MetaInfo,
    buf: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one packet body; returns a completed frame if this body
    /// finished one.
    pub fn push(&mut self, body: Bytes) -> Result<Option<Frame>, Error> {
        let tail = if self.pending == 0 {
            match self.begin_chunk(body)? {
                Opened::Whole(frame) => return Ok(Some(frame)),
                Opened::Payload(tail) => tail,
            }
        } else {
            body
        };
        if (tail.len() as u64) > self.pending {
            let (got, want) = (tail.len(), self.pending);
            self.reset();
            bail!(ErrorInt::ProtocolError {
                description: format!(
                    "media chunk overrun: packet carries {got} payload bytes \
                     but only {want} are pending"
                ),
            });
        }
        self.pending -= tail.len() as u64;
        self.buf.extend_from_slice(&tail);
        if self.pending == 0 {
            let frame = Frame {
                data: self.buf.split().freeze(),
                meta: std::mem::take(&mut self.meta),
            };
            return Ok(Some(frame));
        }
        Ok(None)
    }

    /// Parses the chunk header opening `body`; returns the payload bytes that
    /// follow it, or the finished frame for the single-packet JPEG form.
    fn begin_chunk(&mut self, body: Bytes) -> Result<Opened, Error> {
        if body.len() < 4 {
            bail!(ErrorInt::ProtocolError {
                description: format!(
                    "media packet too short for a chunk magic: {:?}",
                    crate::hex::LimitedHex::new(&body, 16)
                ),
            });
        }
        let data_type = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        match data_type {
            CHUNK_IFRAME | CHUNK_JPEG => {
                let h = Self::fixed(&body, 16)?;
                let media = h[4];
                self.meta.fps = h[5];
                self.meta.width = u32::from(h[6]) * 8;
                self.meta.height = u32::from(h[7]) * 8;
                self.meta.datetime =
                    Some(parse_datetime(u32::from_le_bytes([h[8], h[9], h[10], h[11]]))?);
                if data_type == CHUNK_IFRAME {
                    self.meta.picture = Some(PictureKind::I);
                }
                self.meta.kind = Some(parse_media_type(data_type, media));
                self.pending = u64::from(u32::from_le_bytes([h[12], h[13], h[14], h[15]]));
                Ok(Opened::Payload(body.slice(16..)))
            }
            CHUNK_PFRAME => {
                let h = Self::fixed(&body, 8)?;
                self.meta.picture = Some(PictureKind::P);
                self.pending = u64::from(u32::from_le_bytes([h[4], h[5], h[6], h[7]]));
                Ok(Opened::Payload(body.slice(8..)))
            }
            CHUNK_AUDIO | CHUNK_INFO => {
                let h = Self::fixed(&body, 10)?;
                let media = h[4];
                // h[5] is the sample-rate code; G.711A is always 8 kHz.
                self.meta.kind = Some(parse_media_type(data_type, media));
                self.pending = u64::from(u32::from_le_bytes([h[6], h[7], h[8], h[9]]));
                Ok(Opened::Payload(body.slice(10..)))
            }
            JPEG_SOI => {
                // The body is one complete picture, magic included.
                self.reset();
                Ok(Opened::Whole(Frame {
                    data: body,
                    meta: MetaInfo::default(),
                }))
            }
            _ => bail!(ErrorInt::UnknownChunkType { data_type }),
        }
    }

    fn fixed<'b>(body: &'b Bytes, len: usize) -> Result<&'b [u8], Error> {
        if body.len() < len {
            bail!(ErrorInt::ProtocolError {
                description: format!(
                    "media packet truncates its chunk header: {:?}",
                    crate::hex::LimitedHex::new(body, 24)
                ),
            });
        }
        Ok(&body[..len])
    }

    fn reset(&mut self) {
        self.pending = 0;
        self.meta = MetaInfo::default();
        self.buf.clear();
    }
}

/// Result of parsing a chunk header at a frame boundary.
enum Opened {
    /// Header consumed; these payload bytes count against `pending`.
    Payload(Bytes),
    /// The body was one self-contained frame (raw JPEG).
    Whole(Frame),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iframe_header(media: u8, fps: u8, w: u8, h: u8, dt: u32, len: u32) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xFC, media, fps, w, h];
        v.extend_from_slice(&dt.to_le_bytes());
        v.extend_from_slice(&len.to_le_bytes());
        v
    }

    // 2014-06-09 18:43:05 UTC per the packed layout.
    const DT_WORD: u32 = 0x3993_2AC5;

    #[test]
    fn datetime_unpack() {
        let dt = parse_datetime(DT_WORD).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2014, 6, 9, 18, 43, 5).unwrap());
    }

    #[test]
    fn datetime_rejects_out_of_range() {
        // month = 0
        let v = (14 << 26) | (0 << 22) | (9 << 17) | (18 << 12) | (43 << 6) | 5;
        assert!(parse_datetime(v).is_err());
        // month = 13
        let v = (14 << 26) | (13 << 22) | (9 << 17) | (18 << 12) | (43 << 6) | 5;
        assert!(parse_datetime(v).is_err());
        // hour = 25
        let v = (14 << 26) | (6 << 22) | (9 << 17) | (25 << 12) | (43 << 6) | 5;
        assert!(parse_datetime(v).is_err());
    }

    #[test]
    fn datetime_fields_in_range() {
        // Any word chrono accepts decodes to calendar-legal fields by
        // construction; spot-check the epoch of the scheme.
        let dt = parse_datetime((0 << 26) | (1 << 22) | (1 << 17)).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn media_type_table() {
        assert_eq!(parse_media_type(0x1FC, 1), MediaKind::Mpeg4);
        assert_eq!(parse_media_type(0x1FC, 2), MediaKind::H264);
        assert_eq!(parse_media_type(0x1FD, 3), MediaKind::H265);
        assert_eq!(parse_media_type(0x1F9, 1), MediaKind::Info);
        assert_eq!(parse_media_type(0x1F9, 6), MediaKind::Info);
        assert_eq!(parse_media_type(0x1FA, 0x0E), MediaKind::G711a);
        assert_eq!(parse_media_type(0x1FE, 0), MediaKind::Jpeg);
        assert_eq!(parse_media_type(0x1FA, 1), MediaKind::Unknown);
        assert_eq!(parse_media_type(0x123, 2), MediaKind::Unknown);
        assert_eq!(MediaKind::G711a.to_string(), "G711A");
    }

    #[test]
    fn iframe_then_continuation() {
        let mut r = Reassembler::new();

        // I-frame: H.264, 25 fps, 320x240, 100-byte payload split over two
        // packets, then a 32-byte P-frame in a single packet.
        let mut a = iframe_header(2, 25, 40, 30, DT_WORD, 100);
        a.extend_from_slice(&[0xAA; 50]);
        assert!(r.push(Bytes::from(a)).unwrap().is_none());

        let f = r.push(Bytes::from(vec![0xBB; 50])).unwrap().unwrap();
        assert_eq!(f.data().len(), 100);
        assert_eq!(&f.data()[..50], &[0xAA; 50][..]);
        assert_eq!(&f.data()[50..], &[0xBB; 50][..]);
        assert_eq!(f.meta().picture, Some(PictureKind::I));
        assert_eq!(f.meta().kind, Some(MediaKind::H264));
        assert_eq!(f.meta().width, 320);
        assert_eq!(f.meta().height, 240);
        assert_eq!(f.meta().fps, 25);
        assert_eq!(
            f.meta().datetime,
            Some(Utc.with_ymd_and_hms(2014, 6, 9, 18, 43, 5).unwrap())
        );
        assert!(f.meta().is_video());

        let mut c = vec![0x00, 0x00, 0x01, 0xFD];
        c.extend_from_slice(&32u32.to_le_bytes());
        c.extend_from_slice(&[0xCC; 32]);
        let f = r.push(Bytes::from(c)).unwrap().unwrap();
        assert_eq!(f.data(), &[0xCC; 32][..]);
        assert_eq!(f.meta().picture, Some(PictureKind::P));
        // Continuations carry no picture header; metadata resets between frames.
        assert_eq!(f.meta().width, 0);
        assert_eq!(f.meta().datetime, None);
    }

    #[test]
    fn audio_single_packet() {
        let mut r = Reassembler::new();
        let mut body = vec![0x00, 0x00, 0x01, 0xFA, 0x0E, 0x08];
        body.extend_from_slice(&320u32.to_le_bytes());
        body.extend_from_slice(&[0x55; 320]);
        let f = r.push(Bytes::from(body)).unwrap().unwrap();
        assert_eq!(f.data().len(), 320);
        assert_eq!(f.meta().kind, Some(MediaKind::G711a));
        assert!(f.meta().is_audio());
        assert!(!f.meta().is_video());
    }

    #[test]
    fn jpeg_soi_shortcut() {
        let mut r = Reassembler::new();
        let mut body = vec![0xFF, 0xD8, 0xFF, 0xE0];
        body.extend_from_slice(&[0x11; 40]);
        let f = r.push(Bytes::from(body.clone())).unwrap().unwrap();
        // The whole body, marker included, is the picture.
        assert_eq!(f.data(), &body[..]);
        // State is clean: a following audio chunk parses normally.
        let mut audio = vec![0x00, 0x00, 0x01, 0xFA, 0x0E, 0x08];
        audio.extend_from_slice(&4u32.to_le_bytes());
        audio.extend_from_slice(&[1, 2, 3, 4]);
        let f = r.push(Bytes::from(audio)).unwrap().unwrap();
        assert_eq!(f.data(), &[1, 2, 3, 4][..]);
    }

    #[test]
    fn unknown_magic_rejected() {
        let mut r = Reassembler::new();
        let err = r
            .push(Bytes::from_static(&[0x00, 0x00, 0x02, 0x00, 1, 2, 3]))
            .unwrap_err();
        assert!(err.to_string().contains("0x00000200"), "{err}");
    }

    #[test]
    fn overrun_rejected() {
        let mut r = Reassembler::new();
        let mut body = vec![0x00, 0x00, 0x01, 0xFD];
        body.extend_from_slice(&10u32.to_le_bytes());
        body.extend_from_slice(&[0; 11]);
        assert!(r.push(Bytes::from(body)).is_err());
    }

    #[test]
    fn truncated_chunk_header_rejected() {
        let mut r = Reassembler::new();
        assert!(r.push(Bytes::from_static(&[0x00, 0x00])).is_err());
        assert!(r
            .push(Bytes::from_static(&[0x00, 0x00, 0x01, 0xFC, 2, 25]))
            .is_err());
    }

    #[test]
    fn zero_length_chunk_emits_empty_frame() {
        let mut r = Reassembler::new();
        let mut body = vec![0x00, 0x00, 0x01, 0xFD];
        body.extend_from_slice(&0u32.to_le_bytes());
        let f = r.push(Bytes::from(body)).unwrap().unwrap();
        assert!(f.data().is_empty());
        assert_eq!(f.meta().picture, Some(PictureKind::P));
    }

    #[test]
    fn info_record() {
        let mut r = Reassembler::new();
        let mut body = vec![0x00, 0x00, 0x01, 0xF9, 0x06, 0x00];
        body.extend_from_slice(&2u32.to_le_bytes());
        body.extend_from_slice(b"ok");
        let f = r.push(Bytes::from(body)).unwrap().unwrap();
        assert_eq!(f.meta().kind, Some(MediaKind::Info));
        assert!(!f.meta().is_video());
        assert!(!f.meta().is_audio());
    }
}
