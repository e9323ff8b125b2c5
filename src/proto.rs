// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire-level pieces of the Sofia/DVR-IP protocol: the fixed packet framing,
//! the request/status code registries, and the password digest.
//!
//! A packet is a 20-byte little-endian header, `body_length` bytes of body,
//! and a fixed two-byte trailer (the trailer is counted by `body_length`).
//! The framing is symmetric: requests and replies use the same layout.

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};

/// First byte of every packet.
pub const MAGIC_HEAD: u8 = 0xFF;

/// Protocol version byte; always zero on the devices this crate targets.
pub const VERSION: u8 = 0;

/// Two-byte trailer closing every packet body.
pub const MAGIC_END: [u8; 2] = [0x0A, 0x00];

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 20;

/// Upper bound on `body_length`. Real bodies are a few hundred bytes of JSON
/// or up to ~64 KiB of media; anything past this indicates a desynchronized
/// or hostile stream.
pub const MAX_BODY_LEN: u32 = 16 << 20;

/// Default TCP port.
pub const PORT_TCP: u16 = 34567;

/// Default UDP port.
pub const PORT_UDP: u16 = 34568;

/// The fixed 20-byte packet header.
///
/// All multi-byte fields are little-endian on the wire. The two reserved
/// byte pairs (offsets 2–3 and 14–15) are written as zero and ignored on
/// read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub session_id: u32,
    pub sequence: u32,
    pub message_id: u16,

    /// Body length in bytes, *including* the two-byte trailer.
    pub body_len: u32,
}

/// Reason a 20-byte header failed validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaderError {
    BadMagic(u8),
    BodyTooShort(u32),
    BodyTooLong(u32),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::BadMagic(b) => write!(f, "leading byte {b:#04x} is not 0xff"),
            HeaderError::BodyTooShort(l) => {
                write!(f, "body length {l} can't cover the two-byte trailer")
            }
            HeaderError::BodyTooLong(l) => {
                write!(f, "body length {l} exceeds the {MAX_BODY_LEN}-byte cap")
            }
        }
    }
}

impl PacketHeader {
    /// Parses and validates a header from exactly [`HEADER_LEN`] bytes.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        if buf[0] != MAGIC_HEAD {
            return Err(HeaderError::BadMagic(buf[0]));
        }
        let body_len = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if body_len < MAGIC_END.len() as u32 {
            return Err(HeaderError::BodyTooShort(body_len));
        }
        if body_len > MAX_BODY_LEN {
            return Err(HeaderError::BodyTooLong(body_len));
        }
        Ok(PacketHeader {
            version: buf[1],
            session_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            sequence: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            message_id: u16::from_le_bytes([buf[14], buf[15]]),
            body_len,
        })
    }
}

/// Appends one complete packet (header, body, trailer) to `dst`.
///
/// This is the only place the trailer is written; callers hand over the bare
/// body and must not append [`MAGIC_END`] themselves.
pub fn encode_packet(dst: &mut BytesMut, message_id: u16, session_id: u32, sequence: u32, body: &[u8]) {
    dst.reserve(HEADER_LEN + body.len() + MAGIC_END.len());
    dst.put_u8(MAGIC_HEAD);
    dst.put_u8(VERSION);
    dst.put_bytes(0, 2);
    dst.put_u32_le(session_id);
    dst.put_u32_le(sequence);
    dst.put_bytes(0, 2);
    dst.put_u16_le(message_id);
    dst.put_u32_le((body.len() + MAGIC_END.len()) as u32);
    dst.put_slice(body);
    dst.put_slice(&MAGIC_END);
}

/// Status codes a device may return in the `Ret` field of a reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum StatusCode {
    Ok = 100,
    UnknownError = 101,
    UnsupportedVersion = 102,
    RequestNotPermitted = 103,
    UserAlreadyLoggedIn = 104,
    UserNotLoggedIn = 105,
    UsernameOrPasswordIncorrect = 106,
    InsufficientPermissions = 107,
    PasswordIncorrect = 203,
    StartOfUpgrade = 511,
    UpgradeNotStarted = 512,
    UpgradeDataErrors = 513,
    UpgradeError = 514,
    UpgradeSuccessful = 515,
}

impl StatusCode {
    pub fn from_ret(ret: i64) -> Option<StatusCode> {
        Some(match ret {
            100 => StatusCode::Ok,
            101 => StatusCode::UnknownError,
            102 => StatusCode::UnsupportedVersion,
            103 => StatusCode::RequestNotPermitted,
            104 => StatusCode::UserAlreadyLoggedIn,
            105 => StatusCode::UserNotLoggedIn,
            106 => StatusCode::UsernameOrPasswordIncorrect,
            107 => StatusCode::InsufficientPermissions,
            203 => StatusCode::PasswordIncorrect,
            511 => StatusCode::StartOfUpgrade,
            512 => StatusCode::UpgradeNotStarted,
            513 => StatusCode::UpgradeDataErrors,
            514 => StatusCode::UpgradeError,
            515 => StatusCode::UpgradeSuccessful,
            _ => return None,
        })
    }

    pub fn message(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::UnknownError => "unknown error",
            StatusCode::UnsupportedVersion => "unsupported version",
            StatusCode::RequestNotPermitted => "request not permitted",
            StatusCode::UserAlreadyLoggedIn => "user already logged in",
            StatusCode::UserNotLoggedIn => "user is not logged in",
            StatusCode::UsernameOrPasswordIncorrect => "username or password is incorrect",
            StatusCode::InsufficientPermissions => "user does not have necessary permissions",
            StatusCode::PasswordIncorrect => "password is incorrect",
            StatusCode::StartOfUpgrade => "start of upgrade",
            StatusCode::UpgradeNotStarted => "upgrade was not started",
            StatusCode::UpgradeDataErrors => "upgrade data errors",
            StatusCode::UpgradeError => "upgrade error",
            StatusCode::UpgradeSuccessful => "upgrade successful",
        }
    }

    /// True for the codes that mean the caller isn't authenticated: wrong
    /// credentials, or a session the device no longer recognizes (as opposed
    /// to a transient or permission failure).
    pub fn is_credential_failure(self) -> bool {
        matches!(
            self,
            StatusCode::UsernameOrPasswordIncorrect
                | StatusCode::PasswordIncorrect
                | StatusCode::UserNotLoggedIn
        )
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", *self as i64, self.message())
    }
}

/// A 16-bit request code, carried in the header's `msg_id` field.
///
/// Only a handful are used by this client; the rest of the registry is kept
/// as reserved constants so captures can be cross-referenced.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RequestCode(pub u16);

impl RequestCode {
    pub const LOGIN: RequestCode = RequestCode(1000);
    pub const KEEP_ALIVE: RequestCode = RequestCode(1006);
    pub const SYSTEM_INFO: RequestCode = RequestCode(1020);
    pub const GENERAL_CONFIG: RequestCode = RequestCode(1042);
    pub const CHANNEL_TITLE: RequestCode = RequestCode(1046);
    pub const SYSTEM_FUNCTION: RequestCode = RequestCode(1360);
    pub const OP_PTZ_CONTROL: RequestCode = RequestCode(1400);
    pub const OP_MONITOR_START: RequestCode = RequestCode(1410);
    pub const OP_MONITOR_CLAIM: RequestCode = RequestCode(1413);
    pub const OP_TALK: RequestCode = RequestCode(1434);
    pub const OP_TIME_SETTING: RequestCode = RequestCode(1450);
    pub const OP_TIME_QUERY: RequestCode = RequestCode(1452);
    pub const AUTHORITY_LIST: RequestCode = RequestCode(1470);
    pub const USERS: RequestCode = RequestCode(1472);
    pub const GROUPS: RequestCode = RequestCode(1474);
    pub const ADD_GROUP: RequestCode = RequestCode(1476);
    pub const MODIFY_GROUP: RequestCode = RequestCode(1478);
    pub const DEL_GROUP: RequestCode = RequestCode(1480);
    pub const ADD_USER: RequestCode = RequestCode(1482);
    pub const MODIFY_USER: RequestCode = RequestCode(1484);
    pub const DEL_USER: RequestCode = RequestCode(1486);
    pub const MODIFY_PASSWORD: RequestCode = RequestCode(1488);
    pub const ALARM_SET: RequestCode = RequestCode(1500);
    pub const ALARM_INFO: RequestCode = RequestCode(1504);
    pub const OP_NET_ALARM: RequestCode = RequestCode(1506);
    pub const OP_SEND_FILE: RequestCode = RequestCode(1522);
    pub const OP_SYSTEM_UPGRADE: RequestCode = RequestCode(1525);
    pub const OP_NET_KEYBOARD: RequestCode = RequestCode(1550);
    pub const OP_SNAP: RequestCode = RequestCode(1560);
    pub const OP_MAIL_TEST: RequestCode = RequestCode(1636);

    /// Canonical name used as the `Name` field (and the nested payload key)
    /// of the JSON envelope. `None` for codes the envelope layer doesn't
    /// speak; `LOGIN` is deliberately absent because login bypasses the
    /// envelope.
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            RequestCode::KEEP_ALIVE => "KeepAlive",
            RequestCode::SYSTEM_INFO => "SystemInfo",
            RequestCode::CHANNEL_TITLE => "ChannelTitle",
            RequestCode::OP_PTZ_CONTROL => "OPPTZControl",
            RequestCode::OP_MONITOR_START | RequestCode::OP_MONITOR_CLAIM => "OPMonitor",
            RequestCode::OP_TALK => "OPTalk",
            RequestCode::OP_TIME_SETTING => "OPTimeSetting",
            RequestCode::OP_TIME_QUERY => "OPTimeQuery",
            RequestCode::AUTHORITY_LIST => "AuthorityList",
            RequestCode::USERS => "Users",
            RequestCode::GROUPS => "Groups",
            RequestCode::OP_SNAP => "OPSNAP",
            RequestCode::OP_MAIL_TEST => "OPMailTest",
            _ => return None,
        })
    }
}

impl std::fmt::Debug for RequestCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(n) => write!(f, "RequestCode({} /* {} */)", self.0, n),
            None => write!(f, "RequestCode({})", self.0),
        }
    }
}

const SOFIA_ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Computes the 8-character digest a device expects in place of a plaintext
/// password.
///
/// Each pair of MD5 bytes is folded to `(a + b) % 62` and mapped into the
/// alphanumeric alphabet. The scheme is fixed by the device firmware;
/// bit-for-bit reproducibility matters more than its (nonexistent) strength.
pub fn sofia_hash(password: &str) -> String {
    let digest = Md5::digest(password.as_bytes());
    let mut hash = String::with_capacity(8);
    for pair in digest.chunks_exact(2) {
        let sum = usize::from(pair[0]) + usize::from(pair[1]);
        hash.push(SOFIA_ALPHABET[sum % SOFIA_ALPHABET.len()] as char);
    }
    hash
}
