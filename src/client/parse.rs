// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON envelope construction and reply parsing.
//!
//! Apart from login (whose body is the bare credentials object), every
//! command body is `{"Name": <name>, "SessionID": "0x%08X", <name>:
//! <payload>}`. Keys serialize in sorted order, which matches what device
//! firmwares produce and expect in practice.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ErrorInt;
use crate::Error;

/// Login body. Field order here is serialization order and is part of the
/// wire contract tests below.
#[derive(Serialize)]
pub(crate) struct LoginRequest<'a> {
    #[serde(rename = "EncryptType")]
    pub(crate) encrypt_type: &'static str,
    #[serde(rename = "LoginType")]
    pub(crate) login_type: &'static str,
    #[serde(rename = "PassWord")]
    pub(crate) password: &'a str,
    #[serde(rename = "UserName")]
    pub(crate) username: &'a str,
}

/// Fields common to every reply; commands ignore the login-only ones.
#[derive(Debug, Deserialize)]
pub(crate) struct Reply {
    #[serde(rename = "Ret", deserialize_with = "ret_code")]
    pub(crate) ret: i64,
    #[serde(rename = "SessionID", default)]
    pub(crate) session_id: Option<String>,
    #[serde(rename = "AliveInterval", default)]
    pub(crate) alive_interval: Option<f64>,
}

/// Accepts `Ret` as either an integer or a floating literal; some firmwares
/// emit `100.0`.
fn ret_code<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let n = serde_json::Number::deserialize(deserializer)?;
    n.as_i64()
        .or_else(|| n.as_f64().map(|f| f as i64))
        .ok_or_else(|| serde::de::Error::custom("Ret is not representable as an integer"))
}

/// Formats a session id the way devices expect it echoed: `0x` plus eight
/// uppercase hex digits.
pub(crate) fn session_id_hex(session_id: u32) -> String {
    format!("{session_id:#010X}")
}

/// Parses a session id string from a reply; the `0x` prefix is optional.
pub(crate) fn parse_session_id(s: &str) -> Result<u32, Error> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|_| {
        wrap!(ErrorInt::ProtocolError {
            description: format!("SessionID {s:?} is not a hex integer"),
        })
    })
}

/// Builds the standard command envelope.
pub(crate) fn envelope(
    name: &str,
    session_id: u32,
    payload: &serde_json::Value,
) -> Result<Vec<u8>, Error> {
    let mut map = serde_json::Map::new();
    map.insert("Name".to_owned(), name.into());
    map.insert("SessionID".to_owned(), session_id_hex(session_id).into());
    map.insert(name.to_owned(), payload.clone());
    serde_json::to_vec(&map).map_err(|e| {
        wrap!(ErrorInt::ProtocolError {
            description: format!("unable to serialize {name} envelope: {e}"),
        })
    })
}

/// Builds the keep-alive body, which carries no nested payload.
pub(crate) fn keep_alive_body(session_id: u32) -> Vec<u8> {
    let mut map = serde_json::Map::new();
    map.insert("Name".to_owned(), "KeepAlive".into());
    map.insert("SessionID".to_owned(), session_id_hex(session_id).into());
    serde_json::to_vec(&map).expect("keep-alive body serialization is infallible")
}

/// Parses a reply body, tolerating trailing NUL padding some firmwares
/// append before the packet trailer.
pub(crate) fn parse_reply(body: &[u8]) -> Result<Reply, Error> {
    let trimmed = match body.iter().rposition(|&b| b != 0) {
        Some(last) => &body[..=last],
        None => body,
    };
    serde_json::from_slice(trimmed).map_err(|e| {
        wrap!(ErrorInt::ProtocolError {
            description: format!(
                "unable to parse reply as JSON: {e}; body {:?}",
                crate::hex::LimitedHex::new(body, 64)
            ),
        })
    })
}
