// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use bytes::{Buf, Bytes};
use libfuzzer_sys::fuzz_target;

// Split the input into packet bodies (a two-byte length prefix each) and
// feed them through the reassembler; it must never panic, only error.
fuzz_target!(|data: &[u8]| {
    let mut data = Bytes::copy_from_slice(data);
    let mut reassembler = dvrip::media::Reassembler::new();
    while data.remaining() >= 2 {
        let len = usize::from(data.get_u16());
        if len > data.remaining() {
            return;
        }
        let body = data.split_to(len);
        match reassembler.push(body) {
            Ok(_) => {}
            Err(_) => return,
        }
    }
});
