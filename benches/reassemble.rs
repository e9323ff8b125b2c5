// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use dvrip::media::Reassembler;

// 2014-06-09 18:43:05 UTC in the packed on-wire layout.
const DT_WORD: u32 = 0x3993_2AC5;

/// One synthetic GOP: a 64 KiB I-frame split over 16 packet bodies, nine
/// 8 KiB P-frames, and an interleaved audio block per video frame.
fn synthetic_gop() -> Vec<Bytes> {
    let mut bodies = Vec::new();
    let mut iframe = vec![0x00, 0x00, 0x01, 0xFC, 2, 25, 240, 135];
    iframe.extend_from_slice(&DT_WORD.to_le_bytes());
    iframe.extend_from_slice(&(16 * 4096u32).to_le_bytes());
    bodies.push(Bytes::from(iframe));
    for _ in 0..16 {
        bodies.push(Bytes::from(vec![0x80; 4096]));
    }
    for _ in 0..9 {
        let mut pframe = vec![0x00, 0x00, 0x01, 0xFD];
        pframe.extend_from_slice(&8192u32.to_le_bytes());
        bodies.push(Bytes::from(pframe));
        bodies.push(Bytes::from(vec![0x81; 8192]));
        let mut audio = vec![0x00, 0x00, 0x01, 0xFA, 0x0E, 0x08];
        audio.extend_from_slice(&320u32.to_le_bytes());
        audio.extend_from_slice(&[0x55; 320]);
        bodies.push(Bytes::from(audio));
    }
    bodies
}

fn criterion_benchmark(c: &mut Criterion) {
    let bodies = synthetic_gop();
    let total: usize = bodies.iter().map(Bytes::len).sum();
    let mut g = c.benchmark_group("reassemble");
    g.throughput(criterion::Throughput::Bytes(total as u64))
        .bench_function("gop", |b| {
            b.iter(|| {
                let mut r = Reassembler::new();
                let mut frames = 0usize;
                for body in &bodies {
                    if r.push(body.clone()).unwrap().is_some() {
                        frames += 1;
                    }
                }
                assert_eq!(frames, 19);
            })
        });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
