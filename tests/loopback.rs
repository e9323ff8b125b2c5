// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests against an in-process fake device on loopback TCP.

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use dvrip::client::{MonitorSpec, Session, Settings};
use dvrip::media::{MediaKind, PictureKind};
use dvrip::proto::{self, PacketHeader, HEADER_LEN, MAGIC_END};

// 2014-06-09 18:43:05 UTC in the packed on-wire layout.
const DT_WORD: u32 = 0x3993_2AC5;

async fn read_packet(stream: &mut TcpStream) -> Option<(PacketHeader, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.ok()?;
    let header = PacketHeader::parse(&header).expect("client sent a valid header");
    let mut body = vec![0u8; header.body_len as usize];
    stream.read_exact(&mut body).await.expect("body after header");
    assert_eq!(&body[body.len() - 2..], &MAGIC_END, "client must append the trailer");
    body.truncate(body.len() - 2);
    Some((header, body))
}

async fn write_packet(stream: &mut TcpStream, message_id: u16, session_id: u32, body: &[u8]) {
    let mut buf = BytesMut::new();
    proto::encode_packet(&mut buf, message_id, session_id, 0, body);
    stream.write_all(&buf).await.unwrap();
}

fn iframe_packet(payload: &[u8], declared_len: u32) -> Vec<u8> {
    let mut v = vec![0x00, 0x00, 0x01, 0xFC, 2, 25, 40, 30];
    v.extend_from_slice(&DT_WORD.to_le_bytes());
    v.extend_from_slice(&declared_len.to_le_bytes());
    v.extend_from_slice(payload);
    v
}

fn pframe_packet(payload: &[u8]) -> Vec<u8> {
    let mut v = vec![0x00, 0x00, 0x01, 0xFD];
    v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    v.extend_from_slice(payload);
    v
}

fn audio_packet(payload: &[u8]) -> Vec<u8> {
    let mut v = vec![0x00, 0x00, 0x01, 0xFA, 0x0E, 0x08];
    v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    v.extend_from_slice(payload);
    v
}

/// Serves one connection: login, claim, then the supplied media bodies on
/// Start. Returns when the client goes away.
async fn serve_device(listener: TcpListener, session_id: u32, media: Vec<Vec<u8>>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut expected_sequence = 0u32;
    while let Some((header, body)) = read_packet(&mut stream).await {
        assert_eq!(
            header.sequence, expected_sequence,
            "outbound sequence must count transmitted packets"
        );
        expected_sequence += 1;
        match header.message_id {
            1000 => {
                assert_eq!(header.session_id, 0);
                let creds: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(creds["UserName"], "admin");
                assert_eq!(creds["PassWord"], "tlJwpbo6");
                assert_eq!(creds["EncryptType"], "MD5");
                assert_eq!(creds["LoginType"], "DVRIP-WEB");
                let reply = format!(
                    r#"{{"AliveInterval":20,"ChannelNum":1,"Ret":100,"SessionID":"0x{session_id:08X}"}}"#
                );
                write_packet(&mut stream, 1001, session_id, reply.as_bytes()).await;
            }
            1413 => {
                assert_eq!(header.session_id, session_id);
                let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(envelope["Name"], "OPMonitor");
                assert_eq!(envelope["OPMonitor"]["Action"], "Claim");
                assert_eq!(envelope["OPMonitor"]["Parameter"]["TransMode"], "TCP");
                write_packet(&mut stream, 1414, session_id, br#"{"Ret":100}"#).await;
            }
            1410 => {
                let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(envelope["OPMonitor"]["Action"], "Start");
                for chunk in &media {
                    write_packet(&mut stream, 1412, session_id, chunk).await;
                }
            }
            other => panic!("unexpected message id {other}"),
        }
    }
}

async fn connect_and_login(addr: std::net::SocketAddr) -> Session {
    let settings = Settings::new(addr.to_string());
    let mut session = Session::connect(settings).await.unwrap();
    session.login().await.unwrap();
    session
}

#[tokio::test]
async fn login_monitor_stop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let media = vec![
        iframe_packet(&[0xAA; 60], 100),
        vec![0xBB; 40],
        pframe_packet(&[0xCC; 32]),
        audio_packet(&[0x55; 320]),
    ];
    let device = tokio::spawn(serve_device(listener, 0x42, media));

    let session = connect_and_login(addr).await;
    assert_eq!(session.session_id(), 0x42);
    assert_eq!(session.alive_interval(), std::time::Duration::from_secs(20));

    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let handle = session
        .spawn_monitor(MonitorSpec::new("Main"), tx)
        .await
        .unwrap();

    let video = rx.recv().await.expect("I-frame");
    assert_eq!(video.meta().picture, Some(PictureKind::I));
    assert_eq!(video.meta().kind, Some(MediaKind::H264));
    assert_eq!(video.meta().width, 320);
    assert_eq!(video.meta().height, 240);
    assert_eq!(video.meta().fps, 25);
    assert_eq!(video.data().len(), 100);

    let pframe = rx.recv().await.expect("P-frame");
    assert_eq!(pframe.meta().picture, Some(PictureKind::P));
    assert_eq!(pframe.data(), &[0xCC; 32][..]);

    let audio = rx.recv().await.expect("audio");
    assert!(audio.meta().is_audio());
    assert_eq!(audio.data().len(), 320);

    handle.stop();
    assert!(rx.recv().await.is_none(), "sink closes on stop");
    let (session, result) = handle.join().await;
    result.expect("clean stop");
    assert_eq!(session.session_id(), 0x42);

    session.close().await;
    device.await.unwrap();
}

#[tokio::test]
async fn login_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header.message_id, 1000);
        write_packet(&mut stream, 1001, 0, br#"{"Ret":106}"#).await;
    });

    let mut session = Session::connect(Settings::new(addr.to_string()).password("wrong"))
        .await
        .unwrap();
    let err = session.login().await.unwrap_err();
    assert!(err.is_auth_rejected(), "{err}");
    assert_eq!(err.status_code(), Some(106));
}

#[tokio::test]
async fn monitor_terminates_on_garbage() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let media = vec![
        audio_packet(&[0x01; 8]),
        vec![0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0],
    ];
    tokio::spawn(serve_device(listener, 0x07, media));

    let session = connect_and_login(addr).await;
    let mut monitor = session.monitor(MonitorSpec::new("Sub")).await.unwrap();

    let frame = monitor.next().await.unwrap().unwrap();
    assert!(frame.meta().is_audio());

    let err = monitor.next().await.unwrap().unwrap_err();
    assert!(err.to_string().contains("unknown media chunk type"), "{err}");

    // Terminal errors fuse the stream.
    assert!(monitor.next().await.is_none());
}

#[tokio::test]
async fn set_time_and_keep_alive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Some((header, body)) = read_packet(&mut stream).await {
            match header.message_id {
                1000 => {
                    write_packet(
                        &mut stream,
                        1001,
                        0x99,
                        br#"{"AliveInterval":21,"Ret":100,"SessionID":"0x00000099"}"#,
                    )
                    .await;
                }
                1006 => {
                    let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
                    assert_eq!(envelope["Name"], "KeepAlive");
                    assert_eq!(envelope["SessionID"], "0x00000099");
                    write_packet(&mut stream, 1007, 0x99, br#"{"Ret":100}"#).await;
                }
                1450 => {
                    let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
                    let time = envelope["OPTimeSetting"].as_str().unwrap();
                    // "YYYY-MM-DD HH:MM:SS"
                    assert_eq!(time.len(), 19, "{time}");
                    assert_eq!(&time[4..5], "-");
                    assert_eq!(&time[10..11], " ");
                    write_packet(&mut stream, 1451, 0x99, br#"{"Ret":100}"#).await;
                }
                other => panic!("unexpected message id {other}"),
            }
        }
    });

    let mut session = connect_and_login(addr).await;
    session.keep_alive().await.unwrap();
    session.sync_time().await.unwrap();
    session.close().await;
}
