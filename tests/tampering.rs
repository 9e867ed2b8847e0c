use deadline::deadline;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod common;
use std::time::Duration;

use bytes::BytesMut;
use peerwire::{
    packet::{self, FRAME_HEADER_LEN},
    Config, Event, Session,
};

#[tokio::test]
async fn forged_packets_are_rejected_without_disconnecting() {
    let alice = crate::test_node!("alice");
    alice.start_listening().await.unwrap();
    let mut signals = alice.signals().unwrap();

    let (session, mut stream, addr) = common::raw_peer(&alice, "mallory").await;
    assert_eq!(
        common::next_signal(&mut signals).await.event(),
        Event::PeerConnected
    );

    // a flipped signature bit
    let mut forged = common::frame(&session, b"pay 10 coins");
    forged[FRAME_HEADER_LEN + 5] ^= 0x01;
    stream.write_all(&forged).await.unwrap();

    // a flipped ciphertext bit
    let mut forged = common::frame(&session, b"pay 20 coins");
    let last = forged.len() - 1;
    forged[last] ^= 0x01;
    stream.write_all(&forged).await.unwrap();

    // a well-formed frame with a garbage payload
    stream.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();

    // an empty frame
    stream.write_all(&[0, 0, 0, 0]).await.unwrap();

    stream
        .write_all(&common::frame(&session, b"pay 1 coin"))
        .await
        .unwrap();

    // only the genuine message gets through
    let signal = common::next_signal(&mut signals).await;
    assert_eq!(signal.event(), Event::MessageReceived);
    assert_eq!(signal.addr(), addr);
    assert_eq!(signal.payload(), &b"pay 1 coin"[..]);

    assert!(alice.is_connected(addr));
    assert_eq!(alice.stats().failures(), 3);
    assert_eq!(alice.peer(addr).unwrap().stats().failures(), 3);
}

#[tokio::test]
async fn undecryptable_packets_are_rejected_without_disconnecting() {
    let alice = crate::test_node!("alice");
    alice.start_listening().await.unwrap();
    let mut signals = alice.signals().unwrap();

    let (session, mut stream, addr) = common::raw_peer(&alice, "mallory").await;
    assert_eq!(
        common::next_signal(&mut signals).await.event(),
        Event::PeerConnected
    );

    // a genuine signature over a digest that was never encrypted
    let digest = [7u8; 40];
    let mut frame = BytesMut::new();
    packet::encode_frame(&session.sign(&digest), &digest, &mut frame).unwrap();
    stream.write_all(&frame).await.unwrap();

    stream
        .write_all(&common::frame(&session, b"ok"))
        .await
        .unwrap();

    let signal = common::next_signal(&mut signals).await;
    assert_eq!(signal.event(), Event::MessageReceived);
    assert_eq!(signal.payload(), &b"ok"[..]);

    assert!(alice.is_connected(addr));
    assert_eq!(alice.stats().failures(), 1);
    assert_eq!(alice.peer(addr).unwrap().stats().failures(), 1);
}

#[tokio::test]
async fn oversized_frames_end_the_connection() {
    let config = Config {
        max_payload_size: 1024,
        ..Default::default()
    };
    let alice = crate::test_node!("alice", config);
    alice.start_listening().await.unwrap();
    let mut signals = alice.signals().unwrap();

    let (_, mut stream, addr) = common::raw_peer(&alice, "mallory").await;
    assert_eq!(
        common::next_signal(&mut signals).await.event(),
        Event::PeerConnected
    );

    // the declared payload is never sent, nor read
    stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    let signal = common::next_signal(&mut signals).await;
    assert_eq!(signal.event(), Event::PeerDisconnected);
    assert_eq!(signal.addr(), addr);
    assert!(!alice.is_connected(addr));
    assert_eq!(alice.stats().failures(), 1);

    // the other end observes the closed stream
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn abrupt_disconnect_mid_frame() {
    let alice = crate::test_node!("alice");
    alice.start_listening().await.unwrap();
    let mut signals = alice.signals().unwrap();

    let (session, mut stream, addr) = common::raw_peer(&alice, "mallory").await;
    assert_eq!(
        common::next_signal(&mut signals).await.event(),
        Event::PeerConnected
    );

    let frame = common::frame(&session, b"this one never fully arrives");
    stream.write_all(&frame[..frame.len() / 2]).await.unwrap();
    drop(stream);

    let signal = common::next_signal(&mut signals).await;
    assert_eq!(signal.event(), Event::PeerDisconnected);
    assert_eq!(signal.addr(), addr);

    let alice_clone = alice.clone();
    deadline!(Duration::from_secs(1), move || alice_clone.num_connected() == 0);
    assert_eq!(alice.stats().received().0, 0);
}
