//! Integration tests for the TCP receive-ack loop.

mod common;

use common::{data, device_flow, endpoint_flow, established_passive, Collect, DEVICE_ISN};
use eth_emu::endpoint::{EndpointConfig, ReceiveLimit, Role};
use eth_emu::frame::{self, flags, Addressing};
use eth_emu::EndpointError;

/// Every segment is answered with a pure ACK for `seq + payload_len`;
/// padding never counts and the local sequence number never moves.
#[tokio::test]
async fn bounded_receive_acks_each_segment() {
    let (ep, mut dev) = established_passive(ReceiveLimit::Exactly(3)).await;
    let local = ep.sequence().local;
    let hook = Collect::default();
    let mut ep = ep.with_hook(hook.clone());

    let first = data(DEVICE_ISN + 1, &[0x11; 10]);
    let second = data(DEVICE_ISN + 11, b"");
    // 6 payload bytes, padded by the link layer to 64 bytes.
    let mut third = data(DEVICE_ISN + 11, b"abcdef");
    third.extend_from_slice(&[0u8; 4]);
    // Never read: the limit is reached first.
    let fourth = data(DEVICE_ISN + 17, b"late");

    for segment in [&first, &second, &third, &fourth] {
        dev.send(segment).await;
    }

    let received = ep.run_inbound().await.unwrap();
    assert_eq!(received, 3);

    let expected_acks = [DEVICE_ISN + 11, DEVICE_ISN + 11, DEVICE_ISN + 17];
    for want in expected_acks {
        let raw = dev.recv().await;
        assert!(frame::verify_checksums(&raw).unwrap());
        let ack = frame::Frame::parse(&raw).unwrap();
        assert_eq!(ack.tcp_flags(), Some(flags::ACK));
        assert_eq!(ack.tcp().unwrap().acknowledgment_number, want);
        assert_eq!(ack.tcp().unwrap().sequence_number, local);
        assert_eq!(ack.payload_len(), 0);
        assert_eq!(Addressing::of(&ack), endpoint_flow());
    }
    assert!(dev.idle(), "only three ACKs expected");

    assert_eq!(hook.frames(), vec![first, second, third]);
    assert_eq!(ep.sequence().local, local);
    assert_eq!(ep.sequence().peer, DEVICE_ISN + 17);
}

#[tokio::test]
async fn ack_number_wraps_around() {
    let (mut ep, mut dev) = established_passive(ReceiveLimit::Exactly(1)).await;
    dev.send(&data(u32::MAX - 2, &[0u8; 5])).await;

    ep.run_inbound().await.unwrap();
    let ack = dev.recv_frame().await;
    assert_eq!(ack.tcp().unwrap().acknowledgment_number, 2);
}

#[tokio::test]
async fn unbounded_receive_stops_on_clean_close() {
    let (mut ep, mut dev) = established_passive(ReceiveLimit::Unbounded).await;
    dev.send(&data(DEVICE_ISN + 1, b"one")).await;
    dev.send(&data(DEVICE_ISN + 4, b"two")).await;
    dev.close().await;

    assert_eq!(ep.run_inbound().await.unwrap(), 2);
    assert_eq!(ep.sequence().peer, DEVICE_ISN + 7);
}

#[tokio::test]
async fn bounded_receive_fails_when_bus_closes_early() {
    let (mut ep, mut dev) = established_passive(ReceiveLimit::Exactly(3)).await;
    dev.send(&data(DEVICE_ISN + 1, b"only")).await;
    dev.close().await;

    let err = ep.run_inbound().await.unwrap_err();
    assert!(err.is_closed(), "got {err:?}");
}

#[tokio::test]
async fn non_tcp_segment_is_a_protocol_error() {
    let (mut ep, mut dev) = established_passive(ReceiveLimit::Exactly(1)).await;
    dev.send(&frame::build_udp(&device_flow(), b"udp").unwrap())
        .await;

    assert!(matches!(
        ep.run_inbound().await,
        Err(EndpointError::Protocol(_))
    ));
    assert!(dev.idle());
}

#[tokio::test]
async fn receive_requires_established_connection() {
    let (mut ep, _dev) = common::wire(EndpointConfig::new("eth0", 1, Role::TcpPassive));
    assert!(matches!(
        ep.run_inbound().await,
        Err(EndpointError::NotEstablished { .. })
    ));
}

/// Frames cut off mid-way by the bus closing are reported as truncated.
#[tokio::test]
async fn truncated_frame_is_reported() {
    use eth_emu::bus::WordSink;
    use eth_emu::stream::{StreamError, TransferWord};

    let (mut ep, mut dev) = established_passive(ReceiveLimit::Unbounded).await;
    dev.tx
        .write(TransferWord::new(vec![0u8; 8], false))
        .await
        .unwrap();
    dev.close().await;

    assert!(matches!(
        ep.run_inbound().await,
        Err(EndpointError::Stream(StreamError::TruncatedStream))
    ));
}

/// Words wider than the configured bus are refused, not stitched together.
#[tokio::test]
async fn oversized_word_is_rejected() {
    use eth_emu::bus::WordSink;
    use eth_emu::stream::{StreamError, TransferWord};

    let (mut ep, mut dev) = established_passive(ReceiveLimit::Unbounded).await;
    dev.tx
        .write(TransferWord::new(vec![0u8; 9], true))
        .await
        .unwrap();

    assert!(matches!(
        ep.run_inbound().await,
        Err(EndpointError::Stream(StreamError::OversizedWord {
            len: 9,
            bus_width: 8,
        }))
    ));
    assert!(dev.idle(), "no ACK for a rejected word");
}
