//! Shared fixtures: an emulated device on the far side of an in-process bus.
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use eth_emu::bus::{self, ChannelSink, ChannelSource, WordSink};
use eth_emu::endpoint::{Endpoint, EndpointConfig, ReceiveHook, ReceiveLimit, Role};
use eth_emu::frame::{self, flags, Addressing, Frame};
use eth_emu::stream;
use eth_emu::EndpointError;

pub type TestEndpoint = Endpoint<ChannelSink, ChannelSource>;

pub const BUS_WIDTH: NonZeroUsize = match NonZeroUsize::new(8) {
    Some(w) => w,
    None => unreachable!(),
};

/// Sequence number the device starts its side of the connection with.
pub const DEVICE_ISN: u32 = 1000;

/// Device → endpoint addressing.
pub fn device_flow() -> Addressing {
    Addressing {
        source_mac: [0x02, 0, 0, 0, 0, 0xaa],
        destination_mac: [0x02, 0, 0, 0, 0, 0xbb],
        source_ip: Ipv4Addr::new(192, 168, 0, 10),
        destination_ip: Ipv4Addr::new(192, 168, 0, 20),
        source_port: 5001,
        destination_port: 40000,
    }
}

/// Endpoint → device addressing.
pub fn endpoint_flow() -> Addressing {
    device_flow().reversed()
}

/// The simulated device: writes to the endpoint's source, reads its sink.
pub struct Device {
    pub tx: ChannelSink,
    pub rx: ChannelSource,
}

impl Device {
    pub async fn send(&mut self, frame: &[u8]) {
        stream::transmit_frame(&mut self.tx, frame, BUS_WIDTH)
            .await
            .expect("device send");
    }

    pub async fn recv(&mut self) -> Vec<u8> {
        let frame = stream::receive_frame(&mut self.rx, BUS_WIDTH);
        tokio::time::timeout(Duration::from_secs(5), frame)
            .await
            .expect("device recv timed out")
            .expect("device recv failed")
            .expect("endpoint closed its sink")
    }

    pub async fn recv_frame(&mut self) -> Frame {
        Frame::parse(&self.recv().await).expect("endpoint sent a malformed frame")
    }

    /// `true` if the endpoint has written nothing that is still queued.
    pub fn idle(&mut self) -> bool {
        self.rx.try_read().is_none()
    }

    /// Close the device → endpoint channel.
    pub async fn close(&mut self) {
        self.tx.disconnect().await;
    }
}

pub fn wire(config: EndpointConfig) -> (TestEndpoint, Device) {
    let (ep_sink, dev_rx) = bus::channel(256);
    let (dev_tx, ep_source) = bus::channel(256);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let endpoint = Endpoint::new(config, ep_sink, ep_source, &mut rng);
    (endpoint, Device { tx: dev_tx, rx: dev_rx })
}

pub fn tcp(flow: &Addressing, seq: u32, ack: u32, bits: u8, payload: &[u8]) -> Vec<u8> {
    frame::build_tcp(flow, seq, ack, bits, payload).unwrap()
}

/// Data segment from the device.
pub fn data(seq: u32, payload: &[u8]) -> Vec<u8> {
    tcp(&device_flow(), seq, 0, flags::ACK | flags::PSH, payload)
}

/// Passive endpoint past its handshake, with the SYN-ACK already drained.
pub async fn established_passive(limit: ReceiveLimit) -> (TestEndpoint, Device) {
    let config = EndpointConfig::new("eth0", 1, Role::TcpPassive).with_receive_limit(limit);
    let (mut ep, mut dev) = wire(config);
    let isn = ep.sequence().local;

    dev.send(&tcp(&device_flow(), DEVICE_ISN, 0, flags::SYN, &[])).await;
    dev.send(&tcp(
        &device_flow(),
        DEVICE_ISN + 1,
        isn.wrapping_add(1),
        flags::ACK,
        &[],
    ))
    .await;
    ep.accept_connection().await.expect("handshake");
    dev.recv().await;
    (ep, dev)
}

/// Active endpoint past its handshake, with SYN and final ACK drained.
pub async fn established_active(peer_isn: u32) -> (TestEndpoint, Device) {
    let config = EndpointConfig::new("eth0", 0, Role::TcpActive);
    let (mut ep, mut dev) = wire(config);
    let isn = ep.sequence().local;

    dev.send(&tcp(
        &device_flow(),
        peer_isn,
        isn.wrapping_add(1),
        flags::SYN | flags::ACK,
        &[],
    ))
    .await;
    ep.initiate_connection(endpoint_flow())
        .await
        .expect("handshake");
    dev.recv().await;
    dev.recv().await;
    (ep, dev)
}

/// Hook that keeps every frame for inspection.
#[derive(Clone, Default)]
pub struct Collect(pub Arc<Mutex<Vec<Vec<u8>>>>);

impl Collect {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

impl ReceiveHook for Collect {
    fn on_frame(&mut self, frame: &[u8]) -> Result<(), EndpointError> {
        self.0.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}
