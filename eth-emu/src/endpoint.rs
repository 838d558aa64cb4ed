//! Endpoint state machine: handshake, receive-ack loop, UDP send/receive.
//!
//! # Architecture
//!
//! ```text
//!                 Endpoint<S, R>
//!   ┌──────────────────────────────────────────────┐
//!   │  Link<S>  (cloned into both duties)          │
//!   │    ├── Arc<tokio Mutex<S>>   word sink       │
//!   │    ├── Arc<Mutex<SequenceState>>  local/peer │
//!   │    └── role, state, flow, bus width          │
//!   │  R               word source (inbound only)  │
//!   │  Stimulus        (outbound only)             │
//!   │  ReceiveHook     (inbound only)              │
//!   └──────────────────────────────────────────────┘
//!        │ outbound duty              ▲ inbound duty
//!        ▼ frames / TCP data          │ frames, ACKs sent back through S
//! ```
//!
//! Both TCP handshakes run on the endpoint before its duties start (see
//! [`crate::driver`]). After that the sequence state is the only thing the
//! two duties share, and every read-modify-write of it happens under one
//! short lock that never spans an `.await`.
//!
//! Sequence arithmetic wraps modulo 2^32 everywhere.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use etherparse::TcpHeader;
use rand::Rng;

use crate::bus::{TransportError, WordSink, WordSource};
use crate::capture::{CaptureError, CaptureWriter};
use crate::error::EndpointError;
use crate::frame::{self, flags, Addressing, Frame, Rewrite};
use crate::state::ConnectionState;
use crate::stimulus::Stimulus;
use crate::stream::{self, DEFAULT_BUS_WIDTH};

// ---------------------------------------------------------------------------
// Roles and duties
// ---------------------------------------------------------------------------

/// Protocol role of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Feeds UDP frames into the device.
    UdpTransmitter,
    /// Collects UDP frames from the device.
    UdpReceiver,
    /// Opens a TCP connection to the device and sends data on it.
    TcpActive,
    /// Accepts a TCP connection from the device and acknowledges its data.
    TcpPassive,
}

impl Role {
    pub fn is_tcp(self) -> bool {
        matches!(self, Self::TcpActive | Self::TcpPassive)
    }

    /// `true` for roles that drive the testbench → device data path.
    pub fn feeds_device(self) -> bool {
        matches!(self, Self::UdpTransmitter | Self::TcpActive)
    }

    /// Bus channel names for this role on `eth`, port `port`.
    ///
    /// The device reads `{eth}_rx{port}_axis` and writes `{eth}_tx{port}_axis`
    /// on the data path it owns; an endpoint feeding the device writes the
    /// former, an endpoint collecting from it reads the former.
    pub fn channel_names(self, eth: &str, port: u16) -> ChannelNames {
        let rx = format!("{eth}_rx{port}_axis");
        let tx = format!("{eth}_tx{port}_axis");
        if self.feeds_device() {
            ChannelNames { write: rx, read: tx }
        } else {
            ChannelNames { write: tx, read: rx }
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UdpTransmitter => "UDP transmitter",
            Self::UdpReceiver => "UDP receiver",
            Self::TcpActive => "TCP active",
            Self::TcpPassive => "TCP passive",
        };
        f.write_str(name)
    }
}

/// Names of the two bus channels an endpoint is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    /// Channel the endpoint writes words to.
    pub write: String,
    /// Channel the endpoint reads words from.
    pub read: String,
}

/// One of the two concurrent tasks of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duty {
    Outbound,
    Inbound,
}

impl fmt::Display for Duty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        })
    }
}

/// How many frames the inbound duty takes before it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveLimit {
    Exactly(usize),
    /// Until the source closes between frames.
    #[default]
    Unbounded,
}

impl ReceiveLimit {
    fn reached(self, received: usize) -> bool {
        match self {
            Self::Exactly(n) => received >= n,
            Self::Unbounded => false,
        }
    }

    fn progress(self, received: usize) -> String {
        match self {
            Self::Exactly(n) => format!(
                "#{received}/{n} ({:.2} %)",
                received as f64 / n as f64 * 100.0
            ),
            Self::Unbounded => format!("#{received}"),
        }
    }
}

impl From<Option<usize>> for ReceiveLimit {
    fn from(n: Option<usize>) -> Self {
        n.map_or(Self::Unbounded, Self::Exactly)
    }
}

/// TCP sequence numbers of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceState {
    /// Next sequence number this endpoint sends.
    pub local: u32,
    /// Next sequence number expected from the device.
    pub peer: u32,
}

/// Acknowledgment number for a segment starting at `seq` carrying
/// `payload_len` bytes.
pub fn ack_number(seq: u32, payload_len: usize) -> u32 {
    // Truncation is reduction mod 2^32.
    seq.wrapping_add(payload_len as u32)
}

// ---------------------------------------------------------------------------
// Receive hooks
// ---------------------------------------------------------------------------

/// Called by the inbound duty with every received frame, in arrival order.
pub trait ReceiveHook: Send + 'static {
    fn on_frame(&mut self, frame: &[u8]) -> Result<(), EndpointError>;
}

/// Drops every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl ReceiveHook for Discard {
    fn on_frame(&mut self, _frame: &[u8]) -> Result<(), EndpointError> {
        Ok(())
    }
}

/// Appends every frame to a capture file.
#[derive(Debug)]
pub struct CaptureHook {
    writer: CaptureWriter,
}

impl CaptureHook {
    pub fn append(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        Ok(Self {
            writer: CaptureWriter::append(path)?,
        })
    }

    /// Frames written so far.
    pub fn written(&self) -> usize {
        self.writer.written()
    }
}

impl ReceiveHook for CaptureHook {
    fn on_frame(&mut self, frame: &[u8]) -> Result<(), EndpointError> {
        self.writer.write_frame(frame)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static description of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub eth_name: String,
    pub port: u16,
    pub role: Role,
    pub bus_width: NonZeroUsize,
    pub receive_limit: ReceiveLimit,
}

impl EndpointConfig {
    /// Defaults: 8-byte bus, unbounded receive.
    pub fn new(eth_name: impl Into<String>, port: u16, role: Role) -> Self {
        Self {
            eth_name: eth_name.into(),
            port,
            role,
            bus_width: DEFAULT_BUS_WIDTH,
            receive_limit: ReceiveLimit::Unbounded,
        }
    }

    pub fn with_bus_width(mut self, bus_width: NonZeroUsize) -> Self {
        self.bus_width = bus_width;
        self
    }

    pub fn with_receive_limit(mut self, limit: impl Into<ReceiveLimit>) -> Self {
        self.receive_limit = limit.into();
        self
    }

    /// Display name, `"{eth}:{port}"`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.eth_name, self.port)
    }

    pub fn channel_names(&self) -> ChannelNames {
        self.role.channel_names(&self.eth_name, self.port)
    }
}

// ---------------------------------------------------------------------------
// Link: state shared by both duties
// ---------------------------------------------------------------------------

pub(crate) struct Link<S> {
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) bus_width: NonZeroUsize,
    pub(crate) state: ConnectionState,
    /// Local → device addressing, known once the handshake completes.
    pub(crate) flow: Option<Addressing>,
    pub(crate) sink: Arc<tokio::sync::Mutex<S>>,
    pub(crate) sequence: Arc<Mutex<SequenceState>>,
}

impl<S> Clone for Link<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            role: self.role,
            bus_width: self.bus_width,
            state: self.state,
            flow: self.flow,
            sink: Arc::clone(&self.sink),
            sequence: Arc::clone(&self.sequence),
        }
    }
}

impl<S: WordSink> Link<S> {
    fn sequence(&self) -> MutexGuard<'_, SequenceState> {
        self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write one whole frame; words of concurrent senders never interleave.
    async fn send(&self, frame: &[u8]) -> Result<usize, EndpointError> {
        let mut sink = self.sink.lock().await;
        stream::transmit_frame(&mut *sink, frame, self.bus_width).await
    }

    fn require_established(&self, operation: &'static str) -> Result<(), EndpointError> {
        if self.state.is_established() {
            Ok(())
        } else {
            Err(EndpointError::NotEstablished {
                state: self.state,
                operation,
            })
        }
    }
}

fn expect_tcp(bytes: &[u8], step: &str) -> Result<(Frame, TcpHeader), EndpointError> {
    let frame = Frame::parse(bytes)
        .map_err(|e| EndpointError::Protocol(format!("{step}: frame does not parse: {e}")))?;
    let tcp = frame
        .tcp()
        .cloned()
        .ok_or_else(|| EndpointError::Protocol(format!("{step}: frame is not a TCP segment")))?;
    Ok((frame, tcp))
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One emulated protocol participant bound to a sink/source channel pair.
pub struct Endpoint<S, R> {
    pub(crate) link: Link<S>,
    pub(crate) source: R,
    pub(crate) receive_limit: ReceiveLimit,
    pub(crate) stimulus: Stimulus,
    pub(crate) hook: Box<dyn ReceiveHook>,
}

impl<S, R> Endpoint<S, R>
where
    S: WordSink,
    R: WordSource,
{
    /// Create an endpoint. TCP roles draw their initial sequence number
    /// from `rng`.
    pub fn new(config: EndpointConfig, sink: S, source: R, rng: &mut impl Rng) -> Self {
        let name = config.name();
        let (state, sequence) = if config.role.is_tcp() {
            let isn: u32 = rng.random();
            log::info!("+++ Creating TCP endpoint {name} ({}) +++", config.role);
            (
                ConnectionState::Closed,
                SequenceState {
                    local: isn,
                    peer: 0,
                },
            )
        } else {
            log::info!("+++ Creating UDP endpoint {name} ({}) +++", config.role);
            (ConnectionState::Established, SequenceState::default())
        };

        Self {
            link: Link {
                name,
                role: config.role,
                bus_width: config.bus_width,
                state,
                flow: None,
                sink: Arc::new(tokio::sync::Mutex::new(sink)),
                sequence: Arc::new(Mutex::new(sequence)),
            },
            source,
            receive_limit: config.receive_limit,
            stimulus: Stimulus::none(),
            hook: Box::new(Discard),
        }
    }

    pub fn with_stimulus(mut self, stimulus: impl Into<Stimulus>) -> Self {
        self.stimulus = stimulus.into();
        self
    }

    pub fn with_hook(mut self, hook: impl ReceiveHook) -> Self {
        self.hook = Box::new(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.link.name
    }

    pub fn role(&self) -> Role {
        self.link.role
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state
    }

    /// UDP endpoints are always ready; TCP ones once established.
    pub fn is_ready(&self) -> bool {
        self.link.state.is_established()
    }

    /// Snapshot of the sequence numbers.
    pub fn sequence(&self) -> SequenceState {
        *self.link.sequence()
    }

    /// Local → device addressing learned or chosen during the handshake.
    pub fn flow(&self) -> Option<Addressing> {
        self.link.flow
    }

    pub fn receive_limit(&self) -> ReceiveLimit {
        self.receive_limit
    }

    fn require_role(&self, operation: &'static str, expected: Role) -> Result<(), EndpointError> {
        if self.link.role == expected {
            Ok(())
        } else {
            Err(EndpointError::WrongRole {
                operation,
                expected,
                actual: self.link.role,
            })
        }
    }

    fn require_closed(&self, operation: &str) -> Result<(), EndpointError> {
        if self.link.state == ConnectionState::Closed {
            Ok(())
        } else {
            Err(EndpointError::Protocol(format!(
                "{operation} called in state {}",
                self.link.state
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Handshakes
    // -----------------------------------------------------------------------

    /// Passive open: wait for the device's SYN, answer SYN-ACK, take the
    /// final ACK.
    pub async fn accept_connection(&mut self) -> Result<(), EndpointError> {
        self.require_role("accept_connection", Role::TcpPassive)?;
        self.require_closed("accept_connection")?;
        let name = self.link.name.clone();
        log::info!("[{name}] setting up connection...");

        let bytes = stream::receive_frame(&mut self.source, self.link.bus_width)
            .await?
            .ok_or_else(|| EndpointError::HandshakeFailed("bus closed before SYN".into()))?;
        let (syn, tcp) = expect_tcp(&bytes, "expected SYN")?;
        let bits = frame::tcp_flag_bits(&tcp);
        if bits & flags::SYN == 0 || bits & flags::ACK != 0 {
            log::error!("[{name}] received message is not a SYN (flags {bits:#04x})");
            return Err(EndpointError::Protocol(format!(
                "expected SYN, got TCP flags {bits:#04x}"
            )));
        }
        let syn_seq = tcp.sequence_number;
        log::info!("[{name}] ← SYN seq={syn_seq}");
        self.link.state = ConnectionState::SynReceived;

        let flow = Addressing::reply_to(&syn);
        let peer = syn_seq.wrapping_add(1);
        let local = self.link.sequence().local;
        let syn_ack = frame::build_tcp(&flow, local, peer, flags::SYN | flags::ACK, &[])?;
        log::info!("[{name}] → SYN-ACK seq={local} ack={peer}");
        self.link.send(&syn_ack).await?;
        {
            let mut seq = self.link.sequence();
            seq.local = seq.local.wrapping_add(1);
            seq.peer = peer;
        }

        // The final ACK is taken as-is.
        match stream::receive_frame(&mut self.source, self.link.bus_width).await? {
            Some(_) => log::debug!("[{name}] ← ACK"),
            None => {
                return Err(EndpointError::HandshakeFailed(
                    "bus closed before final ACK".into(),
                ))
            }
        }

        self.link.flow = Some(flow);
        self.link.state = ConnectionState::Established;
        log::info!("[{name}] connection established!");
        Ok(())
    }

    /// Active open toward the device described by `flow`.
    pub async fn initiate_connection(&mut self, flow: Addressing) -> Result<(), EndpointError> {
        self.require_role("initiate_connection", Role::TcpActive)?;
        self.require_closed("initiate_connection")?;
        let name = self.link.name.clone();

        let isn = self.link.sequence().local;
        let syn = frame::build_tcp(&flow, isn, 0, flags::SYN, &[])?;
        log::info!("[{name}] → SYN seq={isn}");
        self.link.send(&syn).await?;
        self.link.state = ConnectionState::SynSent;

        let bytes = stream::receive_frame(&mut self.source, self.link.bus_width)
            .await?
            .ok_or_else(|| EndpointError::HandshakeFailed("bus closed before SYN-ACK".into()))?;
        let (_, tcp) = expect_tcp(&bytes, "expected SYN-ACK")?;
        let bits = frame::tcp_flag_bits(&tcp);
        let (peer_isn, acked) = (tcp.sequence_number, tcp.acknowledgment_number);
        let want = isn.wrapping_add(1);
        if bits & (flags::SYN | flags::ACK) != flags::SYN | flags::ACK {
            log::error!("[{name}] received message is not a SYN-ACK (flags {bits:#04x})");
            return Err(EndpointError::HandshakeFailed(format!(
                "expected SYN-ACK, got TCP flags {bits:#04x}"
            )));
        }
        if acked != want {
            log::error!("[{name}] SYN-ACK acknowledges {acked}, expected {want}");
            return Err(EndpointError::HandshakeFailed(format!(
                "SYN-ACK acknowledges {acked}, expected {want}"
            )));
        }
        log::info!("[{name}] ← SYN-ACK seq={peer_isn} ack={acked}");

        let peer = peer_isn.wrapping_add(1);
        let ack = frame::build_tcp(&flow, isn, peer, flags::ACK, &[])?;
        log::info!("[{name}] → ACK seq={isn} ack={peer}");
        self.link.send(&ack).await?;
        {
            let mut seq = self.link.sequence();
            seq.local = want;
            seq.peer = peer;
        }

        self.link.flow = Some(flow);
        self.link.state = ConnectionState::Established;
        log::info!("[{name}] connection established!");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Duties, run in place
    // -----------------------------------------------------------------------

    /// Run the outbound duty to completion on the current task. Returns the
    /// number of frames sent.
    pub async fn run_outbound(&mut self) -> Result<usize, EndpointError> {
        outbound_duty(&self.link, &mut self.stimulus).await
    }

    /// Run the inbound duty to completion on the current task. Returns the
    /// number of frames received.
    pub async fn run_inbound(&mut self) -> Result<usize, EndpointError> {
        inbound_duty(
            &self.link,
            &mut self.source,
            self.receive_limit,
            self.hook.as_mut(),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Duty bodies
// ---------------------------------------------------------------------------

pub(crate) async fn outbound_duty<S: WordSink>(
    link: &Link<S>,
    stimulus: &mut Stimulus,
) -> Result<usize, EndpointError> {
    match link.role {
        Role::TcpPassive => Err(EndpointError::UnsupportedDuty {
            role: link.role,
            duty: Duty::Outbound,
        }),
        Role::TcpActive => send_tcp_data(link, stimulus).await,
        Role::UdpTransmitter | Role::UdpReceiver => send_udp(link, stimulus).await,
    }
}

async fn send_udp<S: WordSink>(
    link: &Link<S>,
    stimulus: &mut Stimulus,
) -> Result<usize, EndpointError> {
    let name = &link.name;
    let total = stimulus.total();
    log::info!("[{name}] UDP send duty starting.");
    for index in 0..total {
        let frame = stimulus.next().await?;
        log::info!(
            "[{name}] sending UDP packet {} / {total} (len = {})",
            index + 1,
            frame.len()
        );
        link.send(&frame).await?;
    }
    log::info!("[{name}] UDP send duty finishing.");
    Ok(total)
}

async fn send_tcp_data<S: WordSink>(
    link: &Link<S>,
    stimulus: &mut Stimulus,
) -> Result<usize, EndpointError> {
    let name = &link.name;
    link.require_established("TCP send")?;
    let flow = link.flow.ok_or_else(|| {
        EndpointError::Protocol("established connection has no addressing".into())
    })?;
    let total = stimulus.total();
    log::info!("[{name}] TCP send duty starting.");

    for index in 0..total {
        let bytes = stimulus.next().await?;
        let (segment, _) = expect_tcp(&bytes, "TCP stimulus")?;
        let len = segment.payload_len();
        let (seq, ack) = {
            let mut state = link.sequence();
            let reserved = (state.local, state.peer);
            state.local = ack_number(state.local, len);
            reserved
        };
        let changes = Rewrite {
            seq: Some(seq),
            ack: Some(ack),
            flags: Some(flags::ACK | flags::PSH),
            ..Rewrite::addressed(&flow)
        };
        let out = frame::rewrite(&segment, &changes)?;
        log::debug!("[{name}] → DATA seq={seq} ack={ack} len={len}");
        link.send(&out).await?;
        log::info!("[{name}] sent TCP segment {} / {total}", index + 1);
    }

    log::info!("[{name}] TCP send duty finishing.");
    Ok(total)
}

pub(crate) async fn inbound_duty<S, R>(
    link: &Link<S>,
    source: &mut R,
    limit: ReceiveLimit,
    hook: &mut dyn ReceiveHook,
) -> Result<usize, EndpointError>
where
    S: WordSink,
    R: WordSource,
{
    let name = &link.name;
    let proto = if link.role.is_tcp() { "TCP" } else { "UDP" };
    if link.role.is_tcp() {
        link.require_established("TCP receive")?;
    }
    log::info!("[{name}] {proto} receive duty starting.");

    let mut received = 0;
    while !limit.reached(received) {
        let Some(bytes) = stream::receive_frame(source, link.bus_width).await? else {
            match limit {
                ReceiveLimit::Unbounded => break,
                ReceiveLimit::Exactly(_) => return Err(TransportError::Closed.into()),
            }
        };
        if link.role.is_tcp() {
            let reply = acknowledge(link, &bytes, hook)?;
            link.send(&reply).await?;
        } else {
            if let Err(e) = Frame::parse(&bytes) {
                log::warn!("[{name}] received frame does not parse: {e}");
            }
            hook.on_frame(&bytes)?;
        }
        received += 1;
        log::info!(
            "[{name}] {proto} receive duty got packet {}",
            limit.progress(received)
        );
    }

    log::info!("[{name}] {proto} receive duty finishing.");
    Ok(received)
}

/// Hand a received segment to the hook and build the pure ACK answering
/// it. `peer` moves to the acknowledged number; `local` is left alone.
fn acknowledge<S: WordSink>(
    link: &Link<S>,
    bytes: &[u8],
    hook: &mut dyn ReceiveHook,
) -> Result<Vec<u8>, EndpointError> {
    let (segment, tcp) = expect_tcp(bytes, "TCP receive")?;
    hook.on_frame(bytes)?;

    let ack = ack_number(tcp.sequence_number, segment.payload_len());
    log::debug!(
        "[{}] ← DATA seq={} len={} pad={}",
        link.name,
        tcp.sequence_number,
        segment.payload_len(),
        segment.padding.len()
    );
    let local = {
        let mut state = link.sequence();
        state.peer = ack;
        state.local
    };
    log::debug!("[{}] → ACK seq={local} ack={ack}", link.name);
    Ok(frame::build_tcp(
        &Addressing::reply_to(&segment),
        local,
        ack,
        flags::ACK,
        &[],
    )?)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
