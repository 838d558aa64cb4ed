//! `eth-emu` — Ethernet/IPv4/TCP/UDP endpoint emulation over a word bus.
//!
//! A hardware simulation exposes its network ports as fixed-width word
//! channels. This crate plays the other end of those channels: it replays
//! or generates stimulus frames, captures what the device emits, and runs
//! just enough TCP (three-way handshake, per-segment ACKs) to keep the
//! device's TCP engine talking.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────┐ frames ┌──────────────────────────────┐ words ┌──────────┐
//!  │ Stimulus  │───────▶│           Endpoint           │──────▶│ WordSink │──▶ device
//!  └───────────┘        │  handshake · ACK loop · UDP  │       └──────────┘
//!  ┌───────────┐ frames │                              │ words ┌────────────┐
//!  │ReceiveHook│◀───────│  (frame rewriter, segmenter) │◀──────│ WordSource │◀── device
//!  └───────────┘        └──────────────┬───────────────┘       └────────────┘
//!                                      │ start()
//!                              ┌───────▼────────┐
//!                              │ RunningEndpoint│  outbound + inbound tasks
//!                              └────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`stream`]    — frame ⇄ bus-word segmentation
//! - [`frame`]     — parse, rewrite and build frames with fresh checksums
//! - [`bus`]       — transport traits and the in-process channel bus
//! - [`bridge`]    — socket transport to an external simulator
//! - [`capture`]   — pcap read / append
//! - [`stimulus`]  — capture-backed and procedural frame sources
//! - [`state`]     — connection FSM states
//! - [`endpoint`]  — roles, handshakes and per-duty protocol loops
//! - [`driver`]    — spawn and join endpoint duties, failure policy
//! - [`config`]    — command-line configuration
//! - [`error`]     — crate-wide error type

pub mod bridge;
pub mod bus;
pub mod capture;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod state;
pub mod stimulus;
pub mod stream;

pub use error::EndpointError;
