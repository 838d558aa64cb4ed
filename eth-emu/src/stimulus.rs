//! Stimulus sources: the frames an endpoint's outbound duty transmits.
//!
//! - [`CaptureStimulus`] replays a capture file read once at startup.
//! - [`ProceduralStimulus`] produces frames on demand through a
//!   [`FrameGenerator`], sleeping a random delay before each one.
//!
//! The outbound duty owns its stimulus exclusively; nothing here is shared.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

use crate::capture::{self, CaptureError};
use crate::error::EndpointError;
use crate::frame::{self, Addressing, PacketError};

/// Produces the `index`-th frame of a procedural stimulus.
pub trait FrameGenerator: Send + 'static {
    fn generate(&mut self, index: usize, rng: &mut StdRng) -> Result<Vec<u8>, PacketError>;
}

// ---------------------------------------------------------------------------
// Capture-backed
// ---------------------------------------------------------------------------

/// Frames replayed from memory in order. The cursor only moves forward.
#[derive(Debug, Clone, Default)]
pub struct CaptureStimulus {
    frames: Vec<Vec<u8>>,
    cursor: usize,
}

impl CaptureStimulus {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        Self { frames, cursor: 0 }
    }

    /// Load every frame of the capture at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        Ok(Self::new(capture::read_frames(path)?))
    }

    pub fn total(&self) -> usize {
        self.frames.len()
    }

    /// Frames not yet handed out.
    pub fn remaining(&self) -> usize {
        self.frames.len() - self.cursor
    }

    /// Hand out the next frame.
    pub fn next_frame(&mut self) -> Result<Vec<u8>, EndpointError> {
        let (index, total) = (self.cursor, self.frames.len());
        let frame = self
            .frames
            .get_mut(index)
            .ok_or(EndpointError::ExhaustedStimulus { index, total })?;
        self.cursor += 1;
        Ok(std::mem::take(frame))
    }
}

// ---------------------------------------------------------------------------
// Procedural
// ---------------------------------------------------------------------------

/// A fixed number of generated frames with a random pause before each.
pub struct ProceduralStimulus {
    total: usize,
    produced: usize,
    min_wait_ms: u64,
    max_wait_ms: u64,
    rng: StdRng,
    generator: Box<dyn FrameGenerator>,
}

impl std::fmt::Debug for ProceduralStimulus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProceduralStimulus")
            .field("total", &self.total)
            .field("produced", &self.produced)
            .field("min_wait_ms", &self.min_wait_ms)
            .field("max_wait_ms", &self.max_wait_ms)
            .finish_non_exhaustive()
    }
}

impl ProceduralStimulus {
    /// `min_wait_ms` and `max_wait_ms` may be given in either order.
    pub fn new(
        total: usize,
        min_wait_ms: u64,
        max_wait_ms: u64,
        rng: StdRng,
        generator: impl FrameGenerator,
    ) -> Self {
        Self {
            total,
            produced: 0,
            min_wait_ms: min_wait_ms.min(max_wait_ms),
            max_wait_ms: min_wait_ms.max(max_wait_ms),
            rng,
            generator: Box::new(generator),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Normalised `(min, max)` wait bounds in milliseconds.
    pub fn wait_bounds(&self) -> (u64, u64) {
        (self.min_wait_ms, self.max_wait_ms)
    }

    /// Draw the pause before the next frame, uniformly from `[min, max]`.
    pub fn next_delay(&mut self) -> Duration {
        if self.max_wait_ms == 0 {
            return Duration::ZERO;
        }
        let ms = self.rng.random_range(self.min_wait_ms..=self.max_wait_ms);
        Duration::from_millis(ms)
    }

    /// Wait, then generate the next frame.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, EndpointError> {
        if self.produced >= self.total {
            return Err(EndpointError::ExhaustedStimulus {
                index: self.produced,
                total: self.total,
            });
        }
        let delay = self.next_delay();
        if !delay.is_zero() {
            log::trace!("stimulus pause {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
        let frame = self.generator.generate(self.produced, &mut self.rng)?;
        self.produced += 1;
        Ok(frame)
    }
}

// ---------------------------------------------------------------------------
// Stimulus
// ---------------------------------------------------------------------------

/// Source of outbound frames for one endpoint.
#[derive(Debug)]
pub enum Stimulus {
    Capture(CaptureStimulus),
    Procedural(ProceduralStimulus),
}

impl Stimulus {
    /// A stimulus with no frames.
    pub fn none() -> Self {
        Self::Capture(CaptureStimulus::default())
    }

    /// Number of frames this stimulus yields in total.
    pub fn total(&self) -> usize {
        match self {
            Self::Capture(s) => s.total(),
            Self::Procedural(s) => s.total(),
        }
    }

    pub async fn next(&mut self) -> Result<Vec<u8>, EndpointError> {
        match self {
            Self::Capture(s) => s.next_frame(),
            Self::Procedural(s) => s.next_frame().await,
        }
    }
}

impl Default for Stimulus {
    fn default() -> Self {
        Self::none()
    }
}

impl From<CaptureStimulus> for Stimulus {
    fn from(s: CaptureStimulus) -> Self {
        Self::Capture(s)
    }
}

impl From<ProceduralStimulus> for Stimulus {
    fn from(s: ProceduralStimulus) -> Self {
        Self::Procedural(s)
    }
}

// ---------------------------------------------------------------------------
// UDP generator
// ---------------------------------------------------------------------------

/// Default source addressing for generated UDP frames.
pub const DEFAULT_SOURCE_MAC: [u8; 6] = [0x05; 6];
pub const DEFAULT_SOURCE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
pub const DEFAULT_SOURCE_PORT: u16 = 10_000;

type PayloadFn = Box<dyn FnMut(usize, &mut StdRng) -> Vec<u8> + Send>;

/// Wraps payloads from a closure into UDP frames toward a fixed destination.
pub struct UdpPayloadGenerator {
    addressing: Addressing,
    payload: PayloadFn,
}

impl UdpPayloadGenerator {
    pub fn new<F>(
        destination_mac: [u8; 6],
        destination_ip: Ipv4Addr,
        destination_port: u16,
        payload: F,
    ) -> Self
    where
        F: FnMut(usize, &mut StdRng) -> Vec<u8> + Send + 'static,
    {
        Self {
            addressing: Addressing {
                source_mac: DEFAULT_SOURCE_MAC,
                destination_mac,
                source_ip: DEFAULT_SOURCE_IP,
                destination_ip,
                source_port: DEFAULT_SOURCE_PORT,
                destination_port,
            },
            payload: Box::new(payload),
        }
    }

    /// Override the default source addressing.
    pub fn with_source(mut self, mac: [u8; 6], ip: Ipv4Addr, port: u16) -> Self {
        self.addressing.source_mac = mac;
        self.addressing.source_ip = ip;
        self.addressing.source_port = port;
        self
    }

    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }
}

impl FrameGenerator for UdpPayloadGenerator {
    fn generate(&mut self, index: usize, rng: &mut StdRng) -> Result<Vec<u8>, PacketError> {
        let payload = (self.payload)(index, rng);
        frame::build_udp(&self.addressing, &payload)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use rand::SeedableRng;

    struct Counter;

    impl FrameGenerator for Counter {
        fn generate(&mut self, index: usize, _rng: &mut StdRng) -> Result<Vec<u8>, PacketError> {
            Ok(vec![index as u8])
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn capture_cursor_advances_then_exhausts() {
        let mut s = CaptureStimulus::new(vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(s.next_frame().unwrap(), b"a");
        assert_eq!(s.remaining(), 1);
        assert_eq!(s.next_frame().unwrap(), b"b");
        assert!(matches!(
            s.next_frame(),
            Err(EndpointError::ExhaustedStimulus { index: 2, total: 2 })
        ));
    }

    #[tokio::test]
    async fn empty_stimulus_has_no_frames() {
        let mut s = Stimulus::none();
        assert_eq!(s.total(), 0);
        assert!(matches!(
            s.next().await,
            Err(EndpointError::ExhaustedStimulus { index: 0, total: 0 })
        ));
    }

    #[test]
    fn wait_bounds_are_normalised() {
        let s = ProceduralStimulus::new(1, 50, 10, rng(), Counter);
        assert_eq!(s.wait_bounds(), (10, 50));
    }

    #[test]
    fn delay_stays_within_bounds() {
        let mut s = ProceduralStimulus::new(1, 20, 5, rng(), Counter);
        for _ in 0..200 {
            let d = s.next_delay().as_millis();
            assert!((5..=20).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn equal_bounds_wait_exactly() {
        let mut zero = ProceduralStimulus::new(1, 0, 0, rng(), Counter);
        assert_eq!(zero.next_delay(), Duration::ZERO);
        let mut fixed = ProceduralStimulus::new(1, 3, 3, rng(), Counter);
        assert_eq!(fixed.next_delay(), Duration::from_millis(3));
    }

    #[tokio::test(start_paused = true)]
    async fn procedural_sleeps_before_each_frame() {
        let mut s = ProceduralStimulus::new(2, 100, 100, rng(), Counter);
        let start = tokio::time::Instant::now();
        assert_eq!(s.next_frame().await.unwrap(), vec![0]);
        assert_eq!(s.next_frame().await.unwrap(), vec![1]);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_millis(210), "waited {elapsed:?}");
        assert!(matches!(
            s.next_frame().await,
            Err(EndpointError::ExhaustedStimulus { index: 2, total: 2 })
        ));
    }

    #[test]
    fn udp_generator_uses_default_source() {
        let mut g = UdpPayloadGenerator::new(
            [0x02, 0, 0, 0, 0, 0x10],
            Ipv4Addr::new(192, 168, 0, 10),
            5000,
            |i, _| format!("msg {i}").into_bytes(),
        );
        let bytes = g.generate(3, &mut rng()).unwrap();
        let frame = Frame::parse(&bytes).unwrap();
        let udp = frame.udp().unwrap();
        assert_eq!(frame.ethernet.source, DEFAULT_SOURCE_MAC);
        assert_eq!(frame.source_ip(), DEFAULT_SOURCE_IP);
        assert_eq!(udp.source_port, DEFAULT_SOURCE_PORT);
        assert_eq!(udp.destination_port, 5000);
        assert_eq!(frame.payload, b"msg 3");
    }

    #[test]
    fn udp_generator_source_override() {
        let g = UdpPayloadGenerator::new([0; 6], Ipv4Addr::LOCALHOST, 1, |_, _| vec![1])
            .with_source([0x0a; 6], Ipv4Addr::new(10, 0, 0, 1), 4242);
        assert_eq!(g.addressing().source_port, 4242);
        assert_eq!(g.addressing().source_ip, Ipv4Addr::new(10, 0, 0, 1));
    }
}
