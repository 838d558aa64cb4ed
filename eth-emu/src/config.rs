//! Command-line configuration for the `eth-emu` binary.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::driver::FailurePolicy;
use crate::endpoint::ReceiveLimit;

/// Ethernet/TCP/UDP endpoint emulation against a hardware simulation.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Input pcap file replayed on both ingress ports.
    #[arg(short = 'i', long)]
    pub input_file: PathBuf,

    /// Output pcap file receiving every frame captured on the egress port.
    #[arg(short = 'o', long)]
    pub output_file: PathBuf,

    /// Number of egress frames to capture (default: until the bus closes).
    #[arg(short = 's', long)]
    pub size: Option<usize>,

    /// Bytes per bus transfer.
    #[arg(long, default_value = "8")]
    pub bus_width: NonZeroUsize,

    /// Address of the simulator bus bridge.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub bridge: String,

    /// Ethernet interface name used in channel names.
    #[arg(long, default_value = "eth0")]
    pub eth_name: String,

    /// Seed for initial sequence numbers and random waits.
    #[arg(long)]
    pub seed: Option<u64>,

    /// What to do when an endpoint fails.
    #[arg(long, value_enum, default_value_t = FailurePolicy::Abort)]
    pub on_failure: FailurePolicy,

    /// File that receives the completion timestamp.
    #[arg(long, default_value = "timestamp.log")]
    pub timestamp_file: PathBuf,
}

impl Cli {
    pub fn receive_limit(&self) -> ReceiveLimit {
        self.size.into()
    }

    /// Seeded RNG when `--seed` is given, OS entropy otherwise.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}
