//! Entry point for `eth-emu`.
//!
//! Wires the emulation topology: the input capture is replayed on two UDP
//! ingress ports while a passive TCP endpoint on the egress port accepts the
//! device's connection and captures everything it sends. `main.rs` owns only
//! process setup (logging, arguments, topology, completion record).

use std::io::Write;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;

use eth_emu::bridge::{SocketSink, SocketSource};
use eth_emu::config::Cli;
use eth_emu::driver::{self, RunningEndpoint};
use eth_emu::endpoint::{CaptureHook, Endpoint, EndpointConfig, ReceiveLimit, Role};
use eth_emu::stimulus::CaptureStimulus;

const INGRESS_PORT_A: u16 = 0;
const EGRESS_PORT: u16 = 1;
const INGRESS_PORT_B: u16 = 2;

type BridgeEndpoint = Endpoint<SocketSink, SocketSource>;

async fn connect(
    cli: &Cli,
    config: EndpointConfig,
    rng: &mut StdRng,
) -> anyhow::Result<BridgeEndpoint> {
    let channels = config.channel_names();
    let sink = SocketSink::connect(cli.bridge.as_str(), &channels.write)
        .await
        .with_context(|| format!("opening {} on {}", channels.write, cli.bridge))?;
    let source = SocketSource::connect(cli.bridge.as_str(), &channels.read)
        .await
        .with_context(|| format!("opening {} on {}", channels.read, cli.bridge))?;
    Ok(Endpoint::new(config, sink, source, rng))
}

async fn ingress(cli: &Cli, port: u16, rng: &mut StdRng) -> anyhow::Result<BridgeEndpoint> {
    let stimulus = CaptureStimulus::from_file(&cli.input_file)
        .with_context(|| format!("reading {}", cli.input_file.display()))?;
    let config = EndpointConfig::new(&cli.eth_name, port, Role::UdpTransmitter)
        .with_bus_width(cli.bus_width)
        .with_receive_limit(ReceiveLimit::Exactly(0));
    Ok(connect(cli, config, rng).await?.with_stimulus(stimulus))
}

async fn egress(cli: &Cli, rng: &mut StdRng) -> anyhow::Result<BridgeEndpoint> {
    let hook = CaptureHook::append(&cli.output_file)
        .with_context(|| format!("opening {}", cli.output_file.display()))?;
    let config = EndpointConfig::new(&cli.eth_name, EGRESS_PORT, Role::TcpPassive)
        .with_bus_width(cli.bus_width)
        .with_receive_limit(cli.receive_limit());
    Ok(connect(cli, config, rng).await?.with_hook(hook))
}

fn write_timestamp(cli: &Cli) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(&cli.timestamp_file)
        .with_context(|| format!("creating {}", cli.timestamp_file.display()))?;
    writeln!(file, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log at info unless RUST_LOG says otherwise.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut rng = cli.rng();

    let in_a = ingress(&cli, INGRESS_PORT_A, &mut rng).await?;
    let in_b = ingress(&cli, INGRESS_PORT_B, &mut rng).await?;
    let mut out = egress(&cli, &mut rng).await?;

    out.accept_connection()
        .await
        .context("passive TCP connection on the egress port")?;

    log::info!("Starting endpoints...");
    let running: Vec<RunningEndpoint<_, _>> = vec![in_a.start(), in_b.start(), out.start()];
    let reports = driver::join_all(running, cli.on_failure).await?;
    for report in &reports {
        log::debug!("{report:?}");
    }

    write_timestamp(&cli)?;
    log::info!("Emulation finished!");
    Ok(())
}
