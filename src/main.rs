use anyhow::Context;
use cebridge::bridge::Bridge;
use cebridge::cb_info;
use cebridge::config::BridgeConfig;
use cebridge::host::{self, HostKind};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (default: ~/.config/cebridge/config.toml)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Endpoint to listen on: host:port, tcp:host:port or unix:/path
    #[clap(short, long, env = "CEBRIDGE_LISTEN")]
    listen: Option<String>,

    /// Number of hardware breakpoint slots
    #[clap(long)]
    hw_slots: Option<usize>,

    /// Introspection host
    #[clap(long, value_enum, default_value_t = HostKind::Sim)]
    host: HostKind,

    /// Target process of the procfs host
    #[clap(short, long, env = "CEBRIDGE_PID")]
    pid: Option<i32>,

    /// Mute bridge log output
    #[clap(short, long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if args.quiet {
        cebridge::log::disable();
    }

    let mut config = BridgeConfig::from_file(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(slots) = args.hw_slots {
        anyhow::ensure!(slots > 0, "--hw-slots must be positive");
        config.hardware_slots = slots;
    }
    config.endpoint()?;

    let provider = host::open(args.host, args.pid).context("open introspection host")?;
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("install signal handlers")?;

    let mut bridge = Bridge::new(provider, config);
    bridge.start()?;

    if let Some(signal) = signals.forever().next() {
        cb_info!("signal {signal} received, shutting down");
    }
    bridge.stop();
    Ok(())
}
