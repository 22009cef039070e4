//! meterlink CLI - The `meterlink` command.
//!
//! Runs a simulated meter engine, or connects to one and prints live
//! levels for a source.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meterlink_core::{
    serve_tcp, stop_all_workers, Config, Connection, EventLoop, MeterConfig, MeterLevels,
    RemoteMeter, Service, SimulatedEngine, SourceId, StreamChannel,
};

/// How often the host loop checks for Ctrl-C and the deadline.
const TICK: Duration = Duration::from_millis(100);

/// meterlink - Remote volume meters
#[derive(Parser, Debug)]
#[command(name = "meterlink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Poll remote audio meters and print their levels", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.config/meterlink/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a default configuration file
    Init,

    /// Show the configuration file path
    ConfigPath,

    /// Serve a simulated engine over TCP
    Engine {
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,

        /// Channels per simulated source
        #[arg(long)]
        channels: Option<usize>,

        /// Number of sources, with ids starting at 1
        #[arg(long, default_value = "1")]
        sources: u64,
    },

    /// Connect to an engine and print levels of one source
    Watch {
        /// Engine address
        #[arg(long)]
        connect: Option<String>,

        /// Source id to attach the meter to
        #[arg(long)]
        source: u64,

        /// Update interval in milliseconds
        #[arg(long)]
        interval: Option<u32>,

        /// Stop after this long (e.g. "10s", "1m")
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Print levels from an in-process simulated engine
    Demo {
        /// Update interval in milliseconds
        #[arg(long)]
        interval: Option<u32>,

        /// Stop after this long
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        duration: Duration,

        /// Channels of the simulated source
        #[arg(long)]
        channels: Option<usize>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(),
    };

    match args.command {
        Commands::Init => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            Ok(())
        }
        Commands::ConfigPath => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Engine {
            listen,
            channels,
            sources,
        } => run_engine(
            &listen.unwrap_or(config.engine.listen),
            channels.unwrap_or(config.engine.channels),
            sources,
            config.meter.update_interval_ms,
        ),
        Commands::Watch {
            connect,
            source,
            interval,
            duration,
        } => {
            let address = connect.unwrap_or(config.connection.address.clone());
            let channel = StreamChannel::connect_tcp(&address)
                .with_context(|| format!("Failed to connect to engine at {}", address))?;
            log::info!("Connected to engine at {}", address);
            let connection = Connection::with_channel(Arc::new(channel));
            watch(
                &connection,
                SourceId(source),
                &config,
                interval,
                duration,
            )
        }
        Commands::Demo {
            interval,
            duration,
            channels,
        } => {
            let engine = SimulatedEngine::new();
            engine.add_source(SourceId(1), channels.unwrap_or(config.engine.channels));
            let connection = Connection::with_channel(Arc::new(engine));
            watch(&connection, SourceId(1), &config, interval, Some(duration))
        }
    }
}

fn run_engine(listen: &str, channels: usize, sources: u64, interval_ms: u32) -> Result<()> {
    let engine = SimulatedEngine::with_default_interval(interval_ms);
    for id in 1..=sources {
        engine.add_source(SourceId(id), channels);
    }
    let listener =
        TcpListener::bind(listen).with_context(|| format!("Failed to listen on {}", listen))?;
    log::info!(
        "Simulated engine listening on {} ({} sources, {} channels each)",
        listener.local_addr()?,
        sources,
        channels
    );
    let service: Arc<dyn Service> = Arc::new(engine);
    serve_tcp(listener, service).context("Engine stopped")?;
    Ok(())
}

fn watch(
    connection: &Connection,
    source: SourceId,
    config: &Config,
    interval: Option<u32>,
    duration: Option<Duration>,
) -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, interrupted.clone())
        .context("Failed to install Ctrl-C handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, interrupted.clone())
        .context("Failed to install SIGTERM handler")?;

    let host = EventLoop::new();
    let mut meter = RemoteMeter::create(connection, MeterConfig::new(config.meter.fader))
        .context("Failed to create meter")?;
    meter.set_update_interval(interval.unwrap_or(config.meter.update_interval_ms));
    meter.attach(source);
    meter
        .add_callback(&host, print_levels)
        .context("Engine refused the meter callback")?;
    log::info!(
        "Watching source {} with {} (every {} ms, Ctrl-C to stop)",
        source.as_u64(),
        meter.id(),
        meter.cached_update_interval()
    );

    let deadline = duration.map(|d| Instant::now() + d);
    loop {
        if interrupted.load(Ordering::SeqCst) {
            log::info!("Interrupted, stopping workers");
            stop_all_workers();
            break;
        }
        let tick = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                TICK.min(deadline - now)
            }
            None => TICK,
        };
        host.run_for(tick);
    }

    if let Err(e) = meter.remove_callback(&host) {
        log::warn!("Failed to unregister callback: {}", e);
    }
    meter.detach();
    if meter.is_stale() {
        log::warn!("Source {} was unavailable at exit", source.as_u64());
    }
    let stats = meter.worker_stats();
    log::info!(
        "{} cycles, {} readings delivered, {} empty",
        stats.cycles,
        stats.delivered,
        stats.empty
    );
    Ok(())
}

fn print_levels(levels: MeterLevels) {
    if levels.is_empty() {
        println!("(no channels)");
        return;
    }
    let line: Vec<String> = levels
        .iter()
        .enumerate()
        .map(|(ch, level)| {
            format!(
                "ch{} {:>6.1} dB (peak {:>6.1}, in {:>6.1})",
                ch, level.magnitude, level.peak, level.input_peak
            )
        })
        .collect();
    println!("{}", line.join(" | "));
}
