//! Command-line interface for the IoT sensor fleet simulator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use iotsim_core::config::{defaults, env_vars};
use iotsim_core::probe::check_broker;
use iotsim_core::{
    Assignment, MemoryBroker, MqttTransport, RunMode, Simulation, SimulationConfig, Transport,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// IoT sensor fleet simulator - load-test an MQTT broker with simulated devices.
#[derive(Parser, Debug)]
#[command(name = "iotsim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to `<DIR>/iotsim.log`.
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a simulation.
    Run(RunArgs),
    /// Check that the broker accepts connections.
    Probe {
        /// Broker host.
        #[arg(long)]
        broker: Option<String>,
        /// Broker port.
        #[arg(short, long)]
        port: Option<u16>,
        /// How long to wait for the broker to answer.
        #[arg(long, default_value_t = defaults::PROBE_TIMEOUT_MS)]
        timeout_ms: u64,
    },
}

/// Which transport devices use.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum TransportKind {
    /// MQTT broker over TCP.
    Mqtt,
    /// In-process broker, no network.
    Memory,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Simulation mode: full, pub-only or sub-only.
    #[arg(short, long, default_value = "full", value_parser = parse_mode)]
    mode: RunMode,

    /// Number of publisher devices.
    #[arg(long)]
    publishers: Option<usize>,

    /// Number of subscriber clients.
    #[arg(long)]
    subscribers: Option<usize>,

    /// Messages each publisher sends.
    #[arg(long)]
    messages: Option<u64>,

    /// Base delay between two publishes of one device.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Broker host.
    #[arg(long)]
    broker: Option<String>,

    /// Broker port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Topic prefix.
    #[arg(long)]
    topic_base: Option<String>,

    /// Fixed publisher assignment, repeatable. E.g. `--assign park_north,humidity`.
    #[arg(long = "assign", value_name = "LOCATION,SENSOR_TYPE")]
    assign: Vec<String>,

    /// Transport used by the devices.
    #[arg(long, value_enum, default_value_t = TransportKind::Mqtt)]
    transport: TransportKind,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for reproducible device data.
    #[arg(long)]
    seed: Option<u64>,

    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,

    /// Start an in-process MQTT broker on the configured port first.
    #[cfg(feature = "embedded-broker")]
    #[arg(long)]
    embedded_broker: bool,
}

fn parse_mode(s: &str) -> std::result::Result<RunMode, String> {
    s.parse().map_err(|e: iotsim_core::SimulationError| e.to_string())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logging(args.verbose, args.log_dir.as_deref())?;

    match args.command {
        Command::Run(run) => run_simulation(run).await,
        Command::Probe {
            broker,
            port,
            timeout_ms,
        } => run_probe(broker, port, timeout_ms).await,
    }
}

/// Install the global subscriber. The returned guard flushes the log file on drop.
fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // JSON output for container environments
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "warn,iotsim=debug"
        } else {
            "warn,iotsim=info"
        })
    });

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, "iotsim.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = json_logging.then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let compact_layer = (!json_logging).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(compact_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Merge CLI flags over the config file, environment and defaults.
fn build_config(args: &RunArgs) -> Result<SimulationConfig> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::load(path)
            .map_err(|e| anyhow!("Failed to load {}: {}", path.display(), e))?,
        None => SimulationConfig::default(),
    };

    if let Some(broker) = &args.broker {
        config.broker = broker.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(topic_base) = &args.topic_base {
        config.topic_base = topic_base.clone();
    }
    if let Some(n) = args.publishers {
        config.num_publishers = n;
    }
    if let Some(n) = args.subscribers {
        config.num_subscribers = n;
    }
    if let Some(n) = args.messages {
        config.messages_per_device = n;
    }
    if let Some(ms) = args.interval_ms {
        config.interval_ms = ms;
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }

    let assignments = parse_assignments(&args.assign);
    if !assignments.is_empty() {
        config.assignments = Some(assignments);
    }

    Ok(config)
}

/// Parse `--assign` values, skipping malformed ones with a warning.
fn parse_assignments(raw: &[String]) -> Vec<Assignment> {
    raw.iter()
        .filter_map(|s| match s.parse::<Assignment>() {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(
                    "Invalid publisher assignment '{}': {}. Expected 'location,sensor_type'. Skipping.",
                    s, e
                );
                None
            }
        })
        .collect()
}

async fn run_simulation(args: RunArgs) -> Result<()> {
    let mode = args.mode;
    let config = build_config(&args)?;
    config.validate(mode)?;

    let transport: Arc<dyn Transport> = match args.transport {
        TransportKind::Mqtt => Arc::new(MqttTransport::new(&config.broker, config.port)),
        TransportKind::Memory => Arc::new(MemoryBroker::new()),
    };

    info!("{}", "=".repeat(70));
    info!("MQTT DEVICES SIMULATION PROGRAM");
    info!("{}", "=".repeat(70));
    info!("Broker: {}", transport.describe());
    info!("Mode: {}", mode);
    if mode.has_publishers() {
        info!("Number of publishers: {}", config.num_publishers);
    }
    if mode.has_subscribers() {
        info!("Number of subscribers: {}", config.num_subscribers);
    }
    info!("Topic pattern: {}/{{location}}/{{sensor_type}}", config.topic_base);
    info!("{}", "=".repeat(70));

    #[cfg(feature = "embedded-broker")]
    if args.embedded_broker && args.transport == TransportKind::Mqtt {
        use iotsim_core::embedded_broker::{EmbeddedBroker, EmbeddedBrokerConfig};

        let broker_config = EmbeddedBrokerConfig::new()
            .with_port(config.port)
            .with_capacity_for(config.num_publishers + config.num_subscribers);
        tokio::task::spawn_blocking(move || EmbeddedBroker::start(&broker_config)).await??;
    }

    let report = Simulation::new(config, transport)
        .run(mode, shutdown_receiver())
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn run_probe(broker: Option<String>, port: Option<u16>, timeout_ms: u64) -> Result<()> {
    let host = broker.unwrap_or_else(env_vars::broker);
    let port = port.unwrap_or_else(env_vars::port);

    info!("{}", "=".repeat(60));
    info!("MQTT BROKER CONNECTION CHECK");
    info!("{}", "=".repeat(60));

    let transport = Arc::new(MqttTransport::new(&host, port));
    match check_broker(transport, Duration::from_millis(timeout_ms)).await {
        Ok(()) => {
            println!("Broker {}:{} is reachable", host, port);
            Ok(())
        }
        Err(e) => Err(anyhow!("Broker {}:{} is not reachable: {}", host, port, e)),
    }
}

/// A receiver that turns true on Ctrl+C or SIGTERM.
fn shutdown_receiver() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
        // Keep the sender alive so receivers see `true`, not a closed channel.
        tx.closed().await;
    });
    rx
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, stopping"),
        _ = terminate => info!("Received SIGTERM, stopping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotsim_core::{Location, SensorType};

    #[test]
    fn test_parse_assignments_skips_malformed() {
        let raw = vec![
            "park_north,humidity".to_string(),
            "nonsense".to_string(),
            "street_123, pressure".to_string(),
            "moon,temperature".to_string(),
        ];
        assert_eq!(
            parse_assignments(&raw),
            vec![
                Assignment::new(Location::ParkNorth, SensorType::Humidity),
                Assignment::new(Location::Street123, SensorType::Pressure),
            ]
        );
    }

    #[test]
    fn test_cli_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");
        std::fs::write(&path, "broker = \"file-broker\"\nnum_publishers = 7\nmessages_per_device = 3\n")
            .unwrap();

        let args = Args::parse_from([
            "iotsim",
            "run",
            "--config",
            path.to_str().unwrap(),
            "--publishers",
            "2",
            "--assign",
            "city_center,temperature",
        ]);
        let Command::Run(run) = args.command else {
            panic!("expected run command");
        };

        let config = build_config(&run).unwrap();
        assert_eq!(config.broker, "file-broker");
        assert_eq!(config.num_publishers, 2);
        assert_eq!(config.messages_per_device, 3);
        assert_eq!(
            config.assignments,
            Some(vec![Assignment::new(Location::CityCenter, SensorType::Temperature)])
        );
    }

    #[test]
    fn test_mode_parsing() {
        let args = Args::parse_from(["iotsim", "run", "--mode", "sub-only"]);
        let Command::Run(run) = args.command else {
            panic!("expected run command");
        };
        assert_eq!(run.mode, RunMode::SubscribersOnly);
        assert!(Args::try_parse_from(["iotsim", "run", "--mode", "both"]).is_err());
    }
}
