//! Binary entrypoint for the meshchat CLI.
//!
//! Commands:
//! - `start [--port <path-or-addr>]` - run the gateway until Ctrl-C
//! - `init` - create a starter `config.toml`
//! - `status` - print a JSON summary of the persisted state
//! - `smoke-test --port <path-or-addr> [--timeout <s>]` - decode frames from a device
//!
//! See the library crate docs for module-level details: `meshchat::`.
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};

use meshchat::config::Config;
use meshchat::gateway::Gateway;
use meshchat::logutil::hex_snippet;
use meshchat::mesh::transport::Connector;
use meshchat::mesh::{FrameCodec, FrameReader};
use meshchat::metrics;
use meshchat::storage::messages::MessageStore;
use meshchat::storage::{JsonFileStore, NullStore};

#[derive(Parser)]
#[command(name = "meshchat")]
#[command(about = "A web chat gateway for packet-radio mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Radio device: serial port (e.g., /dev/ttyUSB0) or host:port
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show a summary of the persisted state
    Status,
    /// Connect to a device and report the frames it sends
    SmokeTest {
        /// Radio device: serial port or host:port
        #[arg(short, long)]
        port: String,
        /// Seconds to listen
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { port } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            info!("Starting meshchat v{}", env!("CARGO_PKG_VERSION"));
            run_gateway(config, port).await?;
        }
        Commands::Init => {
            info!("Initializing new gateway configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            show_status(&config)?;
        }
        Commands::SmokeTest { port, timeout } => {
            let config = pre_config.unwrap_or_default();
            let ok = smoke_test(&config, port, timeout).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}

async fn run_gateway(config: Config, port: Option<String>) -> Result<()> {
    let settings = config.gateway_settings()?;
    let connector = config.connector(port);

    if config.transport.require_device_at_startup {
        // Probe once so a missing device fails fast; the supervisor reconnects for real
        match tokio::time::timeout(Duration::from_secs(10), connector.connect()).await {
            Ok(Ok(_link)) => info!("Radio available at {}", connector.describe()),
            Ok(Err(e)) => return Err(anyhow!("Radio required at startup: {}", e)),
            Err(_) => {
                return Err(anyhow!(
                    "Radio required at startup: {} did not answer",
                    connector.describe()
                ))
            }
        }
    }

    let gateway = if config.storage.persist {
        let store = JsonFileStore::open(&config.storage.data_dir)?;
        Gateway::spawn(settings, connector, store)?
    } else {
        warn!("Persistence disabled; history is kept in memory only");
        Gateway::spawn(settings, connector, NullStore)?
    };
    info!("Gateway running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
    gateway.shutdown().await?;
    match serde_json::to_string(&metrics::snapshot()) {
        Ok(m) => info!("Final metrics: {}", m),
        Err(e) => debug!("Could not serialize metrics: {}", e),
    }
    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    let snapshot = JsonFileStore::read_snapshot(&config.storage.data_dir)?;
    let mut store = MessageStore::new();
    for message in snapshot.messages {
        store.record(message);
    }
    let per_channel: BTreeMap<String, usize> = store
        .counts_by_channel()
        .into_iter()
        .map(|(ch, n)| (ch.to_string(), n))
        .collect();
    let payload = serde_json::json!({
        "data_dir": config.storage.data_dir,
        "profile": snapshot.profile,
        "nodes": snapshot.nodes.len(),
        "messages": store.len(),
        "messages_by_channel": per_channel,
        "channels": config.channels.iter().map(|c| &c.label).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn smoke_test(config: &Config, port: String, timeout: u64) -> Result<bool> {
    use tokio::time::{sleep_until, Instant};

    let layout = config.codec.layout()?;
    let connector = config.connector(Some(port));
    info!("Starting smoke test on {}", connector.describe());
    let mut link = connector.connect().await?;
    let mut reader = FrameReader::new(FrameCodec::new(layout));

    let deadline = Instant::now() + Duration::from_secs(timeout);
    let mut kinds: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut corrupt = 0usize;
    let mut bytes = 0usize;
    let mut link_error = None;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            chunk = link.reader.read_chunk() => {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Link error during smoke test: {}", e);
                        link_error = Some(e.to_string());
                        break;
                    }
                };
                log::trace!("rx {}", hex_snippet(&chunk, 64));
                bytes += chunk.len();
                reader.push(&chunk);
                while let Some(result) = reader.next_packet() {
                    match result {
                        Ok(packet) => *kinds.entry(packet.kind.label()).or_default() += 1,
                        Err(e) => {
                            debug!("{}", e);
                            corrupt += 1;
                        }
                    }
                }
            }
        }
    }

    let frames: usize = kinds.values().sum();
    let ok = frames > 0;
    if !ok {
        warn!("No valid frames decoded. Check the port, baud rate and [codec] layout.");
    }
    let payload = serde_json::json!({
        "status": if ok { "ok" } else { "no_frames" },
        "target": connector.describe(),
        "bytes": bytes,
        "frames": frames,
        "kinds": kinds,
        "corrupt_frames": corrupt,
        "error": link_error,
        "timeout_seconds": timeout,
    });
    println!("{}", payload);
    Ok(ok)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Redirected stdout (service managers) gets the file only
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
