use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use ais_relay::{
    config::{FileConfig, ReceiverOverrides, SinkOverrides, TransmitterOverrides},
    run_receivers, ChunkerKind, DataFormat, ErrorRegistry, PacketHandler, Receiver,
    ReceiverProtocol, Transmitter, TransmitterProtocol,
};
use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Receives AIS data on a tcp/udp port and forwards it to the configured sinks, or replays
/// recorded AIS files onto the network.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// YAML file with receivers, sinks, transmitter and monitor settings.
    /// Flags given on the command line take precedence.
    #[arg(short, long, global = true, env = "AIS_RELAY_CONFIG")]
    config_file: Option<PathBuf>,

    /// -v for debug output, -vv for trace. RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for or connect to an AIS feed and publish what arrives.
    Receiver(ReceiverArgs),
    /// Send the sentences of a file or directory of files.
    Transmitter(TransmitterArgs),
}

#[derive(Args, Debug)]
struct ReceiverArgs {
    /// UDP, TCP_client or TCP_server
    #[arg(long)]
    protocol: Option<ReceiverProtocol>,

    /// address to bind, or the feed to connect to for TCP_client
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// provider name used when the source host has no entry in source_names
    #[arg(long)]
    source_name: Option<String>,

    /// size of the receive buffer in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    #[arg(long)]
    delimiter: Option<String>,

    /// sent to the feed right after connecting (TCP_client)
    #[arg(long)]
    connect_string: Option<String>,

    /// reconnect attempts after the first failure; retries forever when omitted
    #[arg(long)]
    max_retries: Option<u32>,

    /// seconds
    #[arg(long)]
    init_retry_delay: Option<f64>,

    /// seconds
    #[arg(long)]
    max_retry_delay: Option<f64>,

    /// seconds to wait for a connection to be established (TCP_client)
    #[arg(long)]
    connect_timeout: Option<f64>,

    /// seconds without data before reconnecting (TCP_client)
    #[arg(long)]
    read_timeout: Option<f64>,

    /// packets buffered between socket reader and sinks (TCP_client)
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// write all received messages to standard out
    #[arg(short = 'l', long)]
    stdout: bool,

    #[arg(short = 'e', long, env = "UPLOAD_ENDPOINT")]
    upload_endpoint: Option<String>,

    #[arg(short, long, env = "AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// raw, split or tagblock, for the sinks given on the command line
    #[arg(long)]
    data_format: Option<DataFormat>,

    /// seconds between monitor checks
    #[arg(long)]
    monitor_interval: Option<f64>,
}

impl ReceiverArgs {
    fn receiver_overrides(&self) -> ReceiverOverrides {
        ReceiverOverrides {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            source_name: self.source_name.clone(),
            max_packet_size: self.max_packet_size,
            delimiter: self.delimiter.clone(),
            connect_string: self.connect_string.clone(),
            max_retries: self.max_retries,
            init_retry_delay: self.init_retry_delay,
            max_retry_delay: self.max_retry_delay,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            queue_capacity: self.queue_capacity,
        }
    }

    fn sink_overrides(&self) -> SinkOverrides {
        SinkOverrides {
            stdout: self.stdout,
            upload_endpoint: self.upload_endpoint.clone(),
            auth_token: self.auth_token.clone(),
            data_format: self.data_format,
        }
    }
}

#[derive(Args, Debug)]
struct TransmitterArgs {
    /// file or directory of files; `.gz` files are decompressed
    path: PathBuf,

    /// UDP or TCP_server
    #[arg(long)]
    protocol: Option<TransmitterProtocol>,

    /// destination for UDP, address to bind for TCP_server
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// seconds between two chunks
    #[arg(long)]
    delay: Option<f64>,

    /// lines per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// fixed or multipart
    #[arg(long)]
    chunker: Option<ChunkerKind>,

    /// drop lines that do not fit a multipart group instead of failing
    #[arg(long)]
    lenient: bool,

    /// only send the first N lines of every file
    #[arg(long)]
    first_n: Option<usize>,

    /// start over after the last file until interrupted
    #[arg(long)]
    repeat: bool,

    #[arg(long)]
    delimiter: Option<String>,
}

impl TransmitterArgs {
    fn overrides(&self) -> TransmitterOverrides {
        TransmitterOverrides {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            delay: self.delay,
            chunk_size: self.chunk_size,
            chunker: self.chunker,
            lenient: self.lenient,
            first_n: self.first_n,
            repeat: self.repeat,
            delimiter: self.delimiter.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let res = match &cli.command {
        Command::Receiver(args) => run_receiver(cli.config_file.as_deref(), args).await,
        Command::Transmitter(args) => run_transmitter(cli.config_file.as_deref(), args).await,
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FileConfig> {
    let config = match path {
        Some(path) => {
            info!("loading config from {}", path.display());
            FileConfig::load(path)?
        }
        None => FileConfig::default(),
    };
    config.validate().context("invalid config file")?;
    Ok(config)
}

async fn run_receiver(config_path: Option<&Path>, args: &ReceiverArgs) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(interval) = args.monitor_interval {
        config.monitor.interval = interval;
    }
    let receiver_configs = config.resolve_receivers(&args.receiver_overrides())?;
    let sink_configs = config.resolve_sinks(&args.sink_overrides())?;
    config.monitor.validate()?;

    let shutdown_token = register_ctrl_c_listener();

    let sinks = sink_configs
        .iter()
        .map(|sink| sink.build(&shutdown_token))
        .collect::<Result<Vec<_>, _>>()?;
    let errors = ErrorRegistry::default();
    let handler = PacketHandler::new(sinks, errors.clone())
        .with_source_names(Arc::new(config.source_names.clone()));

    let mut receivers = Vec::with_capacity(receiver_configs.len());
    for receiver_config in &receiver_configs {
        let token = shutdown_token.child_token();
        let receiver = Receiver::create(receiver_config, handler.clone(), token)
            .await
            .with_context(|| format!("could not start {} receiver", receiver_config.protocol))?;
        receivers.push(receiver);
    }

    Ok(run_receivers(receivers, errors, &config.monitor, shutdown_token).await?)
}

async fn run_transmitter(config_path: Option<&Path>, args: &TransmitterArgs) -> anyhow::Result<()> {
    let config = load_config(config_path)?.resolve_transmitter(&args.overrides())?;
    let shutdown_token = register_ctrl_c_listener();

    let transmitter = Transmitter::create(&config, shutdown_token)
        .await
        .with_context(|| format!("could not start {} transmitter", config.protocol))?;
    transmitter
        .start(&args.path)
        .await
        .with_context(|| format!("transmitting {} failed", args.path.display()))?;
    Ok(())
}

fn register_ctrl_c_listener() -> CancellationToken {
    let shutdown_token = CancellationToken::new();
    let cloned_token = shutdown_token.clone();
    _ = tokio::task::spawn(async move {
        info!("Set up ctrl_c handler");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("could not set up exit handler: {e}");
            return;
        }
        info!("Shutdown requested");
        cloned_token.cancel();
    });

    shutdown_token
}
