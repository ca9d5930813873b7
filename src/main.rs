use std::{path::PathBuf, process, sync::Arc};

use anyhow::Context;
use botbridge::{
    api::{GetLogParams, ManagerApi, log_receiver},
    config::BridgeConfig,
    logger::{LogHub, LogLevel, LoggerEvent, init_tracing},
    manager::Manager,
    schema::{schemas, write_schema},
};
use bridge_core::{Endpoint, HandleMap};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "botbridge",
    about = "Bridge between an IM bot manager and its protocol implementations",
    version
)]
struct Cli {
    /// `.env` file with BOTBRIDGE_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a manager until Ctrl-C or a remote `stop`
    Run(RunArgs),

    /// Emit JSON-Schema for events, handshake meta and config
    Schema(SchemaArgs),

    /// Print (and optionally follow) a running manager's log
    Logs(LogsArgs),

    /// Ask a running manager to stop
    Stop(ConnectArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Override the listen address (unix:/path, tcp://host:port, ws://host:port)
    #[arg(long)]
    listen: Option<String>,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Also write a daily rolling log file into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Write one file per schema here instead of printing to stdout
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Manager endpoint; defaults to the configured listen address
    #[arg(long)]
    connect: Option<String>,
}

#[derive(Args, Debug)]
struct LogsArgs {
    #[command(flatten)]
    target: ConnectArgs,

    #[arg(long, default_value = "info")]
    level: LogLevel,

    /// Only the last N records
    #[arg(long)]
    lines: Option<usize>,

    /// Keep streaming new records until Ctrl-C
    #[arg(long, short)]
    follow: bool,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = BridgeConfig::from_env(Some(cli.env_file.clone()))?;

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            if let Some(listen) = args.listen {
                config.listen = listen;
            }
            if let Some(level) = args.log_level {
                config.log_level = level;
            }
            if args.log_dir.is_some() {
                config.log_dir = args.log_dir;
            }
            run(config).await
        }
        Commands::Schema(args) => {
            match args.out_dir {
                Some(out_dir) => {
                    let written = write_schema(&out_dir)?;
                    println!("{written} schemas written to {}", out_dir.display());
                }
                None => {
                    let all: serde_json::Map<String, serde_json::Value> = schemas()?
                        .into_iter()
                        .map(|(name, schema)| (name.to_string(), schema))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&all)?);
                }
            }
            Ok(())
        }
        Commands::Logs(args) => logs(&config, args).await,
        Commands::Stop(args) => {
            let api = connect(&config, &args, HandleMap::new()).await?;
            api.stop().await?;
            println!("stop requested");
            Ok(())
        }
    }
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let hub = Arc::new(LogHub::new(config.log_capacity));
    let _guard = init_tracing(&config.log_config(), &hub)?;

    info!("botbridge manager starting up…");
    let manager = match Manager::start(&config, hub).await {
        Ok(manager) => manager,
        Err(err) => {
            error!("Failed to start botbridge manager: {err:#}");
            process::exit(1);
        }
    };
    println!("botbridge listening on {}; press Ctrl-C to exit", manager.endpoint());

    tokio::select! {
        _ = manager.wait() => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            println!("\nShutting down…");
            manager.stop();
            manager.wait().await;
        }
    }

    info!("botbridge manager stopped");
    println!("Goodbye!");
    Ok(())
}

async fn connect(config: &BridgeConfig, args: &ConnectArgs, handles: HandleMap) -> anyhow::Result<ManagerApi> {
    let target = args.connect.clone().unwrap_or_else(|| config.listen.clone());
    let endpoint: Endpoint = target
        .parse()
        .with_context(|| format!("invalid manager endpoint {target:?}"))?;
    let mut options = config.session_options();
    options.name = "botbridge-cli".into();
    ManagerApi::connect(&endpoint, options, handles).await
}

fn print_record(event: &LoggerEvent) {
    println!(
        "{} {:>8} {}: {}",
        event.time.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.level.to_string(),
        event.target,
        event.message
    );
}

async fn logs(config: &BridgeConfig, args: LogsArgs) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let api = connect(config, &args.target, log_receiver(tx)).await?;

    let params = GetLogParams { level: args.level, time: None, lines: args.lines };
    for event in api.get_log(&params).await? {
        print_record(&event);
    }
    if !args.follow {
        api.close().await;
        return Ok(());
    }

    api.follow_log(args.level).await?;
    loop {
        tokio::select! {
            Some(event) = rx.recv() => print_record(&event),
            _ = api.client().closed() => break,
            _ = tokio::signal::ctrl_c() => {
                api.unfollow_log().await.ok();
                break;
            }
        }
    }
    api.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_overrides() {
        let cli = Cli::parse_from(["botbridge", "run", "--listen", "tcp://127.0.0.1:0", "--log-level", "debug"]);
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.listen.as_deref(), Some("tcp://127.0.0.1:0"));
                assert_eq!(args.log_level, Some(LogLevel::Debug));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_parses_logs_follow() {
        let cli = Cli::parse_from(["botbridge", "logs", "--connect", "ws://127.0.0.1:7700", "-f", "--lines", "20"]);
        match cli.command {
            Some(Commands::Logs(args)) => {
                assert!(args.follow);
                assert_eq!(args.lines, Some(20));
                assert_eq!(args.level, LogLevel::Info);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
