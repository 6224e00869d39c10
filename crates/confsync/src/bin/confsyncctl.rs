//! confsyncctl - host a settings owner or act as a replica against one.
//!
//! `serve` loads a schema and hosts the owner store on a Unix socket. The
//! other commands connect to that socket as a replica.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

use confsync::{
    ReplicaOptions, SettingsMap, SettingsReplica, SettingsStore, SocketLink, SocketServer,
    StoreOptions, SyncHost,
};

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Get { socket, key } => {
            let replica = connect(&socket).await?;
            let value = replica.get(&key)?;
            print_value(&value.unwrap_or(Value::Null), cli.common.json)
        }
        Command::Set { socket, key, value } => {
            let replica = connect(&socket).await?;
            let result = replica.set_and_write(&key, parse_value(&value)).await?;
            if cli.common.json {
                println!(
                    "{}",
                    serde_json::json!({ "validation": result.0, "write": result.1 })
                );
            } else if result.0.status {
                println!("{key} updated");
            } else {
                println!("{key} rejected: {}", result.0.errors.messages().join(" "));
            }
            Ok(())
        }
        Command::Unset { socket, key } => {
            let replica = connect(&socket).await?;
            let existed = replica.unset(&key).await?;
            replica.write().await?;
            if existed {
                println!("{key} removed");
            } else {
                println!("{key} was not set");
            }
            Ok(())
        }
        Command::Reset { socket } => {
            let replica = connect(&socket).await?;
            let (changed, outcome) = replica.reset_and_write().await?;
            if let Some(reason) = outcome.failure() {
                bail!("settings were reset but not written: {reason}");
            }
            println!("{}", if changed { "settings reset" } else { "already at defaults" });
            Ok(())
        }
        Command::Write { socket } => {
            let replica = connect(&socket).await?;
            let outcome = replica.write_sync().await?;
            if let Some(reason) = outcome.failure() {
                bail!("write failed: {reason}");
            }
            println!("settings written");
            Ok(())
        }
        Command::Dump { socket, defaults } => {
            let replica = connect(&socket).await?;
            let map = if defaults {
                replica.fetch_defaults().await?
            } else {
                replica.fetch_all().await?
            };
            print_map(&map, cli.common.json)
        }
        Command::Watch { socket } => watch(&socket, cli.common.json).await,
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "confsyncctl",
    author,
    version,
    about = "Host a schema-validated settings store or talk to one as a replica."
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Output machine readable JSON (values and logs)
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// JSON schema descriptor file
    #[arg(long, value_name = "PATH")]
    schema: PathBuf,
    /// TOML store options (CONFSYNC_* environment variables also apply)
    #[arg(long, value_name = "PATH")]
    options: Option<PathBuf>,
    /// Socket to serve replicas on
    #[arg(long, value_name = "PATH", env = "CONFSYNC_SOCKET")]
    socket: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Host the owner store on a Unix socket
    Serve(ServeArgs),
    /// Print one setting
    Get {
        #[arg(long, env = "CONFSYNC_SOCKET")]
        socket: PathBuf,
        key: String,
    },
    /// Set one setting and write it
    Set {
        #[arg(long, env = "CONFSYNC_SOCKET")]
        socket: PathBuf,
        key: String,
        /// JSON value; bare words are taken as strings
        value: String,
    },
    /// Remove one setting and write
    Unset {
        #[arg(long, env = "CONFSYNC_SOCKET")]
        socket: PathBuf,
        key: String,
    },
    /// Restore every setting to its default and write
    Reset {
        #[arg(long, env = "CONFSYNC_SOCKET")]
        socket: PathBuf,
    },
    /// Write the owner's settings to disk
    Write {
        #[arg(long, env = "CONFSYNC_SOCKET")]
        socket: PathBuf,
    },
    /// Print all settings
    Dump {
        #[arg(long, env = "CONFSYNC_SOCKET")]
        socket: PathBuf,
        /// Print the defaults instead
        #[arg(long)]
        defaults: bool,
    },
    /// Print every settings update until interrupted
    Watch {
        #[arg(long, env = "CONFSYNC_SOCKET")]
        socket: PathBuf,
    },
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = if common.quiet {
        "error"
    } else {
        match common.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("confsync={level},confsyncctl={level}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .ok();
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let raw = tokio::fs::read_to_string(&args.schema)
        .await
        .with_context(|| format!("reading schema {}", args.schema.display()))?;
    let schema: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing schema {}", args.schema.display()))?;

    let options = match &args.options {
        Some(path) => StoreOptions::load(path)
            .with_context(|| format!("loading options {}", path.display()))?,
        None => StoreOptions::default(),
    };

    let store = SettingsStore::new(&schema, options).context("creating settings store")?;
    store.init().await.context("initializing settings store")?;
    info!(
        "Serving settings from {}",
        store.complete_file_path().display()
    );

    let server = SocketServer::bind(SyncHost::new(store.clone()), &args.socket)
        .await
        .with_context(|| format!("binding {}", args.socket.display()))?;
    server.run(shutdown_signal()).await;

    if let Some(outcome) = store.shutdown().await
        && let Some(reason) = outcome.failure()
    {
        warn!("Final write failed: {}", reason);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn connect(socket: &Path) -> Result<SettingsReplica> {
    let link = SocketLink::connect(socket)
        .await
        .with_context(|| format!("connecting to settings owner at {}", socket.display()))?;
    let replica = SettingsReplica::new(Arc::new(link), ReplicaOptions::default());
    replica.init().await.context("initializing replica")?;
    Ok(replica)
}

async fn watch(socket: &Path, json: bool) -> Result<()> {
    let replica = connect(socket).await?;
    let mut updates = replica.subscribe();
    print_map(&replica.get_all()?, json)?;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(settings) => print_map(&settings, json)?,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Skipped {} updates", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Accept JSON literals, and treat anything else as a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_value(value: &Value, json: bool) -> Result<()> {
    match value {
        Value::String(s) if !json => println!("{s}"),
        other => println!("{}", serde_json::to_string(other)?),
    }
    Ok(())
}

fn print_map(map: &SettingsMap, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(map)?);
    } else {
        for (key, value) in map {
            println!("{key} = {value}");
        }
    }
    Ok(())
}
