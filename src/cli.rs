use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, instrument, warn, Instrument};

use crate::config::Settings;
use crate::engine::{CancelSource, MacroExecutor};
use crate::macros::loader::MacroRegistry;
use crate::rpc::{RemoteBackend, RpcClient, RpcServer};
use crate::types::{Error, Result};

#[derive(Parser)]
#[command(name = "macroflow")]
#[command(about = "Parameterized UI-automation macros over a cross-process session")]
#[command(long_about = "
Loads JSON macro documents from a directory, validates and expands them,
and runs them step by step against an automation session that may live in
a different, more-privileged process reached over a line-delimited RPC
connection.
")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file path
    #[arg(short, long, default_value = "macroflow.toml")]
    pub config: PathBuf,

    /// Override the macro directory from the settings file
    #[arg(short, long)]
    pub macros: Option<PathBuf>,

    /// Override log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Load and validate every macro document, then report problems
    Validate,
    /// List the loaded macros
    List,
    /// Run one macro against a connected automation session
    Run(RunArgs),
    /// Expose an upstream automation session on a listen address
    Serve(ServeArgs),
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Macro name (canonical, case-insensitive)
    pub name: String,

    /// Address of the process that owns the automation session
    #[arg(long)]
    pub connect: String,

    /// Macro parameter as name=value (repeatable)
    #[arg(short, long = "param")]
    pub params: Vec<String>,

    /// Set log format
    #[arg(long)]
    pub log_format: Option<LogFormat>,
}

#[derive(Args, Clone)]
pub struct ServeArgs {
    /// Override listen address (format: "host:port")
    #[arg(long)]
    pub listen: Option<String>,

    /// Address of the upstream session to expose
    #[arg(long)]
    pub connect: String,

    /// Set log format
    #[arg(long)]
    pub log_format: Option<LogFormat>,
}

impl Cli {
    /// Effective log level considering verbose/quiet flags
    pub fn effective_log_level(&self) -> LogLevel {
        if self.verbose {
            LogLevel::Debug
        } else if self.quiet {
            LogLevel::Error
        } else {
            self.log_level.clone().unwrap_or(LogLevel::Info)
        }
    }

    pub fn log_level_to_str(&self) -> &'static str {
        match self.effective_log_level() {
            LogLevel::Trace => crate::logging::level::TRACE,
            LogLevel::Debug => crate::logging::level::DEBUG,
            LogLevel::Info => crate::logging::level::INFO,
            LogLevel::Warn => crate::logging::level::WARN,
            LogLevel::Error => crate::logging::level::ERROR,
        }
    }

    pub fn log_format_override(&self) -> Option<&'static str> {
        let format = match &self.command {
            Commands::Run(args) => args.log_format.as_ref(),
            Commands::Serve(args) => args.log_format.as_ref(),
            _ => None,
        };
        format.map(|fmt| match fmt {
            LogFormat::Json => crate::logging::format::JSON,
            LogFormat::Pretty => crate::logging::format::PRETTY,
        })
    }

    /// Macro directory: CLI override, then settings file.
    pub fn macro_directory(&self, settings: &Settings) -> PathBuf {
        self.macros
            .clone()
            .unwrap_or_else(|| settings.macros.directory.clone())
    }
}

/// Parse repeated `name=value` parameter flags.
pub fn parse_params(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            return Err(Error::Application(format!(
                "invalid parameter '{}'; expected name=value",
                entry
            )));
        };
        params.insert(name.trim().to_string(), value.to_string());
    }
    Ok(params)
}

async fn load_registry(cli: &Cli, settings: &Settings) -> Result<MacroRegistry> {
    let directory = cli.macro_directory(settings);
    info!(directory = %directory.display(), "Loading macros");
    MacroRegistry::load(directory)
}

/// Load every macro document and report per-file problems.
#[instrument(skip(cli, settings))]
pub async fn validate_macros(cli: Cli, settings: Settings) -> Result<()> {
    let registry = load_registry(&cli, &settings).await?;
    let table = registry.snapshot();

    for err in table.errors() {
        error!(
            path = %err.path.display(),
            macro_name = %err.macro_name,
            error = %err.message,
            "Macro rejected"
        );
    }

    info!(
        loaded = table.len(),
        rejected = table.errors().len(),
        "Validation finished"
    );
    if table.errors().is_empty() {
        Ok(())
    } else {
        Err(Error::Application(format!(
            "{} macro document(s) rejected",
            table.errors().len()
        )))
    }
}

/// List the loaded macros with their descriptions.
#[instrument(skip(cli, settings))]
pub async fn list_macros(cli: Cli, settings: Settings) -> Result<()> {
    let registry = load_registry(&cli, &settings).await?;
    let table = registry.snapshot();

    for name in table.names() {
        let Some(def) = table.get(name) else {
            continue;
        };
        let description = if def.description.is_empty() {
            String::new()
        } else {
            format!(" - {}", def.description)
        };
        println!("{} ({} steps){}", def.display_name, def.steps.len(), description);
    }
    for err in table.errors() {
        warn!(
            path = %err.path.display(),
            error = %err.message,
            "Skipped document"
        );
    }
    info!(count = table.len(), "Macros listed");
    Ok(())
}

/// Run one macro against a remote automation session.
#[instrument(skip(cli, args, settings), fields(name = %args.name))]
pub async fn run_macro(cli: Cli, args: RunArgs, settings: Settings) -> Result<()> {
    let params = parse_params(&args.params)?;
    let registry = load_registry(&cli, &settings).await?;
    let table = registry.snapshot();
    for err in table.errors() {
        warn!(path = %err.path.display(), error = %err.message, "Skipped document");
    }

    info!(addr = %args.connect, "Connecting to automation session");
    let client = Arc::new(RpcClient::connect(args.connect.as_str()).await?);
    let backend = Arc::new(RemoteBackend::new(client));
    let executor = MacroExecutor::new(backend, table).with_defaults(settings.engine.defaults());

    let (cancel_source, cancel_token) = CancelSource::new();
    tokio::spawn(async move {
        setup_shutdown_signal().await;
        cancel_source.cancel();
    });

    let started_at = chrono::Local::now();
    info!(
        started_at = %started_at.format("%Y-%m-%d %H:%M:%S"),
        "Starting macro"
    );
    let result = executor
        .run(&args.name, params, Some(cancel_token))
        .instrument(crate::logging::macro_span(&args.name))
        .await;

    let rendered = serde_json::to_string_pretty(&result)
        .map_err(crate::types::TransportError::Serde)?;
    println!("{}", rendered);
    if result.success {
        info!(
            steps = result.steps_executed,
            duration_ms = result.duration_ms,
            "Macro completed"
        );
        Ok(())
    } else {
        error!(error = %result.message, "Macro failed");
        Err(Error::Application(result.message))
    }
}

/// Expose an upstream automation session on a local listen address. Many
/// clients may connect; the server's command gate keeps the upstream
/// session non-interleaved.
#[instrument(skip(_cli, args, settings))]
pub async fn serve(_cli: Cli, args: ServeArgs, settings: Settings) -> Result<()> {
    let listen = args.listen.as_deref().unwrap_or(&settings.transport.listen);

    info!(addr = %args.connect, "Connecting to upstream session");
    let client = Arc::new(RpcClient::connect(args.connect.as_str()).await?);
    let backend = Arc::new(RemoteBackend::new(client));
    let server = RpcServer::new(backend);

    let listener = TcpListener::bind(listen)
        .await
        .map_err(crate::types::TransportError::Io)?;

    tokio::select! {
        outcome = server.serve(listener) => outcome.map_err(Error::from),
        _ = setup_shutdown_signal() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

/// Graceful shutdown on Ctrl+C or SIGTERM.
pub async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
