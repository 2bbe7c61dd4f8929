mod config_commands;

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    warden_config::{ConfigHandle, LoggingConfig, WardenConfig},
    warden_extensions::{BundledSource, ExtensionRegistry, ExtensionSource},
    warden_irc::IrcDialer,
    warden_store::JsonStore,
    warden_supervisor::{HandoffPackage, Host, HostExit, handoff},
};

#[derive(Parser)]
#[command(name = "warden", about = "Warden, a supervised chat bot host", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (overrides discovery in ./ and ~/.config/warden/).
    #[arg(long, short, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every configured client (default when no subcommand is provided).
    Run,
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// List the bundled extensions.
    Extensions,
}

/// Initialise tracing. `RUST_LOG` wins over `--log-level`, which wins over
/// `logging.level` from the config file.
fn init_telemetry(cli: &Cli, logging: &LoggingConfig) -> anyhow::Result<()> {
    let level = cli
        .log_level
        .clone()
        .or_else(|| logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            )
        },
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if cli.json_logs || logging.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
    Ok(())
}

/// Load the config named on the command line, or discover one.
fn load_config(path: Option<&Path>) -> anyhow::Result<(WardenConfig, Option<PathBuf>)> {
    match path {
        Some(path) => {
            let config = warden_config::load_config(path)
                .with_context(|| format!("cannot load config {}", path.display()))?;
            Ok((config, Some(path.to_path_buf())))
        },
        None => Ok(warden_config::discover_and_load()),
    }
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn run(config: WardenConfig, source: Option<PathBuf>) -> anyhow::Result<()> {
    let diagnostics = config_commands::diagnose(&config);
    if config_commands::report(&diagnostics, false) > 0 {
        anyhow::bail!("configuration has errors; run `warden check` for details");
    }

    let store_path = config
        .store_path
        .clone()
        .unwrap_or_else(warden_config::default_store_path);
    let store = JsonStore::open(&store_path)
        .await
        .with_context(|| format!("cannot open store {}", store_path.display()))?;

    let config = ConfigHandle::new(config, source);
    let sources: Vec<Arc<dyn ExtensionSource>> = vec![Arc::new(BundledSource)];
    let registry = ExtensionRegistry::new(sources, store, config.clone());
    let host = Host::new(config, registry, Arc::new(IrcDialer::new()));

    let inherited = HandoffPackage::from_env();
    if let Some(package) = &inherited {
        info!(connections = package.connections.len(), "adopting connections from previous image");
    }
    host.start(inherited).await?;

    match host.run(shutdown_signal()).await? {
        HostExit::Shutdown => info!("shut down"),
        HostExit::Idle => warn!("no clients left running"),
        HostExit::HandedOff(package) => {
            // Only returns on failure.
            let e = match handoff::reexec(&package) {
                Ok(never) => match never {},
                Err(e) => e,
            };
            error!(error = %e, "re-exec failed");
            return Err(e.into());
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config, source) = load_config(cli.config.as_deref())?;
    init_telemetry(&cli, &config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "warden starting");
    if let Some(path) = &source {
        info!(path = %path.display(), "config loaded");
    }

    match cli.command {
        None | Some(Commands::Run) => run(config, source).await,
        Some(Commands::Check { verbose }) => config_commands::check(&config, source, verbose),
        Some(Commands::Extensions) => {
            config_commands::list_extensions();
            Ok(())
        },
    }
}
