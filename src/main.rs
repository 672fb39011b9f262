//! Fleet Console binary
//!
//! Runs a master or a monitor over WebSocket, plus config and version helpers.

use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use fleet_console::channel::websocket::{WsAcceptor, WsConnector};
use fleet_console::cli::{Cli, Commands, ConfigSubcommand};
use fleet_console::config::{self, ConsoleConfig};
use fleet_console::error::{Error, Result};
use fleet_console::logging;
use fleet_console::modules;
use fleet_console::service::{ConsoleService, ServiceEvent};
use fleet_console::version;

fn main() {
    if let Err(e) = run() {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    let config = match cli.command {
        Commands::Version { json } => {
            let info = version::build_info();
            if json {
                println!("{}", info.to_json());
            } else {
                print!("{}", info);
            }
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand);
        }
        Commands::Master { ref config, port } => {
            let mut cfg = ConsoleConfig::load(config.as_deref())?;
            if let Some(port) = port {
                cfg.master.port = port;
            }
            cfg
        }
        Commands::Monitor {
            ref config,
            ref id,
            ref server_type,
            ref master_url,
        } => {
            let mut cfg = ConsoleConfig::load(config.as_deref())?;
            if let Some(id) = id {
                cfg.monitor.id = id.clone();
            }
            if let Some(server_type) = server_type {
                cfg.monitor.server_type = server_type.clone();
            }
            if let Some(url) = master_url {
                cfg.monitor.master_url = url.clone();
            }
            cfg
        }
    };

    // CLI overrides bypassed the first validation
    config.validate()?;

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting fleet-console"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(4))
        .thread_name("fleet-console")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    match cli.command {
        Commands::Master { .. } => runtime.block_on(run_master(config)),
        Commands::Monitor { .. } => runtime.block_on(run_monitor(config)),
        Commands::Version { .. } | Commands::Config { .. } => Ok(()),
    }
}

async fn run_master(config: ConsoleConfig) -> Result<()> {
    let service = ConsoleService::master_from_config(&config);
    modules::register_builtin(&service, &config.modules);
    let events = service.subscribe();

    if config.auth.users.is_empty() {
        warn!("No admin users configured; every client login will be rejected");
    }

    let acceptor = WsAcceptor::bind(config.master.listen_addr()).await?;
    let addr = service.listen(acceptor)?;
    info!(
        addr = ?addr,
        env = %config.master.env,
        modules = ?service.modules().module_ids(),
        "Master listening"
    );

    watch_events(&service, events).await;
    service.stop();
    Ok(())
}

async fn run_monitor(config: ConsoleConfig) -> Result<()> {
    let service = ConsoleService::monitor_from_config(&config);
    modules::register_builtin(&service, &config.modules);
    let events = service.subscribe();

    let connector = WsConnector::new(
        &config.monitor.master_url,
        Duration::from_millis(config.monitor.connect_timeout_ms),
    )?;
    service.connect(connector).await?;
    info!(
        id = %config.monitor.id,
        server_type = %config.monitor.server_type,
        master = %config.monitor.master_url,
        "Monitor registered"
    );

    watch_events(&service, events).await;
    service.stop();
    Ok(())
}

/// Log service events until Ctrl+C or the agent closes
async fn watch_events(
    service: &ConsoleService,
    mut events: tokio::sync::broadcast::Receiver<ServiceEvent>,
) {
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }

            event = events.recv() => match event {
                Ok(ServiceEvent::Close) => {
                    if service.is_master() {
                        info!("Master closed");
                    } else {
                        error!("Monitor gave up on the master");
                    }
                    break;
                }
                Ok(event) => log_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Service event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

fn log_event(event: ServiceEvent) {
    match event {
        ServiceEvent::Register { id, server_type, info } => {
            info!(server_id = %id, server_type = %server_type, info = ?info, "Server registered");
        }
        ServiceEvent::Reconnect { id, server_type, .. } => {
            info!(server_id = %id, server_type = %server_type, "Server reconnected");
        }
        ServiceEvent::Disconnect { id, kind, server_type, reason } => {
            info!(id = %id, kind = ?kind, server_type = %server_type, reason = %reason, "Peer disconnected");
        }
        ServiceEvent::AdminLog(record) => {
            debug!(
                action = ?record.action,
                module_id = %record.module_id,
                client_id = ?record.client_id,
                "Admin log"
            );
        }
        ServiceEvent::Error { message } => {
            warn!(message = %message, "Console error");
        }
        ServiceEvent::Close => {}
    }
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = ConsoleConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            ConsoleConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
