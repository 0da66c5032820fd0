//! Trayce agent server
//!
//! Listens for the capture agent, logs the traffic and container reports it
//! receives, and keeps the agent's intercept settings in sync.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tr_core::config::{self, ServerConfig};
use tr_core::net::local_ip_addr;
use tr_server::{AgentServer, AgentService, HeartbeatMonitor, ObserverEvent};

#[derive(Parser)]
#[command(name = "trayce-server")]
#[command(about = "Trayce agent server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Container IDs to intercept from the start
    #[arg(short, long = "intercept", value_delimiter = ',')]
    intercept: Vec<String>,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    init_config: bool,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Trayce server starting...");

    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    config.validate().context("Invalid configuration")?;

    if args.init_config {
        let path = args.config.unwrap_or_else(config::default_config_path);
        config::save_config(&path, &config)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    match local_ip_addr() {
        Ok(ip) => tracing::info!("Start the agent with: {}", config.agent_run_command(&ip.to_string())),
        Err(e) => tracing::warn!("Could not determine local IP address: {}", e),
    }

    let service = Arc::new(AgentService::from_config(&config));
    if !args.intercept.is_empty() {
        service.update_settings(args.intercept);
    }

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let monitor = HeartbeatMonitor::from_config(&config);
    let monitor_handle = monitor.spawn_monitor(
        Arc::clone(service.session()),
        service.events().clone(),
        cancel.clone(),
    );

    let mut events = service.subscribe();
    let events_cancel = cancel.clone();
    let events_service = Arc::clone(&service);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = events_cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => log_observer_event(&events_service, &event),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Event logger lagged; {} events skipped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    let server = AgentServer::new(Arc::clone(&service), cancel.clone());
    let result = server.run(&config.bind_address).await;

    service.shutdown();
    cancel.cancel();
    let _ = monitor_handle.await;

    result?;
    tracing::info!("Trayce server shutdown complete");
    Ok(())
}

/// Log what an observer would render
fn log_observer_event(service: &AgentService, event: &ObserverEvent) {
    match event {
        ObserverEvent::FlowsChanged(flows) => {
            for flow in flows {
                tracing::info!(
                    "[{}] {} {} {} -> {}",
                    flow.seq,
                    flow.operation(),
                    flow.destination(),
                    flow.path(),
                    flow.response_status()
                );
                if let Some(response) = flow.response() {
                    tracing::trace!("Response body:\n{}", response.formatted_body());
                }
            }
        }
        ObserverEvent::ContainersObserved(state) => {
            let settings = service.session().settings();
            tracing::debug!(
                "{} containers observed, {} intercepted",
                state.len(),
                state.intercepted(&settings).count()
            );
            for container in &state.containers {
                tracing::trace!("  {}", container);
            }
        }
        ObserverEvent::AgentRunningChanged(running) => {
            if *running {
                tracing::info!("Agent running");
            } else {
                tracing::warn!("Agent stopped responding");
            }
        }
    }
}
