//! Minimal bootstrap binary for the presence engine: wires the shared
//! store, configuration, logging, the reaper, and the event bus together
//! and keeps them running until the process is asked to stop.
//!
//! The socket transport is out of scope for this crate (spec §1) — there is
//! no listener here. What this binary demonstrates is the wiring a real
//! transport layer would do once per process: construct `SharedStore`,
//! `PresenceService`, `MetadataStore`, start the `Reaper`, and subscribe a
//! broadcaster. A production deployment replaces `LoggingSubscriber` with
//! one that forwards to connected sockets.

use std::sync::Arc;

use clap::Parser;
use pulsemesh_common::{EngineError, Subscriber};
use pulsemesh_config::EngineConfig;
use pulsemesh_events::EventBus;
use pulsemesh_metadata::MetadataStore;
use pulsemesh_optim::{HeartbeatBatcher, ScriptedOps};
use pulsemesh_presence::PresenceService;
use pulsemesh_reaper::{Reaper, ReaperConfig as ReaperTaskConfig};
use pulsemesh_registry::{ConnectionRegistry, RoomIndex};
use pulsemesh_store::SharedStore;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pulsemeshd", about = "pulsemesh — presence & channel-metadata engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start the reaper and event-bus listener against a configured store.
    Serve {
        /// Override the configured shared-store URL.
        #[arg(long)]
        store_url: Option<String>,
    },
    /// Print the resolved configuration (after file + env overrides) as JSON.
    PrintConfig,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true))
            .init();
    }
}

/// Logs every event it receives. Stands in for the socket-room bridge,
/// which is out of scope for this crate (spec §9's `RoomBroadcaster` seam).
struct LoggingSubscriber;

#[async_trait::async_trait]
impl Subscriber for LoggingSubscriber {
    async fn handle(&self, room_or_channel: &str, event_name: &str, payload: Value) -> Result<(), EngineError> {
        info!(channel = room_or_channel, event = event_name, %payload, "event");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = pulsemesh_config::discover_and_load();

    match cli.command {
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        },
        Commands::Serve { store_url } => {
            if let Some(url) = store_url {
                config.store.url = url;
            }
            serve(config).await
        },
    }
}

async fn serve(config: EngineConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "pulsemesh daemon starting");

    let store = SharedStore::connect(&config.store.url, config.store.key_prefix.clone()).await?;
    let registry = ConnectionRegistry::new(store.clone());
    let rooms = RoomIndex::new(store.clone());
    let bus = EventBus::new(store.clone());

    let presence = PresenceService::new(
        registry.clone(),
        rooms.clone(),
        bus.clone(),
        config.connection_ttl_ms,
    );
    let _metadata = MetadataStore::new(store.clone(), bus.clone(), config.transactional_metadata.enabled)
        .with_retry_policy(
            config.transactional_metadata.max_retries,
            config.transactional_metadata.retry_delay_ms,
        );

    // Accelerators are constructed whenever configured, even though nothing
    // in this minimal binary drives traffic through them yet — a future
    // transport layer selects between `presence`/`batcher`/`scripted` at the
    // request-handling seam based on the same config flags.
    let _scripted = config
        .scripted_heartbeat_enabled
        .then(|| ScriptedOps::new(store.clone()));
    let _batcher = config.heartbeat_batcher.enabled.then(|| {
        HeartbeatBatcher::new(
            registry.clone(),
            rooms.clone(),
            bus.clone(),
            config.connection_ttl_ms,
            config.heartbeat_batcher.window_ms,
            config.heartbeat_batcher.max_batch_size,
        )
    });

    let _metadata_disposer = presence.subscribe_metadata(Arc::new(LoggingSubscriber));
    let _presence_disposer = presence.subscribe(Arc::new(LoggingSubscriber));

    let reaper = Reaper::new(
        registry,
        rooms,
        bus,
        ReaperTaskConfig {
            interval_ms: config.reaper.interval_ms,
            lookback_ms: config.reaper_lookback_ms(),
        },
    );
    let reaper_handle = reaper.spawn();

    info!(
        store_url = %config.store.url,
        connection_ttl_ms = config.connection_ttl_ms,
        reaper_interval_ms = config.reaper.interval_ms,
        "presence engine running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    reaper_handle.abort();
    if let Some(batcher) = _batcher {
        batcher.dispose().await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve_subcommand() {
        let cli = Cli::parse_from(["pulsemeshd", "serve", "--store-url", "redis://example:6379"]);
        match cli.command {
            Commands::Serve { store_url } => assert_eq!(store_url.as_deref(), Some("redis://example:6379")),
            _ => panic!("expected Serve"),
        }
    }

    #[test]
    fn cli_parses_print_config() {
        let cli = Cli::parse_from(["pulsemeshd", "print-config"]);
        assert!(matches!(cli.command, Commands::PrintConfig));
    }
}
