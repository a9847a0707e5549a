mod backoff;
mod bot;
mod commands;
mod config;
mod xmpp;

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backoff::Backoff;
use crate::bot::DisconnectReason;
use crate::config::Config;

/// How long a connection must be up before the backoff resets.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Maximum consecutive transient failures before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 20;

fn print_help() {
    println!(
        "\
xmpptools v{}

An XMPP chat bot answering service diagnostic queries.

USAGE:
    xmpptools [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/xmpptools.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG        Log level filter for tracing
                    (e.g. debug, xmpptools=debug,warn)
    BOT_PASSWORD    XMPP account password (when referenced in the config)

EXAMPLES:
    xmpptools                             # uses config/xmpptools.toml
    xmpptools /etc/xmpptools/bot.toml     # custom config path
    RUST_LOG=debug xmpptools              # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("xmpptools v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xmpptools=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/xmpptools.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("Account: {}", config.server.jid);
    info!("Server: {}", config.server.addr());
    if !config.rooms.is_empty() {
        info!(
            "MUC rooms (as {}): {}",
            config.bot.nick,
            config.rooms.join(", ")
        );
    }

    let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));

    // ── Reconnection loop ──────────────────────────────────────────
    loop {
        info!(
            "Connecting to XMPP server (attempt {})...",
            backoff.attempt + 1
        );

        match xmpp::session::connect(&config.server).await {
            Ok(session) => {
                let connected_at = Instant::now();

                let disconnect_reason = tokio::select! {
                    reason = bot::run(session, &config) => reason,
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received, exiting");
                        return Ok(());
                    }
                };

                // Session replaced by another client — do NOT reconnect
                // (would cause a ping-pong between the two clients)
                if matches!(disconnect_reason, DisconnectReason::Conflict) {
                    error!("Session replaced by another client (conflict), exiting");
                    return Err(anyhow!("Session replaced by another client (conflict)"));
                }

                if let DisconnectReason::StreamError(ref condition) = disconnect_reason {
                    warn!("Stream error: {condition}");
                }

                // Reset backoff if the connection was stable (up long enough)
                if connected_at.elapsed() >= STABILITY_THRESHOLD {
                    backoff.reset();
                    info!("Connection was stable, backoff reset");
                } else {
                    warn!(
                        "Connection lasted only {}s",
                        connected_at.elapsed().as_secs()
                    );
                }

                warn!("XMPP connection lost, preparing to reconnect...");
            }
            Err(e) => {
                // Permanent errors — exit immediately
                if !e.is_retriable() {
                    error!("Permanent connection error: {e}");
                    return Err(anyhow!("Cannot connect: {e}"));
                }

                warn!("Connection failed: {e}");

                if backoff.exceeded_max_attempts(MAX_RECONNECT_ATTEMPTS) {
                    error!(
                        "Exceeded {} reconnection attempts, giving up",
                        MAX_RECONNECT_ATTEMPTS
                    );
                    return Err(anyhow!(
                        "Max reconnection attempts ({MAX_RECONNECT_ATTEMPTS}) exceeded"
                    ));
                }
            }
        }

        // Wait before retrying, but allow graceful shutdown during the wait
        let delay = backoff.next_delay();
        info!(
            "Reconnecting in {}s (attempt {})...",
            delay.as_secs(),
            backoff.attempt + 1
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received during backoff, exiting");
                return Ok(());
            }
        }
    }
}
