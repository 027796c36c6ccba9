//! Deribit Bridge Binary
//!
//! Starts the local broker, connects to Deribit and reads trading commands
//! from stdin.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin deribit-bridge
//! ```
//!
//! # Environment Variables
//!
//! Read from the nearest `.env` file first, then the process environment.
//!
//! ## Required
//! - `API_KEY` / `DERIBIT_API_KEY`: Deribit client id
//! - `API_SECRET` / `DERIBIT_API_SECRET`: Deribit client secret
//!
//! ## Optional
//! - `BASE_URL`: Trading API base URL (default: <https://test.deribit.com>)
//! - `DERIBIT_WS_HOST` / `DERIBIT_WS_PORT` / `DERIBIT_WS_PATH`: WebSocket
//!   endpoint (default: test.deribit.com:443/ws/api/v2)
//! - `BRIDGE_LISTEN_ADDR` / `BRIDGE_LISTEN_PORT`: Local broker (default: 0.0.0.0:8000)
//! - `BINARY_PROTOCOL`: "true" to send binary frames to local clients
//! - `BOOK_INTERVAL`: Order book channel rate (default: 100ms)
//! - `HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8082)
//! - `HTTP_TIMEOUT_SECS`, `PIPELINE_QUEUE_CAPACITY`, `CALL_TIMEOUT_SECS`
//! - `DEFAULT_INSTRUMENT`: Instrument for commands that omit one (default: BTC-PERPETUAL)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

mod commands;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use deribit_bridge::infrastructure::health::{HealthServer, HealthServerState};
use deribit_bridge::infrastructure::telemetry;
use deribit_bridge::{
    BridgeConfig, Connector, EnvSource, HttpTransport, Manager, PendingResponse, Pipeline,
    PipelineError, TelemetryConfig, init_metrics,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::commands::{Command, DEFAULT_CURRENCY, DEFAULT_KIND, HELP};

/// How often the command loop checks whether the bridge is still running.
const LIVENESS_POLL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let env = EnvSource::load()?;

    let _telemetry_guard =
        telemetry::init_with_config(TelemetryConfig::from_lookup(|key| env.get(key)));

    tracing::info!(env_file = ?env.path(), "Starting Deribit bridge");

    let _metrics_handle = init_metrics();

    let config = BridgeConfig::from_lookup(|key| env.get(key))?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let transport = HttpTransport::new(&config.deribit.base_url, config.requests.http_timeout)
        .context("failed to build HTTP client")?;
    let pipeline = Arc::new(
        Pipeline::start(
            config.credentials.clone(),
            Arc::new(transport),
            config.pipeline_settings(),
        )
        .await
        .context("trading API authentication failed")?,
    );

    let manager = Arc::new(Manager::new(
        Connector::new().with_connect_timeout(config.deribit.connect_timeout),
        config.broker_settings(),
        &config.listen.book_interval,
    ));
    let broker_addr = manager.start().await?;
    tracing::info!(addr = %broker_addr, "Local broker ready");

    if config.server.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            manager.connector(),
            manager.sessions(),
            manager.subscriptions(),
            Arc::clone(&pipeline),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    connect(&manager, &config).await;
    println!("{HELP}");

    let console = Console {
        manager: Arc::clone(&manager),
        pipeline: Arc::clone(&pipeline),
        config: &config,
    };

    tokio::select! {
        () = console.run() => {}
        () = await_shutdown() => {}
    }

    shutdown_token.cancel();
    manager.stop().await;
    pipeline.shutdown().await;

    tracing::info!("Deribit bridge stopped");
    Ok(())
}

// =============================================================================
// Command Loop
// =============================================================================

struct Console<'a> {
    manager: Arc<Manager>,
    pipeline: Arc<Pipeline>,
    config: &'a BridgeConfig,
}

impl Console<'_> {
    /// Read commands until `quit`, EOF, or the upstream connection closes.
    async fn run(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut poll = tokio::time::interval(LIVENESS_POLL);

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = poll.tick() => {
                    if self.manager.is_running() {
                        continue;
                    }
                    tracing::info!("Bridge no longer running");
                    return;
                }
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read stdin");
                    return;
                }
            };

            match line.parse::<Command>() {
                Ok(Command::Quit) => return,
                Ok(command) => self.execute(command).await,
                Err(e) => eprintln!("{e}"),
            }
        }
    }

    async fn execute(&self, command: Command) {
        let instrument = |name: Option<String>| {
            name.unwrap_or_else(|| self.config.default_instrument.clone())
        };
        let currency = |name: Option<String>| name.unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        let (label, submitted) = match command {
            Command::Empty | Command::Quit => return,
            Command::Help => {
                println!("{HELP}");
                return;
            }
            Command::Connect => {
                connect(&self.manager, self.config).await;
                return;
            }
            Command::Raw(text) => {
                if self.manager.is_connected() {
                    if let Err(e) = self.manager.send_upstream(&text).await {
                        eprintln!("Send failed: {e}");
                    }
                } else {
                    eprintln!("Unknown command. Type 'help' for a list.");
                }
                return;
            }
            Command::Order {
                side,
                order_type,
                amount,
                price,
            } => (
                "Order",
                self.pipeline.place_order(
                    &self.config.default_instrument,
                    &side,
                    &order_type,
                    amount,
                    price,
                    false,
                ),
            ),
            Command::Cancel(order_id) => ("Cancel", self.pipeline.cancel_order(&order_id)),
            Command::Modify {
                order_id,
                price,
                amount,
            } => (
                "Modify",
                self.pipeline.modify_order(&order_id, price, amount),
            ),
            Command::Orders => ("Active orders", self.pipeline.get_active_orders()),
            Command::State(order_id) => ("Order state", self.pipeline.get_order_state(&order_id)),
            Command::Orderbook(name) => (
                "Order book",
                self.pipeline.get_orderbook(&instrument(name)),
            ),
            Command::Positions(name) => ("Positions", self.pipeline.get_positions(&currency(name))),
            Command::Instruments { currency: cur, kind } => (
                "Instruments",
                self.pipeline.get_instruments(
                    &currency(cur),
                    &kind.unwrap_or_else(|| DEFAULT_KIND.to_string()),
                ),
            ),
            Command::Instrument(name) => (
                "Instrument",
                self.pipeline.get_instrument(&instrument(name)),
            ),
        };

        self.report(label, submitted).await;
    }

    async fn report(&self, label: &str, submitted: Result<PendingResponse, PipelineError>) {
        let result = match submitted {
            Ok(pending) => pending.wait_timeout(self.config.requests.call_timeout).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => println!("{label}: {}", pretty(&response)),
            Err(e) => eprintln!("{label} failed: {e}"),
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

async fn connect(manager: &Manager, config: &BridgeConfig) {
    let deribit = &config.deribit;
    if let Err(e) = manager
        .connect_upstream(&deribit.ws_host, deribit.ws_port, &deribit.ws_path)
        .await
    {
        eprintln!("Could not connect to Deribit: {e}");
    }
}

// =============================================================================
// Startup Helpers
// =============================================================================

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        base_url = %config.deribit.base_url,
        ws_host = %config.deribit.ws_host,
        ws_port = config.deribit.ws_port,
        listen_addr = %config.listen.addr,
        listen_port = config.listen.port,
        wire_format = ?config.listen.wire_format,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        book_interval = %config.listen.book_interval,
        queue_capacity = config.requests.queue_capacity,
        call_timeout_secs = config.requests.call_timeout.as_secs(),
        default_instrument = %config.default_instrument,
        "Request settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
