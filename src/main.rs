//! Auction relayer entrypoint.
//!
//! Starts an Axum server exposing:
//! - `GET /auction` — the WebSocket endpoint (auctions, bids, vault quotes)
//! - `GET /` — greeting
//! - `GET /health` — relayer counters
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the bind address
//! - `RPC_URLS` configures read-only chain access
//! - limits documented in the `config` module

use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use sapience_relayer::account::AddressDeriver;
use sapience_relayer::chain::{ChainClient, RpcChainClient};
use sapience_relayer::config::Config;
use sapience_relayer::handlers::RelayState;
use sapience_relayer::hub::SubscriptionHub;
use sapience_relayer::registry::Registry;
use sapience_relayer::server::{self, WsState};
use sapience_relayer::telemetry::{Observer, Telemetry};
use sapience_relayer::verify::SigVerifier;

/// How often expired auctions are garbage-collected.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::from_env()?;
    let bind_addr = SocketAddr::new(config.host, config.port);

    let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(&config.rpc_urls));
    let deriver = Arc::new(AddressDeriver::new());
    let verifier = SigVerifier::new(chain.clone(), deriver, config.verifying_contract);
    let registry = Registry::new(chain, config.auction_ttl);
    let relay = Arc::new(RelayState {
        registry,
        hub: SubscriptionHub::new(),
        verifier,
        observer: Observer::new(),
        config,
    });

    let shutdown = server::shutdown_token()?;

    let sweeper = relay.clone();
    let sweeper_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweeper_shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = sweeper.registry.sweep_expired();
                    if swept > 0 {
                        tracing::debug!(swept, "collected expired auctions");
                    }
                }
            }
        }
    });

    let ws_state = WsState::new(relay, shutdown.clone());
    let app = server::routes()
        .with_state(ws_state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET])
                .allow_headers(cors::Any),
        );

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Starting relayer at ws://{bind_addr}/auction");

    let graceful = {
        let token = shutdown.clone();
        async move { token.cancelled().await }
    };
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(graceful)
        .await?;

    Ok(())
}
