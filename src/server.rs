//! Connection supervision: accept gates, per-connection limits, the
//! read/write loops, and teardown.
//!
//! Each accepted socket gets a bounded outbound queue drained by a writer
//! task, and a reader loop that enforces the idle timeout and the
//! fixed-window rate limit. Gate rejections complete the handshake and then
//! close immediately so the client sees the policy close code.

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::handlers::RelayState;
use crate::hub::{ConnectionHandle, OUTBOUND_QUEUE_DEPTH, OutboundFrame};
use crate::router::{self, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION, ConnContext, RouteAction};

/// Shared axum state for the WebSocket endpoint.
#[derive(Clone)]
pub struct WsState {
    pub relay: Arc<RelayState>,
    pub shutdown: CancellationToken,
    next_conn_id: Arc<AtomicU64>,
}

impl WsState {
    pub fn new(relay: Arc<RelayState>, shutdown: CancellationToken) -> Self {
        Self { relay, shutdown, next_conn_id: Arc::new(AtomicU64::new(0)) }
    }
}

pub fn routes() -> Router<WsState> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/auction", get(ws_handler))
}

async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

async fn get_health(State(state): State<WsState>) -> impl IntoResponse {
    let observer = &state.relay.observer;
    axum::Json(json!({
        "activeConnections": observer.active_connections(),
        "messages": observer.messages(),
        "errors": observer.errors(),
        "broadcasts": observer.broadcasts(),
        "auctions": state.relay.registry.auction_count(),
    }))
}

async fn ws_handler(
    State(state): State<WsState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let config = &state.relay.config;
    let rejection = if state.relay.observer.active_connections() >= config.max_connections {
        Some("connection_limit_exceeded")
    } else if !config.origin_allowed(origin_header(&headers)) {
        Some("origin_not_allowed")
    } else {
        None
    };
    let (domain, uri) = connection_identity(&headers);
    ws.on_upgrade(move |socket| handle_socket(state, socket, remote, domain, uri, rejection))
}

fn origin_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::ORIGIN).and_then(|value| value.to_str().ok())
}

/// `(domain, uri)` for the life of the connection: hostname without port,
/// and a scheme chosen from `X-Forwarded-Proto`.
fn connection_identity(headers: &HeaderMap) -> (String, String) {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let domain = host.split(':').next().unwrap_or(host).to_string();
    let forwarded_proto = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    let scheme = if forwarded_proto.eq_ignore_ascii_case("https") { "https" } else { "http" };
    let uri = format!("{scheme}://{domain}");
    (domain, uri)
}

/// Fixed-window message budget. The `max+1`th frame inside one window is
/// over the limit.
struct FixedWindow {
    window: Duration,
    max: u32,
    started: Instant,
    count: u32,
}

impl FixedWindow {
    fn new(window: Duration, max: u32) -> Self {
        Self { window, max, started: Instant::now(), count: 0 }
    }

    fn allow(&mut self) -> bool {
        if self.started.elapsed() >= self.window {
            self.started = Instant::now();
            self.count = 0;
        }
        self.count += 1;
        self.count <= self.max
    }
}

async fn handle_socket(
    state: WsState,
    socket: WebSocket,
    remote: SocketAddr,
    domain: String,
    uri: String,
    rejection: Option<&'static str>,
) {
    let (mut sink, mut stream) = socket.split();

    if let Some(reason) = rejection {
        tracing::info!(%remote, reason, "rejecting connection at accept");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: reason.into(),
            })))
            .await;
        return;
    }

    let relay = state.relay.clone();
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
    let active = relay.observer.connection_opened();
    tracing::info!(conn_id, %remote, %domain, active, "connection accepted");

    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE_DEPTH);
    let handle = ConnectionHandle::new(conn_id, tx);
    relay.hub.register(handle.clone());
    let ctx = ConnContext { handle: handle.clone(), domain, uri, remote: remote.to_string() };

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Message(json) => {
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut budget =
        FixedWindow::new(relay.config.rate_limit_window, relay.config.rate_limit_max_messages);
    let idle_timeout = relay.config.idle_timeout;

    // Every frame, ping and pong included, resets the idle timer.
    let close = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                break Some((CLOSE_GOING_AWAY, "shutting_down"));
            }
            frame = tokio::time::timeout(idle_timeout, stream.next()) => {
                let frame = match frame {
                    Err(_) => break Some((CLOSE_POLICY_VIOLATION, "idle_timeout")),
                    Ok(None) => break None,
                    Ok(Some(Err(_))) => break None,
                    Ok(Some(Ok(frame))) => frame,
                };
                match frame {
                    Message::Text(text) => {
                        if !budget.allow() {
                            break Some((CLOSE_POLICY_VIOLATION, "rate_limited"));
                        }
                        match router::route(&relay, &ctx, text.as_str()).await {
                            RouteAction::Continue => {}
                            RouteAction::Close { code, reason } => break Some((code, reason)),
                        }
                    }
                    Message::Binary(_) => {
                        // The protocol is JSON text frames; binary is counted
                        // like any other garbage and dropped.
                        if !budget.allow() {
                            break Some((CLOSE_POLICY_VIOLATION, "rate_limited"));
                        }
                        relay.observer.count_error();
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break None,
                }
            }
        }
    };

    if let Some((code, reason)) = close {
        tracing::info!(conn_id, %remote, code, reason, "closing connection");
        handle.close(code, reason);
    }
    let dropped_channels = relay.hub.deregister(conn_id);
    drop(ctx);
    drop(handle);
    let _ = writer.await;

    let active = relay.observer.connection_closed();
    tracing::info!(
        conn_id,
        %remote,
        active,
        dropped_channels,
        messages = relay.observer.messages(),
        errors = relay.observer.errors(),
        "connection closed"
    );
}

/// Cancellation token that trips on SIGTERM or SIGINT.
pub fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::info!("shutdown signal received");
        trip.cancel();
    });
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_derives_from_host_and_proto() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "relay.sapience.xyz:8443".parse().expect("header"));
        headers.insert("x-forwarded-proto", "https".parse().expect("header"));
        let (domain, uri) = connection_identity(&headers);
        assert_eq!(domain, "relay.sapience.xyz");
        assert_eq!(uri, "https://relay.sapience.xyz");

        let (domain, uri) = connection_identity(&HeaderMap::new());
        assert_eq!(domain, "localhost");
        assert_eq!(uri, "http://localhost");
    }

    #[test]
    fn fixed_window_allows_exactly_max_per_window() {
        let mut budget = FixedWindow::new(Duration::from_secs(60), 3);
        assert!(budget.allow());
        assert!(budget.allow());
        assert!(budget.allow());
        assert!(!budget.allow());
    }

    #[test]
    fn fixed_window_resets_after_window_elapses() {
        let mut budget = FixedWindow::new(Duration::from_millis(20), 1);
        assert!(budget.allow());
        assert!(!budget.allow());
        std::thread::sleep(Duration::from_millis(30));
        assert!(budget.allow());
    }
}
