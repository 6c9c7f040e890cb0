//! Inbound frame pipeline: size gate, JSON decode, envelope check, dispatch.
//!
//! Only an oversized frame escalates to a close; malformed JSON, envelopes
//! without a string `type`, and unrecognized types are counted and dropped
//! so one confused client cannot take its own socket down.

use std::sync::Arc;

use crate::handlers::{self, RelayState};
use crate::hub::ConnectionHandle;
use crate::types::{Envelope, MessageKind};

/// Largest accepted text frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 64_000;

/// Close codes used by the relayer.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_MESSAGE_TOO_LARGE: u16 = 1009;

/// What the connection loop should do after one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Continue,
    Close { code: u16, reason: &'static str },
}

/// Per-connection parameters fixed at the handshake.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub handle: ConnectionHandle,
    /// Hostname from the `Host` header, without port.
    pub domain: String,
    /// `http(s)://<domain>`, scheme from `X-Forwarded-Proto`.
    pub uri: String,
    pub remote: String,
}

/// Process one inbound text frame end to end.
pub async fn route(state: &Arc<RelayState>, ctx: &ConnContext, raw: &str) -> RouteAction {
    if raw.len() > MAX_FRAME_BYTES {
        state.observer.count_error();
        return RouteAction::Close {
            code: CLOSE_MESSAGE_TOO_LARGE,
            reason: "message_too_large",
        };
    }
    state.observer.count_message();

    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => {
            state.observer.count_error();
            tracing::debug!(remote = %ctx.remote, "dropping malformed JSON frame");
            return RouteAction::Continue;
        }
    };
    let envelope: Envelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(_) => {
            state.observer.count_error();
            tracing::debug!(remote = %ctx.remote, "dropping frame without a string type");
            return RouteAction::Continue;
        }
    };

    let kind = MessageKind::from_type(&envelope.msg_type);
    if kind == MessageKind::Unknown {
        state.observer.count_error();
        tracing::debug!(remote = %ctx.remote, msg_type = %envelope.msg_type, "dropping unknown message type");
        return RouteAction::Continue;
    }

    handlers::dispatch(state, ctx, kind, envelope).await;
    RouteAction::Continue
}
