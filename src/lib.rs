//! Real-time auction relayer for on-chain prediction-market parlays.
//!
//! A taker opens a short-lived first-price auction over a single WebSocket
//! endpoint; competing makers stream signed bids quoting the counter-stake
//! they will post; subscribers receive live bid snapshots. The relayer also
//! multiplexes a vault share-quote channel over the same socket, published
//! by each vault's authorized manager. Settlement of accepted bids happens
//! on-chain and never through this process.
//!
//! The relayer accepts untrusted traffic, so every state-changing message
//! is gated: EIP-191, EIP-712, ERC-1271, and session-approval signatures
//! (including counterfactual smart accounts that have never been deployed),
//! per-connection rate and size limits, an origin allow-list, and bounded
//! fanout queues that evict slow consumers instead of waiting on them.
//!
//! # Modules
//!
//! - [`account`] — deterministic smart-account address derivation (pure).
//! - [`chain`] — read-only, fail-closed JSON-RPC access.
//! - [`config`] — environment-driven limits and endpoints.
//! - [`handlers`] — one handler per client message type.
//! - [`hub`] — subscription graph and broadcast fanout.
//! - [`registry`] — in-memory auctions, bids, vault quotes, signer cache.
//! - [`router`] — frame pipeline: size gate, decode, dispatch.
//! - [`server`] — connection supervision and lifecycle.
//! - [`telemetry`] — tracing setup and relayer counters.
//! - [`types`] — wire protocol types.
//! - [`verify`] — the signature verification cascade.

pub mod account;
pub mod chain;
pub mod config;
pub mod handlers;
pub mod hub;
pub mod registry;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod timestamp;
pub mod types;
pub mod verify;
