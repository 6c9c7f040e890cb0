//! Message handlers for the auction relayer.
//!
//! Each handler consumes one decoded envelope and returns `Ok(())` once its
//! replies are queued, or an [`ErrorKind`] that [`dispatch`] projects into
//! the appropriate ack for the message family. Errors only ever reach the
//! originating socket; fanout to other clients happens solely on success.

use std::sync::Arc;

use crate::config::Config;
use crate::hub::{ChannelKey, SubscriptionHub};
use crate::registry::{Registry, VaultKey};
use crate::router::ConnContext;
use crate::telemetry::Observer;
use crate::timestamp::{UnixMillis, UnixTimestamp};
use crate::types::{
    AuctionAck, AuctionChannelPayload, AuctionRequest, BidAck, BidSubmitPayload, BidsSnapshot,
    EmptyPayload, ErrorKind, Envelope, MessageKind, ServerMessage, SignatureHex, VaultChannelPayload,
    VaultQuote, VaultQuotePublishPayload, VaultQuoteAck, VaultQuoteRequested,
};
use crate::verify::{self, SigVerifier};

/// A published quote may lag or lead the relayer clock by at most this much.
const MAX_QUOTE_SKEW_MS: i64 = 5 * 60 * 1000;

/// Everything a handler needs, shared across connections.
pub struct RelayState {
    pub config: Config,
    pub registry: Registry,
    pub hub: SubscriptionHub,
    pub verifier: SigVerifier,
    pub observer: Observer,
}

/// Run the handler for `kind` and project any error into the family ack.
pub async fn dispatch(state: &Arc<RelayState>, ctx: &ConnContext, kind: MessageKind, envelope: Envelope) {
    let id = envelope.id.clone();
    let result = match kind {
        MessageKind::Ping => {
            ctx.handle.send(&ServerMessage::Pong { payload: EmptyPayload {} });
            Ok(())
        }
        MessageKind::AuctionStart => auction_start(state, ctx, envelope).await,
        MessageKind::AuctionSubscribe => auction_subscribe(state, ctx, envelope),
        MessageKind::AuctionUnsubscribe => auction_unsubscribe(state, ctx, envelope),
        MessageKind::BidSubmit => bid_submit(state, ctx, envelope),
        MessageKind::VaultQuoteObserve => {
            state.hub.observe(ctx.handle.id());
            ctx.handle.send(&ServerMessage::VaultQuoteAck { payload: VaultQuoteAck::ok(id.clone()) });
            Ok(())
        }
        MessageKind::VaultQuoteUnobserve => {
            state.hub.unobserve(ctx.handle.id());
            ctx.handle.send(&ServerMessage::VaultQuoteAck { payload: VaultQuoteAck::ok(id.clone()) });
            Ok(())
        }
        MessageKind::VaultQuoteSubscribe => vault_quote_subscribe(state, ctx, envelope),
        MessageKind::VaultQuoteUnsubscribe => vault_quote_unsubscribe(state, ctx, envelope),
        MessageKind::VaultQuotePublish => vault_quote_publish(state, ctx, envelope).await,
        MessageKind::Unknown => Ok(()),
    };
    if let Err(error) = result {
        state.observer.count_error();
        let ack = match kind {
            MessageKind::BidSubmit => {
                ServerMessage::BidAck { payload: BidAck { id, error: Some(error) } }
            }
            MessageKind::VaultQuoteObserve
            | MessageKind::VaultQuoteUnobserve
            | MessageKind::VaultQuoteSubscribe
            | MessageKind::VaultQuoteUnsubscribe
            | MessageKind::VaultQuotePublish => {
                ServerMessage::VaultQuoteAck { payload: VaultQuoteAck::rejected(error, id) }
            }
            _ => ServerMessage::AuctionAck { payload: AuctionAck::rejected(error, id) },
        };
        ctx.handle.send(&ack);
    }
}

/// `auction.start`: verify (when signed), register, auto-subscribe the
/// opener, announce to every connected client.
async fn auction_start(
    state: &Arc<RelayState>,
    ctx: &ConnContext,
    envelope: Envelope,
) -> Result<(), ErrorKind> {
    let request: AuctionRequest =
        serde_json::from_value(envelope.payload).map_err(|_| ErrorKind::InvalidPayload)?;
    request.validate()?;

    if request.taker_signature.is_some() {
        let accepted = state
            .verifier
            .verify_auction_start(&request, &ctx.domain, &ctx.uri)
            .await
            .map_err(|error| {
                tracing::warn!(remote = %ctx.remote, %error, "auction start verification errored");
                ErrorKind::SignatureVerificationFailed
            })?;
        if !accepted {
            return Err(ErrorKind::InvalidSignature);
        }
    }

    let auction = state.registry.upsert_auction(request);
    let auction_id = auction.auction_id.clone();
    state.hub.subscribe(ChannelKey::auction(&auction_id), ctx.handle.id());
    ctx.handle.send(&ServerMessage::AuctionAck {
        payload: AuctionAck::started(auction_id.clone(), envelope.id),
    });

    tracing::info!(auction_id = %auction_id, taker = %auction.request.taker, "auction opened");
    let announced = state.hub.broadcast_all(&ServerMessage::AuctionStarted { payload: auction });
    state.observer.count_broadcast(announced);

    let bids = state.registry.get_bids(&auction_id);
    if !bids.is_empty() {
        ctx.handle.send(&ServerMessage::AuctionBids {
            payload: BidsSnapshot { auction_id, bids },
        });
    }
    Ok(())
}

fn auction_subscribe(
    state: &Arc<RelayState>,
    ctx: &ConnContext,
    envelope: Envelope,
) -> Result<(), ErrorKind> {
    // A missing or malformed payload reads as a missing id.
    let payload: AuctionChannelPayload =
        serde_json::from_value(envelope.payload).unwrap_or_default();
    if payload.auction_id.is_empty() {
        return Err(ErrorKind::MissingAuctionId);
    }
    state.hub.subscribe(ChannelKey::auction(&payload.auction_id), ctx.handle.id());
    ctx.handle.send(&ServerMessage::AuctionAck {
        payload: AuctionAck::subscribed(payload.auction_id.clone(), envelope.id),
    });
    let bids = state.registry.get_bids(&payload.auction_id);
    if !bids.is_empty() {
        ctx.handle.send(&ServerMessage::AuctionBids {
            payload: BidsSnapshot { auction_id: payload.auction_id, bids },
        });
    }
    Ok(())
}

fn auction_unsubscribe(
    state: &Arc<RelayState>,
    ctx: &ConnContext,
    envelope: Envelope,
) -> Result<(), ErrorKind> {
    let payload: AuctionChannelPayload =
        serde_json::from_value(envelope.payload).unwrap_or_default();
    if payload.auction_id.is_empty() {
        return Err(ErrorKind::MissingAuctionId);
    }
    state.hub.unsubscribe(&ChannelKey::auction(&payload.auction_id), ctx.handle.id());
    ctx.handle.send(&ServerMessage::AuctionAck {
        payload: AuctionAck::unsubscribed(payload.auction_id, envelope.id),
    });
    Ok(())
}

/// `bid.submit`: structural checks, advisory signature verification, then
/// append + fanout inside the auction's critical section so every
/// subscriber observes bids in acceptance order.
fn bid_submit(state: &Arc<RelayState>, ctx: &ConnContext, envelope: Envelope) -> Result<(), ErrorKind> {
    let payload: BidSubmitPayload =
        serde_json::from_value(envelope.payload).map_err(|_| ErrorKind::InvalidPayload)?;
    let auction = state
        .registry
        .get_auction(&payload.auction_id)
        .ok_or(ErrorKind::AuctionNotFoundOrExpired)?;
    let now = UnixTimestamp::try_now().map_err(|_| ErrorKind::InternalError)?;
    let bid = payload.validate(now)?;

    let chain_id = auction.request.chain_id;
    match state.verifier.verify_bid(&auction.request, &bid, chain_id) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(
                auction_id = %auction.auction_id,
                maker = %bid.maker,
                "maker bid signature failed verification"
            );
            if state.config.bid_verification_enforced {
                return Err(ErrorKind::InvalidSignature);
            }
        }
        Err(error) => {
            tracing::warn!(
                auction_id = %auction.auction_id,
                maker = %bid.maker,
                %error,
                "maker bid signature unverifiable"
            );
            if state.config.bid_verification_enforced {
                return Err(ErrorKind::InvalidSignature);
            }
        }
    }

    let channel = ChannelKey::auction(&auction.auction_id);
    let ack_id = envelope.id;
    let delivered = state
        .registry
        .add_bid_with(&auction.auction_id, bid, |bids| {
            // Ack first so the submitter sees bid.ack before the snapshot
            // that includes their bid.
            ctx.handle.send(&ServerMessage::BidAck { payload: BidAck { id: ack_id.clone(), error: None } });
            let snapshot = ServerMessage::AuctionBids {
                payload: BidsSnapshot {
                    auction_id: auction.auction_id.clone(),
                    bids: bids.to_vec(),
                },
            };
            state.hub.broadcast(&channel, &snapshot)
        })
        .ok_or(ErrorKind::AuctionNotFoundOrExpired)?;
    state.observer.count_broadcast(delivered);
    Ok(())
}

fn vault_quote_subscribe(
    state: &Arc<RelayState>,
    ctx: &ConnContext,
    envelope: Envelope,
) -> Result<(), ErrorKind> {
    let payload: VaultChannelPayload =
        serde_json::from_value(envelope.payload).map_err(|_| ErrorKind::InvalidPayload)?;
    let vault_lower = payload.vault_address.to_lowercase();
    let channel = ChannelKey::vault(payload.chain_id, &vault_lower);
    state.hub.subscribe(channel.clone(), ctx.handle.id());
    ctx.handle.send(&ServerMessage::VaultQuoteAck { payload: VaultQuoteAck::ok(envelope.id) });

    let key: VaultKey = (payload.chain_id, vault_lower.clone());
    if let Some(quote) = state.registry.latest_vault_quote(&key) {
        ctx.handle.send(&ServerMessage::VaultQuoteUpdate { payload: quote });
    }

    let requested = ServerMessage::VaultQuoteRequested {
        payload: VaultQuoteRequested {
            chain_id: payload.chain_id,
            vault_address: vault_lower,
            channel: channel.to_string(),
        },
    };
    let notified = state.hub.broadcast_observers(&requested);
    state.observer.count_broadcast(notified);
    Ok(())
}

fn vault_quote_unsubscribe(
    state: &Arc<RelayState>,
    ctx: &ConnContext,
    envelope: Envelope,
) -> Result<(), ErrorKind> {
    let payload: VaultChannelPayload =
        serde_json::from_value(envelope.payload).map_err(|_| ErrorKind::InvalidPayload)?;
    let channel = ChannelKey::vault(payload.chain_id, &payload.vault_address);
    state.hub.unsubscribe(&channel, ctx.handle.id());
    ctx.handle.send(&ServerMessage::VaultQuoteAck { payload: VaultQuoteAck::ok(envelope.id) });
    Ok(())
}

/// `vault_quote.publish`: completeness, freshness, EIP-191 signer recovery,
/// authorized-signer check, then store + fanout to subscribers and
/// observers (once per socket).
async fn vault_quote_publish(
    state: &Arc<RelayState>,
    ctx: &ConnContext,
    envelope: Envelope,
) -> Result<(), ErrorKind> {
    let payload: VaultQuotePublishPayload =
        serde_json::from_value(envelope.payload).map_err(|_| ErrorKind::InvalidPayload)?;
    if !payload.is_complete() {
        return Err(ErrorKind::InvalidPayload);
    }
    let now = UnixMillis::try_now().map_err(|_| ErrorKind::InternalError)?;
    if now.skew_from(UnixMillis(payload.timestamp)) > MAX_QUOTE_SKEW_MS {
        return Err(ErrorKind::StaleTimestamp);
    }

    let vault_lower = payload.vault_address.to_lowercase();
    let signed_by_lower = payload.signed_by.to_lowercase();
    let message = verify::vault_quote_message(
        &vault_lower,
        payload.chain_id,
        &payload.vault_collateral_per_share,
        payload.timestamp,
    );
    if SignatureHex::parse(&payload.signature).is_none() {
        return Err(ErrorKind::BadSignature);
    }
    let recovered = verify::recover_eip191(&message, &payload.signature)
        .ok_or(ErrorKind::BadSignature)?;
    if format!("{recovered:#x}") != signed_by_lower {
        return Err(ErrorKind::BadSignature);
    }

    let key: VaultKey = (payload.chain_id, vault_lower.clone());
    let signers = state.registry.authorized_signers(&key).await;
    if !signers.contains(&signed_by_lower) {
        return Err(ErrorKind::UnauthorizedSigner);
    }

    let quote = VaultQuote {
        chain_id: payload.chain_id,
        vault_address: vault_lower.clone(),
        vault_collateral_per_share: payload.vault_collateral_per_share,
        timestamp: UnixMillis(payload.timestamp),
        signed_by: signed_by_lower,
        signature: payload.signature,
    };
    let channel = ChannelKey::vault(payload.chain_id, &vault_lower);
    let delivered = state.registry.put_vault_quote_with(key, quote, |stored| {
        let update = ServerMessage::VaultQuoteUpdate { payload: stored.clone() };
        state.hub.broadcast_with_observers(&channel, &update)
    });
    state.observer.count_broadcast(delivered);
    tracing::info!(chain_id = payload.chain_id, vault = %vault_lower, "vault quote published");

    ctx.handle.send(&ServerMessage::VaultQuoteAck { payload: VaultQuoteAck::ok(envelope.id) });
    Ok(())
}
