//! Signature verification for auction starts and maker bids.
//!
//! Both operations run an ordered cascade of independent strategies. Each
//! strategy reports whether it *matched* (it is the authoritative path for
//! this input) and, if so, whether it *accepted*; the cascade short-circuits
//! on the first match. This keeps the four paths — session key, direct EOA,
//! recovered-owner smart account, ERC-1271 — separately testable, and makes
//! the one RPC-dependent path (ERC-1271) the last resort.
//!
//! Verification never panics: malformed signature bytes surface as
//! [`VerifyError::MalformedSignature`] so callers can distinguish "could not
//! even attempt recovery" from an honest rejection; everything else is a
//! plain `false`.

use alloy_dyn_abi::TypedData;
use alloy_primitives::{Address, B256, Bytes, Signature, U256, eip191_hash_message, hex, keccak256};
use alloy_sol_types::{SolStruct, SolValue, eip712_domain, sol};
use std::sync::Arc;
use thiserror::Error;

use crate::account::AddressDeriver;
use crate::chain::ChainClient;
use crate::timestamp::UnixTimestamp;
use crate::types::{AuctionRequest, Bid, SessionMetadata, SignatureHex};

sol! {
    /// Typed struct a maker signs to approve countering a parlay auction.
    struct Approve {
        bytes32 messageHash;
        address owner;
    }
}

/// EIP-712 domain name and version for maker bid approvals.
const EIP712_DOMAIN_NAME: &str = "Sapience";
const EIP712_DOMAIN_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed signature bytes")]
    MalformedSignature,
    #[error("system clock unavailable")]
    Clock,
}

/// Result of one cascade strategy.
#[derive(Debug, Clone, Copy)]
struct StrategyOutcome {
    matched: bool,
    accepted: bool,
}

impl StrategyOutcome {
    const UNMATCHED: StrategyOutcome = StrategyOutcome { matched: false, accepted: false };

    fn decided(accepted: bool) -> Self {
        StrategyOutcome { matched: true, accepted }
    }
}

pub struct SigVerifier {
    chain: Arc<dyn ChainClient>,
    deriver: Arc<AddressDeriver>,
    verifying_contract: Address,
}

impl SigVerifier {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        deriver: Arc<AddressDeriver>,
        verifying_contract: Address,
    ) -> Self {
        Self { chain, deriver, verifying_contract }
    }

    /// Verify the taker's signature over the canonical auction-start message.
    ///
    /// Returns `Ok(false)` when the signature or its timestamp is absent,
    /// when the reconstructed message fails its own sanity lines, or when no
    /// strategy accepts. `domain` and `uri` are fixed per connection.
    pub async fn verify_auction_start(
        &self,
        req: &AuctionRequest,
        domain: &str,
        uri: &str,
    ) -> Result<bool, VerifyError> {
        let (Some(signature_hex), Some(signed_at)) =
            (req.taker_signature.as_deref(), req.taker_signed_at.as_deref())
        else {
            return Ok(false);
        };
        let Some(taker) = req.taker_address() else {
            return Ok(false);
        };
        let taker = taker.0;

        let message = auction_start_message(req, domain, uri, signed_at);
        // Guards against reconstruction drift: these two lines are what bind
        // the signature to a nonce and a chain.
        if !message.contains(&format!("Nonce: {}", req.taker_nonce))
            || !message.contains(&format!("Chain ID: {}", req.chain_id))
        {
            return Ok(false);
        }

        let signature = parse_signature(signature_hex)?;

        let session = self.session_strategy(req, &message, &signature, taker)?;
        if session.matched {
            return Ok(session.accepted);
        }

        let recovered = signature.recover_address_from_msg(message.as_bytes()).ok();

        if let Some(recovered) = recovered {
            if recovered == taker {
                return Ok(true);
            }
            if self.deriver.derive(recovered) == taker {
                return Ok(true);
            }
        }

        if self.chain.has_code(req.chain_id, taker).await {
            let hash = eip191_hash_message(message.as_bytes());
            let accepted = self
                .chain
                .verify_eip1271(req.chain_id, taker, hash, &signature.as_bytes())
                .await;
            return Ok(accepted);
        }

        Ok(false)
    }

    /// Verify a maker bid against its EIP-712 approval digest.
    pub fn verify_bid(
        &self,
        auction: &AuctionRequest,
        bid: &Bid,
        chain_id: u64,
    ) -> Result<bool, VerifyError> {
        let Some(digest) = self.bid_digest(auction, bid, chain_id) else {
            return Ok(false);
        };
        let signature = parse_signature(&bid.maker_signature)?;
        let maker = bid.maker.0;

        let recovered = signature.recover_address_from_prehash(&digest).ok();

        if let (Some(typed_data), Some(approval), Some(recovered)) =
            (bid.session_typed_data.as_ref(), bid.session_approval.as_deref(), recovered)
        {
            // Session path: the digest signer is a session key; the approval
            // must bind that key to the maker account.
            let accepted =
                self.session_binding_holds(typed_data, approval, recovered, maker, chain_id);
            return Ok(accepted);
        }

        let Some(recovered) = recovered else {
            return Ok(false);
        };
        if recovered == maker {
            return Ok(true);
        }
        Ok(self.deriver.derive(recovered) == maker)
    }

    /// EIP-712 signing hash of `Approve { messageHash, owner }` where
    /// `messageHash` commits to the economic terms of the parlay.
    fn bid_digest(&self, auction: &AuctionRequest, bid: &Bid, chain_id: u64) -> Option<B256> {
        let outcome = auction.predicted_outcomes.first()?;
        let outcome_bytes = decode_outcome(outcome);
        let wager = U256::from_str_radix(&auction.wager, 10).ok()?;
        let resolver: Address = auction.resolver.parse().ok()?;
        let taker: Address = auction.taker.parse().ok()?;

        let encoded = (
            Bytes::from(outcome_bytes),
            bid.maker_wager.0,
            wager,
            resolver,
            taker,
            U256::from(bid.maker_deadline.seconds_since_epoch()),
        )
            .abi_encode_params();
        let message_hash = keccak256(&encoded);

        let approve = Approve { messageHash: message_hash, owner: bid.maker.0 };
        let domain = eip712_domain! {
            name: EIP712_DOMAIN_NAME,
            version: EIP712_DOMAIN_VERSION,
            chain_id: chain_id,
            verifying_contract: self.verifying_contract,
        };
        Some(approve.eip712_signing_hash(&domain))
    }

    /// Session path for auction starts. Matches iff session metadata is
    /// attached; an attached-but-invalid session never falls through to the
    /// other strategies.
    fn session_strategy(
        &self,
        req: &AuctionRequest,
        message: &str,
        signature: &Signature,
        taker: Address,
    ) -> Result<StrategyOutcome, VerifyError> {
        let Some(metadata) = req.session_metadata.as_ref() else {
            return Ok(StrategyOutcome::UNMATCHED);
        };
        let now = UnixTimestamp::try_now().map_err(|_| VerifyError::Clock)?;
        if now > metadata.session_expires_at {
            return Ok(StrategyOutcome::decided(false));
        }
        let Ok(session_key) = metadata.session_key_address.parse::<Address>() else {
            return Ok(StrategyOutcome::decided(false));
        };
        let Ok(recovered) = signature.recover_address_from_msg(message.as_bytes()) else {
            return Ok(StrategyOutcome::decided(false));
        };
        if recovered != session_key {
            return Ok(StrategyOutcome::decided(false));
        }
        let accepted = self.session_metadata_binds(metadata, session_key, taker, req.chain_id);
        Ok(StrategyOutcome::decided(accepted))
    }

    fn session_metadata_binds(
        &self,
        metadata: &SessionMetadata,
        session_key: Address,
        account: Address,
        chain_id: u64,
    ) -> bool {
        match (metadata.session_typed_data.as_ref(), metadata.session_approval.as_deref()) {
            (Some(typed_data), Some(approval)) => {
                self.session_binding_holds(typed_data, approval, session_key, account, chain_id)
            }
            _ => false,
        }
    }

    /// Check an owner-signed Enable approval binding `session_key` to
    /// `account`: the typed data must name the same chain, account, and
    /// session key, and its signer must be the account or its owner.
    fn session_binding_holds(
        &self,
        typed_data: &serde_json::Value,
        approval_hex: &str,
        session_key: Address,
        account: Address,
        chain_id: u64,
    ) -> bool {
        let Ok(typed) = serde_json::from_value::<TypedData>(typed_data.clone()) else {
            return false;
        };
        if typed.domain.chain_id != Some(U256::from(chain_id)) {
            return false;
        }
        if typed.domain.verifying_contract != Some(account) {
            return false;
        }
        let Some(claimed_key) = message_address(&typed.message, "sessionKey") else {
            return false;
        };
        let Some(claimed_account) = message_address(&typed.message, "account") else {
            return false;
        };
        if claimed_key != session_key || claimed_account != account {
            return false;
        }
        let Ok(hash) = typed.eip712_signing_hash() else {
            return false;
        };
        let Ok(signature) = parse_signature(approval_hex) else {
            return false;
        };
        let Ok(owner) = signature.recover_address_from_prehash(&hash) else {
            return false;
        };
        owner == account || self.deriver.derive(owner) == account
    }
}

/// The SIWE-shaped message a taker signs to open an auction.
///
/// The `Nonce:` and `Chain ID:` lines are load-bearing; they are re-checked
/// textually after construction.
pub fn auction_start_message(
    req: &AuctionRequest,
    domain: &str,
    uri: &str,
    signed_at: &str,
) -> String {
    let taker_display = req
        .taker_address()
        .map(|a| a.checksummed())
        .unwrap_or_else(|| req.taker.clone());
    let outcome = req.predicted_outcomes.first().map(String::as_str).unwrap_or_default();
    format!(
        "{domain} wants you to sign in with your Ethereum account:\n\
         {taker_display}\n\
         \n\
         Start parlay auction: wager {wager} on outcome {outcome} via resolver {resolver}\n\
         \n\
         URI: {uri}\n\
         Version: 1\n\
         Chain ID: {chain_id}\n\
         Nonce: {nonce}\n\
         Issued At: {signed_at}",
        wager = req.wager,
        resolver = req.resolver,
        chain_id = req.chain_id,
        nonce = req.taker_nonce,
    )
}

/// The canonical message a vault manager signs over a share quote.
/// Exactly five lines, addresses lowercase, timestamp in milliseconds.
pub fn vault_quote_message(
    vault_lower: &str,
    chain_id: u64,
    collateral_per_share: &str,
    timestamp_ms: i64,
) -> String {
    format!(
        "Sapience Vault Share Quote\n\
         Vault: {vault_lower}\n\
         ChainId: {chain_id}\n\
         CollateralPerShare: {collateral_per_share}\n\
         Timestamp: {timestamp_ms}"
    )
}

/// EIP-191 recovery of the signer of a plain-text message; `None` for
/// malformed or unrecoverable signatures.
pub fn recover_eip191(message: &str, signature_hex: &str) -> Option<Address> {
    let signature = parse_signature(signature_hex).ok()?;
    signature.recover_address_from_msg(message.as_bytes()).ok()
}

/// Predicted outcomes arrive as 0x-hex byte strings; anything else is
/// committed as its raw UTF-8 bytes.
fn decode_outcome(outcome: &str) -> Vec<u8> {
    if let Some(stripped) = outcome.strip_prefix("0x") {
        if let Ok(bytes) = hex::decode(stripped) {
            return bytes;
        }
    }
    outcome.as_bytes().to_vec()
}

fn parse_signature(signature_hex: &str) -> Result<Signature, VerifyError> {
    let parsed = SignatureHex::parse(signature_hex).ok_or(VerifyError::MalformedSignature)?;
    Signature::try_from(&parsed.0[..]).map_err(|_| VerifyError::MalformedSignature)
}

fn message_address(message: &serde_json::Value, field: &str) -> Option<Address> {
    message.get(field)?.as_str()?.parse().ok()
}
