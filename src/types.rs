//! Wire types for the auction relayer WebSocket protocol.
//!
//! Client-submitted payloads (`AuctionRequest`, `BidSubmitPayload`,
//! `VaultQuotePublishPayload`) deserialize leniently — signature verification
//! operates on the literal strings a taker signed, so inbound fields stay as
//! strings and are validated after decode, producing the exact error codes of
//! the protocol. Server-emitted messages are the [`ServerMessage`] enum,
//! tagged with `type` and carrying a camelCase `payload`.

use alloy_primitives::{Address, U256, hex};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use crate::timestamp::{UnixMillis, UnixTimestamp};

/// A 20-byte EVM address.
///
/// Deserializes from any-case `0x`-prefixed hex; serializes and displays as
/// lowercase hex, which is the normalized form used in channel keys and
/// outbound quotes. Use [`EvmAddress::checksummed`] where EIP-55 casing is
/// required (the sign-in message body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvmAddress(pub Address);

impl EvmAddress {
    pub fn checksummed(&self) -> String {
        self.0.to_checksum(None)
    }
}

impl FromStr for EvmAddress {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_str(s).map(EvmAddress)
    }
}

impl From<Address> for EvmAddress {
    fn from(value: Address) -> Self {
        EvmAddress(value)
    }
}

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| DeError::custom("invalid EVM address: expected 0x-prefixed 40 hex chars"))
    }
}

/// A stake amount: a nonnegative `u256` carried as a decimal string.
///
/// Zero parses successfully so that structural validation can surface the
/// protocol error code instead of a serde failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WagerAmount(pub U256);

impl WagerAmount {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn parse_decimal(s: &str) -> Option<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        U256::from_str_radix(s, 10).ok().map(WagerAmount)
    }
}

impl Display for WagerAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for WagerAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for WagerAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        WagerAmount::parse_decimal(&s)
            .ok_or_else(|| DeError::custom("wager must be a decimal u256 string"))
    }
}

/// A 65-byte ECDSA signature serialized as a 0x-prefixed 130-hex-char string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureHex(pub [u8; 65]);

static SIG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("valid signature regex"));

impl SignatureHex {
    pub fn parse(s: &str) -> Option<Self> {
        if !SIG_REGEX.is_match(s) {
            return None;
        }
        let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
        let array: [u8; 65] = bytes.try_into().ok()?;
        Some(SignatureHex(array))
    }
}

impl Serialize for SignatureHex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for SignatureHex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SignatureHex::parse(&s)
            .ok_or_else(|| DeError::custom("signature must be 0x-prefixed and 130 hex chars"))
    }
}

/// Protocol error codes, surfaced verbatim in `error` fields of ack messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidSignature,
    SignatureVerificationFailed,
    MissingAuctionId,
    AuctionNotFoundOrExpired,
    QuoteExpired,
    InvalidMaker,
    InvalidMakerWager,
    InvalidMakerBidSignatureFormat,
    InvalidPayload,
    StaleTimestamp,
    BadSignature,
    UnauthorizedSigner,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::SignatureVerificationFailed => "signature_verification_failed",
            ErrorKind::MissingAuctionId => "missing_auction_id",
            ErrorKind::AuctionNotFoundOrExpired => "auction_not_found_or_expired",
            ErrorKind::QuoteExpired => "quote_expired",
            ErrorKind::InvalidMaker => "invalid_maker",
            ErrorKind::InvalidMakerWager => "invalid_maker_wager",
            ErrorKind::InvalidMakerBidSignatureFormat => "invalid_maker_bid_signature_format",
            ErrorKind::InvalidPayload => "invalid_payload",
            ErrorKind::StaleTimestamp => "stale_timestamp",
            ErrorKind::BadSignature => "bad_signature",
            ErrorKind::UnauthorizedSigner => "unauthorized_signer",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let kind = match s.as_str() {
            "invalid_signature" => ErrorKind::InvalidSignature,
            "signature_verification_failed" => ErrorKind::SignatureVerificationFailed,
            "missing_auction_id" => ErrorKind::MissingAuctionId,
            "auction_not_found_or_expired" => ErrorKind::AuctionNotFoundOrExpired,
            "quote_expired" => ErrorKind::QuoteExpired,
            "invalid_maker" => ErrorKind::InvalidMaker,
            "invalid_maker_wager" => ErrorKind::InvalidMakerWager,
            "invalid_maker_bid_signature_format" => ErrorKind::InvalidMakerBidSignatureFormat,
            "invalid_payload" => ErrorKind::InvalidPayload,
            "stale_timestamp" => ErrorKind::StaleTimestamp,
            "bad_signature" => ErrorKind::BadSignature,
            "unauthorized_signer" => ErrorKind::UnauthorizedSigner,
            "internal_error" => ErrorKind::InternalError,
            other => return Err(DeError::custom(format!("unknown error kind: {other}"))),
        };
        Ok(kind)
    }
}

/// Session-key delegation attached to an auction request.
///
/// The session key signs the auction-start message directly; the approval and
/// typed data carry the owner's authorization binding the session key to the
/// taker account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_key_address: String,
    pub session_expires_at: UnixTimestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_approval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_typed_data: Option<serde_json::Value>,
}

/// What a taker submits to open an auction.
///
/// Numeric stakes stay as the literal strings the taker signed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionRequest {
    pub wager: String,
    pub predicted_outcomes: Vec<String>,
    pub resolver: String,
    pub taker: String,
    pub taker_nonce: u64,
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_signed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_metadata: Option<SessionMetadata>,
}

impl AuctionRequest {
    /// Structural validity independent of any signature.
    pub fn validate(&self) -> Result<(), ErrorKind> {
        let wager = WagerAmount::parse_decimal(&self.wager).ok_or(ErrorKind::InvalidPayload)?;
        if wager.is_zero() {
            return Err(ErrorKind::InvalidPayload);
        }
        if self.predicted_outcomes.is_empty()
            || self.predicted_outcomes.iter().any(|o| o.is_empty())
        {
            return Err(ErrorKind::InvalidPayload);
        }
        if self.resolver.parse::<EvmAddress>().is_err() || self.taker.parse::<EvmAddress>().is_err()
        {
            return Err(ErrorKind::InvalidPayload);
        }
        if self.chain_id == 0 {
            return Err(ErrorKind::InvalidPayload);
        }
        Ok(())
    }

    pub fn taker_address(&self) -> Option<EvmAddress> {
        self.taker.parse().ok()
    }
}

/// A registered auction: the request plus identity and creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auction {
    pub auction_id: String,
    #[serde(flatten)]
    pub request: AuctionRequest,
    pub created_at: UnixTimestamp,
}

/// A validated maker bid as stored and rebroadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
    pub auction_id: String,
    pub maker: EvmAddress,
    pub maker_wager: WagerAmount,
    pub maker_deadline: UnixTimestamp,
    pub maker_signature: String,
    pub maker_nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_approval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_typed_data: Option<serde_json::Value>,
}

/// Raw `bid.submit` payload before structural validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidSubmitPayload {
    #[serde(default)]
    pub auction_id: String,
    #[serde(default)]
    pub maker: String,
    #[serde(default)]
    pub maker_wager: String,
    #[serde(default)]
    pub maker_deadline: i64,
    #[serde(default)]
    pub maker_signature: String,
    #[serde(default)]
    pub maker_nonce: u64,
    #[serde(default)]
    pub session_approval: Option<String>,
    #[serde(default)]
    pub session_typed_data: Option<serde_json::Value>,
}

impl BidSubmitPayload {
    /// Structural checks, in protocol order. A deadline equal to `now` is
    /// already expired.
    pub fn validate(self, now: UnixTimestamp) -> Result<Bid, ErrorKind> {
        let maker: EvmAddress = self.maker.parse().map_err(|_| ErrorKind::InvalidMaker)?;
        let maker_wager =
            WagerAmount::parse_decimal(&self.maker_wager).ok_or(ErrorKind::InvalidMakerWager)?;
        if maker_wager.is_zero() {
            return Err(ErrorKind::InvalidMakerWager);
        }
        if self.maker_deadline <= now.seconds_since_epoch() as i64 {
            return Err(ErrorKind::QuoteExpired);
        }
        if !is_plausible_signature_hex(&self.maker_signature) {
            return Err(ErrorKind::InvalidMakerBidSignatureFormat);
        }
        Ok(Bid {
            auction_id: self.auction_id,
            maker,
            maker_wager,
            maker_deadline: UnixTimestamp(self.maker_deadline as u64),
            maker_signature: self.maker_signature,
            maker_nonce: self.maker_nonce,
            session_approval: self.session_approval,
            session_typed_data: self.session_typed_data,
        })
    }
}

/// Minimum shape for a bid signature field: 0x-prefixed hex, at least 10
/// chars total. Full 65-byte parsing happens in the verifier.
fn is_plausible_signature_hex(s: &str) -> bool {
    s.len() >= 10
        && s.starts_with("0x")
        && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// A stored vault share-price quote, addresses normalized to lowercase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultQuote {
    pub chain_id: u64,
    pub vault_address: String,
    pub vault_collateral_per_share: String,
    pub timestamp: UnixMillis,
    pub signed_by: String,
    pub signature: String,
}

/// Raw `vault_quote.publish` payload before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultQuotePublishPayload {
    #[serde(default)]
    pub chain_id: u64,
    #[serde(default)]
    pub vault_address: String,
    #[serde(default)]
    pub vault_collateral_per_share: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub signed_by: String,
    #[serde(default)]
    pub signature: String,
}

impl VaultQuotePublishPayload {
    pub fn is_complete(&self) -> bool {
        self.chain_id != 0
            && self.vault_address.parse::<EvmAddress>().is_ok()
            && !self.vault_collateral_per_share.is_empty()
            && self.timestamp != 0
            && self.signed_by.parse::<EvmAddress>().is_ok()
            && !self.signature.is_empty()
    }
}

/// Payload of `vault_quote.subscribe` / `vault_quote.unsubscribe`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultChannelPayload {
    pub chain_id: u64,
    pub vault_address: String,
}

/// Payload of `auction.subscribe` / `auction.unsubscribe`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionChannelPayload {
    #[serde(default)]
    pub auction_id: String,
}

/// The `{type, payload, id?}` envelope every client frame must carry.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub id: Option<String>,
}

/// Dispatch table of client message types. Unrecognized types land on
/// [`MessageKind::Unknown`] and are counted, not answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    AuctionStart,
    AuctionSubscribe,
    AuctionUnsubscribe,
    BidSubmit,
    VaultQuoteObserve,
    VaultQuoteUnobserve,
    VaultQuoteSubscribe,
    VaultQuoteUnsubscribe,
    VaultQuotePublish,
    Unknown,
}

impl MessageKind {
    pub fn from_type(msg_type: &str) -> Self {
        match msg_type {
            "ping" => MessageKind::Ping,
            "auction.start" => MessageKind::AuctionStart,
            "auction.subscribe" => MessageKind::AuctionSubscribe,
            "auction.unsubscribe" => MessageKind::AuctionUnsubscribe,
            "bid.submit" => MessageKind::BidSubmit,
            "vault_quote.observe" => MessageKind::VaultQuoteObserve,
            "vault_quote.unobserve" => MessageKind::VaultQuoteUnobserve,
            "vault_quote.subscribe" => MessageKind::VaultQuoteSubscribe,
            "vault_quote.unsubscribe" => MessageKind::VaultQuoteUnsubscribe,
            // `submit` is a legacy alias kept for older maker clients.
            "vault_quote.publish" | "vault_quote.submit" => MessageKind::VaultQuotePublish,
            _ => MessageKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionAck {
    pub auction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribed: Option<bool>,
}

impl AuctionAck {
    pub fn started(auction_id: String, id: Option<String>) -> Self {
        Self { auction_id, id, error: None, subscribed: None, unsubscribed: None }
    }

    pub fn rejected(error: ErrorKind, id: Option<String>) -> Self {
        Self { auction_id: String::new(), id, error: Some(error), subscribed: None, unsubscribed: None }
    }

    pub fn subscribed(auction_id: String, id: Option<String>) -> Self {
        Self { auction_id, id, error: None, subscribed: Some(true), unsubscribed: None }
    }

    pub fn unsubscribed(auction_id: String, id: Option<String>) -> Self {
        Self { auction_id, id, error: None, subscribed: None, unsubscribed: Some(true) }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultQuoteAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl VaultQuoteAck {
    pub fn ok(id: Option<String>) -> Self {
        Self { ok: Some(true), id, error: None }
    }

    pub fn rejected(error: ErrorKind, id: Option<String>) -> Self {
        Self { ok: None, id, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidsSnapshot {
    pub auction_id: String,
    pub bids: Vec<Bid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultQuoteRequested {
    pub chain_id: u64,
    pub vault_address: String,
    pub channel: String,
}

/// Every message the relayer emits, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "pong")]
    Pong { payload: EmptyPayload },
    #[serde(rename = "auction.ack")]
    AuctionAck { payload: AuctionAck },
    #[serde(rename = "auction.started")]
    AuctionStarted { payload: Auction },
    #[serde(rename = "auction.bids")]
    AuctionBids { payload: BidsSnapshot },
    #[serde(rename = "bid.ack")]
    BidAck { payload: BidAck },
    #[serde(rename = "vault_quote.ack")]
    VaultQuoteAck { payload: VaultQuoteAck },
    #[serde(rename = "vault_quote.update")]
    VaultQuoteUpdate { payload: VaultQuote },
    #[serde(rename = "vault_quote.requested")]
    VaultQuoteRequested { payload: VaultQuoteRequested },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bid_payload() -> BidSubmitPayload {
        BidSubmitPayload {
            auction_id: "a-1".to_string(),
            maker: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".to_string(),
            maker_wager: "500000000000000000".to_string(),
            maker_deadline: 4_102_444_800, // far future
            maker_signature: format!("0x{}", "ab".repeat(65)),
            maker_nonce: 0,
            session_approval: None,
            session_typed_data: None,
        }
    }

    #[test]
    fn address_serializes_lowercase() {
        let addr: EvmAddress = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".parse().expect("parses");
        assert_eq!(
            serde_json::to_string(&addr).expect("serializes"),
            "\"0x70997970c51812dc3a010c7d01b50e0d17dc79c8\""
        );
        assert_eq!(addr.checksummed(), "0x70997970C51812dc3A010C7d01b50e0d17dc79C8");
    }

    #[test]
    fn wager_rejects_non_decimal() {
        assert!(WagerAmount::parse_decimal("0x10").is_none());
        assert!(WagerAmount::parse_decimal("-5").is_none());
        assert!(WagerAmount::parse_decimal("").is_none());
        assert!(WagerAmount::parse_decimal("1000000000000000000").is_some());
    }

    #[test]
    fn bid_validation_orders_error_codes() {
        let now = UnixTimestamp(1_700_000_000);

        let mut bad_maker = sample_bid_payload();
        bad_maker.maker = "not-an-address".to_string();
        assert_eq!(bad_maker.validate(now).unwrap_err(), ErrorKind::InvalidMaker);

        let mut zero_wager = sample_bid_payload();
        zero_wager.maker_wager = "0".to_string();
        assert_eq!(zero_wager.validate(now).unwrap_err(), ErrorKind::InvalidMakerWager);

        let mut expired = sample_bid_payload();
        expired.maker_deadline = now.seconds_since_epoch() as i64;
        assert_eq!(expired.validate(now).unwrap_err(), ErrorKind::QuoteExpired);

        let mut short_sig = sample_bid_payload();
        short_sig.maker_signature = "0xabcd".to_string();
        assert_eq!(
            short_sig.validate(now).unwrap_err(),
            ErrorKind::InvalidMakerBidSignatureFormat
        );

        assert!(sample_bid_payload().validate(now).is_ok());
    }

    #[test]
    fn unknown_type_is_first_class() {
        assert_eq!(MessageKind::from_type("auction.start"), MessageKind::AuctionStart);
        assert_eq!(MessageKind::from_type("vault_quote.submit"), MessageKind::VaultQuotePublish);
        assert_eq!(MessageKind::from_type("definitely.not"), MessageKind::Unknown);
    }

    #[test]
    fn ack_omits_absent_fields() {
        let msg = ServerMessage::AuctionAck {
            payload: AuctionAck::rejected(ErrorKind::InvalidSignature, None),
        };
        let json = serde_json::to_value(&msg).expect("serializes");
        assert_eq!(json["type"], "auction.ack");
        assert_eq!(json["payload"]["auctionId"], "");
        assert_eq!(json["payload"]["error"], "invalid_signature");
        assert!(json["payload"].get("subscribed").is_none());
    }

    #[test]
    fn envelope_tolerates_missing_payload() {
        let env: Envelope = serde_json::from_str(r#"{"type":"ping"}"#).expect("parses");
        assert_eq!(env.msg_type, "ping");
        assert!(env.id.is_none());
    }
}
