//! In-memory stores: auctions, per-auction ordered bid lists, latest vault
//! quotes, and the authorized-signer cache.
//!
//! The registry owns all auction state. Bid insertion and quote replacement
//! run inside a per-key critical section that callers can extend with their
//! fanout (`add_bid_with`, `put_vault_quote_with`), which is what keeps
//! broadcast order equal to insertion order without a global lock.
//!
//! Nothing here is durable: auctions are garbage-collected once every bid
//! deadline and the configured TTL have passed, and the process forgets
//! everything on exit.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::chain::ChainClient;
use crate::timestamp::UnixTimestamp;
use crate::types::{Auction, AuctionRequest, Bid, VaultQuote};

/// `(chainId, lowercase vault address)`.
pub type VaultKey = (u64, String);

/// How long a fetched authorized-signer set stays fresh.
const SIGNER_CACHE_TTL: Duration = Duration::from_secs(60);

struct AuctionEntry {
    auction: Auction,
    state: Mutex<AuctionState>,
}

struct AuctionState {
    bids: Vec<Bid>,
    /// Largest maker deadline seen, in unix seconds. Extends the auction's
    /// lifetime beyond the base TTL.
    latest_deadline: u64,
}

#[derive(Clone)]
struct SignerCacheEntry {
    signers: Vec<String>,
    fetched_at: Instant,
}

pub struct Registry {
    auctions: DashMap<String, Arc<AuctionEntry>>,
    vault_quotes: DashMap<VaultKey, Arc<Mutex<Option<VaultQuote>>>>,
    signer_cache: DashMap<VaultKey, SignerCacheEntry>,
    chain: Arc<dyn ChainClient>,
    auction_ttl: Duration,
}

impl Registry {
    pub fn new(chain: Arc<dyn ChainClient>, auction_ttl: Duration) -> Self {
        Self {
            auctions: DashMap::new(),
            vault_quotes: DashMap::new(),
            signer_cache: DashMap::new(),
            chain,
            auction_ttl,
        }
    }

    /// Register an auction under a fresh UUIDv4. Auctions are never updated
    /// after creation.
    pub fn upsert_auction(&self, request: AuctionRequest) -> Auction {
        let created_at = UnixTimestamp::try_now().unwrap_or(UnixTimestamp(0));
        self.insert_auction(request, created_at)
    }

    fn insert_auction(&self, request: AuctionRequest, created_at: UnixTimestamp) -> Auction {
        let auction = Auction {
            auction_id: Uuid::new_v4().to_string(),
            request,
            created_at,
        };
        let entry = Arc::new(AuctionEntry {
            auction: auction.clone(),
            state: Mutex::new(AuctionState { bids: Vec::new(), latest_deadline: 0 }),
        });
        self.auctions.insert(auction.auction_id.clone(), entry);
        auction
    }

    #[cfg(test)]
    pub fn insert_auction_created_at(
        &self,
        request: AuctionRequest,
        created_at: UnixTimestamp,
    ) -> Auction {
        self.insert_auction(request, created_at)
    }

    pub fn get_auction(&self, auction_id: &str) -> Option<Auction> {
        let entry = self.live_entry(auction_id)?;
        Some(entry.auction.clone())
    }

    /// Append `bid` and run `f` over the updated bid list while still inside
    /// the auction's critical section. Returns `None` if the auction does
    /// not exist or has expired; validation must already have passed.
    pub fn add_bid_with<R>(
        &self,
        auction_id: &str,
        bid: Bid,
        f: impl FnOnce(&[Bid]) -> R,
    ) -> Option<R> {
        let entry = self.live_entry(auction_id)?;
        let mut state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
        state.latest_deadline = state.latest_deadline.max(bid.maker_deadline.seconds_since_epoch());
        state.bids.push(bid);
        Some(f(&state.bids))
    }

    /// Append-only bid insertion; returns the stored bid.
    pub fn add_bid(&self, auction_id: &str, bid: Bid) -> Option<Bid> {
        self.add_bid_with(auction_id, bid, |bids| bids.last().cloned())?
    }

    /// A stable snapshot of the auction's bids, in insertion order.
    pub fn get_bids(&self, auction_id: &str) -> Vec<Bid> {
        let Some(entry) = self.live_entry(auction_id) else {
            return Vec::new();
        };
        let state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
        state.bids.clone()
    }

    fn live_entry(&self, auction_id: &str) -> Option<Arc<AuctionEntry>> {
        let entry = self.auctions.get(auction_id)?.clone();
        if self.is_expired(&entry) {
            drop(self.auctions.remove(auction_id));
            return None;
        }
        Some(entry)
    }

    fn is_expired(&self, entry: &AuctionEntry) -> bool {
        let now = match UnixTimestamp::try_now() {
            Ok(now) => now.seconds_since_epoch(),
            // Unreadable clock: keep the auction rather than dropping state.
            Err(_) => return false,
        };
        let latest_deadline = {
            let state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
            state.latest_deadline
        };
        let ttl_cutoff =
            entry.auction.created_at.seconds_since_epoch() + self.auction_ttl.as_secs();
        now > latest_deadline.max(ttl_cutoff)
    }

    /// Drop every expired auction; returns how many were collected.
    pub fn sweep_expired(&self) -> usize {
        let before = self.auctions.len();
        self.auctions.retain(|_, entry| !self.is_expired(entry));
        before - self.auctions.len()
    }

    /// Store `quote` as the latest for its key and run `f` inside the same
    /// critical section, so fanout order matches replacement order.
    pub fn put_vault_quote_with<R>(
        &self,
        key: VaultKey,
        quote: VaultQuote,
        f: impl FnOnce(&VaultQuote) -> R,
    ) -> R {
        let slot = self.vault_quotes.entry(key).or_insert_with(Default::default).clone();
        let mut latest = slot.lock().unwrap_or_else(|e| e.into_inner());
        *latest = Some(quote.clone());
        f(&quote)
    }

    pub fn latest_vault_quote(&self, key: &VaultKey) -> Option<VaultQuote> {
        let slot = self.vault_quotes.get(key)?.clone();
        let latest = slot.lock().unwrap_or_else(|e| e.into_inner());
        latest.clone()
    }

    /// The authorized quote publishers for a vault, refreshed from the
    /// vault's `manager()` when the cached set is older than a minute. A
    /// failed refresh keeps serving the stale set rather than flapping.
    pub async fn authorized_signers(&self, key: &VaultKey) -> Vec<String> {
        if let Some(entry) = self.signer_cache.get(key) {
            if entry.fetched_at.elapsed() < SIGNER_CACHE_TTL {
                return entry.signers.clone();
            }
        }
        let Ok(vault) = key.1.parse() else {
            return Vec::new();
        };
        match self.chain.read_vault_manager(key.0, vault).await {
            Some(manager) => {
                let signers = vec![format!("{manager:#x}")];
                self.signer_cache.insert(
                    key.clone(),
                    SignerCacheEntry { signers: signers.clone(), fetched_at: Instant::now() },
                );
                signers
            }
            None => {
                tracing::warn!(chain_id = key.0, vault = %key.1, "manager() fetch failed");
                self.signer_cache
                    .get(key)
                    .map(|entry| entry.signers.clone())
                    .unwrap_or_default()
            }
        }
    }

    pub fn auction_count(&self) -> usize {
        self.auctions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StaticChainClient;
    use crate::types::{EvmAddress, WagerAmount};
    use alloy_primitives::{U256, address};

    const TTL: Duration = Duration::from_secs(600);

    fn registry() -> Registry {
        Registry::new(Arc::new(StaticChainClient::new()), TTL)
    }

    fn request() -> AuctionRequest {
        AuctionRequest {
            wager: "1000000000000000000".to_string(),
            predicted_outcomes: vec!["0xdeadbeef".to_string()],
            resolver: "0x1234567890123456789012345678901234567890".to_string(),
            taker: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            taker_nonce: 1,
            chain_id: 42161,
            taker_signature: None,
            taker_signed_at: None,
            session_metadata: None,
        }
    }

    fn bid(auction_id: &str, nonce: u64, deadline: u64) -> Bid {
        Bid {
            auction_id: auction_id.to_string(),
            maker: EvmAddress(address!("70997970C51812dc3A010C7d01b50e0d17dc79C8")),
            maker_wager: WagerAmount(U256::from(500u64)),
            maker_deadline: UnixTimestamp(deadline),
            maker_signature: format!("0x{}", "ab".repeat(65)),
            maker_nonce: nonce,
            session_approval: None,
            session_typed_data: None,
        }
    }

    fn far_future() -> u64 {
        UnixTimestamp::try_now().expect("clock").seconds_since_epoch() + 3600
    }

    #[test]
    fn auction_ids_are_uuidv4() {
        let registry = registry();
        let auction = registry.upsert_auction(request());
        let parsed = Uuid::parse_str(&auction.auction_id).expect("uuid");
        assert_eq!(parsed.get_version_num(), 4);
        assert!(registry.get_auction(&auction.auction_id).is_some());
    }

    #[test]
    fn bids_keep_insertion_order_and_snapshots_are_stable() {
        let registry = registry();
        let auction = registry.upsert_auction(request());
        let deadline = far_future();

        for nonce in 0..3 {
            assert!(registry.add_bid(&auction.auction_id, bid(&auction.auction_id, nonce, deadline)).is_some());
        }
        let snapshot = registry.get_bids(&auction.auction_id);
        assert_eq!(snapshot.iter().map(|b| b.maker_nonce).collect::<Vec<_>>(), vec![0, 1, 2]);

        registry.add_bid(&auction.auction_id, bid(&auction.auction_id, 3, deadline));
        // The earlier snapshot must not observe the later insertion.
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.get_bids(&auction.auction_id).len(), 4);
    }

    #[test]
    fn add_bid_on_unknown_auction_is_none() {
        let registry = registry();
        assert!(registry.add_bid("non-existent-auction-id", bid("non-existent-auction-id", 0, far_future())).is_none());
    }

    #[test]
    fn ttl_expiry_collects_auction() {
        let registry = registry();
        let created = UnixTimestamp(
            UnixTimestamp::try_now().expect("clock").seconds_since_epoch() - TTL.as_secs() - 10,
        );
        let auction = registry.insert_auction_created_at(request(), created);
        assert!(registry.get_auction(&auction.auction_id).is_none());
        assert_eq!(registry.auction_count(), 0);
    }

    #[test]
    fn open_bid_deadline_extends_lifetime_past_ttl() {
        let registry = Registry::new(Arc::new(StaticChainClient::new()), Duration::from_secs(1));
        let extended = registry.upsert_auction(request());
        registry
            .add_bid(&extended.auction_id, bid(&extended.auction_id, 0, far_future()))
            .expect("auction is live");
        let stale = registry.upsert_auction(request());

        std::thread::sleep(Duration::from_millis(2100));
        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.get_auction(&extended.auction_id).is_some());
        assert!(registry.get_auction(&stale.auction_id).is_none());
    }

    #[test]
    fn latest_vault_quote_is_replaced_per_key() {
        let registry = registry();
        let key: VaultKey = (8453, "0x2222222222222222222222222222222222222222".to_string());
        let quote = |price: &str| VaultQuote {
            chain_id: key.0,
            vault_address: key.1.clone(),
            vault_collateral_per_share: price.to_string(),
            timestamp: crate::timestamp::UnixMillis(1_700_000_000_000),
            signed_by: "0x3333333333333333333333333333333333333333".to_string(),
            signature: format!("0x{}", "cd".repeat(65)),
        };

        assert!(registry.latest_vault_quote(&key).is_none());
        let seen = registry.put_vault_quote_with(key.clone(), quote("1000000"), |q| {
            q.vault_collateral_per_share.clone()
        });
        assert_eq!(seen, "1000000");
        registry.put_vault_quote_with(key.clone(), quote("1000050"), |_| ());
        let latest = registry.latest_vault_quote(&key).expect("stored");
        assert_eq!(latest.vault_collateral_per_share, "1000050");
    }

    #[tokio::test]
    async fn authorized_signers_come_from_vault_manager_lowercased() {
        let vault = address!("2222222222222222222222222222222222222222");
        let manager = address!("AbCd111111111111111111111111111111111111");
        let chain = StaticChainClient::new().with_manager(8453, vault, manager);
        let registry = Registry::new(Arc::new(chain), TTL);

        let key: VaultKey = (8453, format!("{vault:#x}"));
        let signers = registry.authorized_signers(&key).await;
        assert_eq!(signers, vec!["0xabcd111111111111111111111111111111111111".to_string()]);

        // Unknown vault fails closed to an empty set.
        let unknown: VaultKey = (8453, "0x4444444444444444444444444444444444444444".to_string());
        assert!(registry.authorized_signers(&unknown).await.is_empty());
    }
}
