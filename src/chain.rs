//! Read-only chain access for signature verification and vault authority.
//!
//! Every operation fails closed: an RPC error, a missing provider for the
//! requested chain, or a deadline overrun reads as "no code" / "invalid" /
//! "unknown manager". The relayer never submits transactions.

use alloy_primitives::{Address, B256, Bytes, FixedBytes, fixed_bytes};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_sol_types::sol;
use alloy_transport_http::Http;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

sol! {
    #[sol(rpc)]
    interface IErc1271 {
        function isValidSignature(bytes32 _hash, bytes _signature) external view returns (bytes4);
    }

    #[sol(rpc)]
    interface IVault {
        function manager() external view returns (address);
    }
}

/// Selector returned by a compliant `isValidSignature` implementation.
pub const EIP1271_MAGIC_VALUE: FixedBytes<4> = fixed_bytes!("1626ba7e");

/// Upper bound on any single RPC call.
const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(3);

/// Read operations keyed by `(chainId, address)`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// True iff the account has nonempty deployed bytecode.
    async fn has_code(&self, chain_id: u64, address: Address) -> bool;

    /// True iff the contract at `address` acknowledges `signature` over
    /// `message_hash` with the ERC-1271 magic value.
    async fn verify_eip1271(
        &self,
        chain_id: u64,
        address: Address,
        message_hash: B256,
        signature: &[u8],
    ) -> bool;

    /// The vault's `manager()`, if reachable.
    async fn read_vault_manager(&self, chain_id: u64, vault: Address) -> Option<Address>;
}

/// JSON-RPC backed [`ChainClient`] with one HTTP provider per configured
/// chain.
pub struct RpcChainClient {
    providers: HashMap<u64, RootProvider>,
    call_deadline: Duration,
}

impl RpcChainClient {
    pub fn new(rpc_urls: &HashMap<u64, Url>) -> Self {
        let mut providers = HashMap::new();
        for (chain_id, url) in rpc_urls {
            let client = RpcClient::new(Http::new(url.clone()), false);
            providers.insert(*chain_id, RootProvider::new(client));
            tracing::info!(chain_id, rpc_url = %url, "Initialized read-only provider");
        }
        Self {
            providers,
            call_deadline: DEFAULT_CALL_DEADLINE,
        }
    }

    fn provider(&self, chain_id: u64) -> Option<&RootProvider> {
        let provider = self.providers.get(&chain_id);
        if provider.is_none() {
            tracing::debug!(chain_id, "No provider configured for chain");
        }
        provider
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn has_code(&self, chain_id: u64, address: Address) -> bool {
        let Some(provider) = self.provider(chain_id) else {
            return false;
        };
        let call = provider.get_code_at(address);
        match tokio::time::timeout(self.call_deadline, call.into_future()).await {
            Ok(Ok(code)) => !code.is_empty(),
            Ok(Err(error)) => {
                tracing::debug!(chain_id, %address, ?error, "getCode failed");
                false
            }
            Err(_) => {
                tracing::debug!(chain_id, %address, "getCode deadline exceeded");
                false
            }
        }
    }

    async fn verify_eip1271(
        &self,
        chain_id: u64,
        address: Address,
        message_hash: B256,
        signature: &[u8],
    ) -> bool {
        let Some(provider) = self.provider(chain_id) else {
            return false;
        };
        let contract = IErc1271::new(address, provider);
        let call = contract.isValidSignature(message_hash, Bytes::copy_from_slice(signature));
        match tokio::time::timeout(self.call_deadline, call.call()).await {
            Ok(Ok(selector)) => selector == EIP1271_MAGIC_VALUE,
            Ok(Err(error)) => {
                tracing::debug!(chain_id, %address, ?error, "isValidSignature reverted");
                false
            }
            Err(_) => {
                tracing::debug!(chain_id, %address, "isValidSignature deadline exceeded");
                false
            }
        }
    }

    async fn read_vault_manager(&self, chain_id: u64, vault: Address) -> Option<Address> {
        let provider = self.provider(chain_id)?;
        let contract = IVault::new(vault, provider);
        match tokio::time::timeout(self.call_deadline, contract.manager().call()).await {
            Ok(Ok(manager)) => Some(manager),
            Ok(Err(error)) => {
                tracing::debug!(chain_id, %vault, ?error, "manager() call failed");
                None
            }
            Err(_) => {
                tracing::debug!(chain_id, %vault, "manager() deadline exceeded");
                None
            }
        }
    }
}

/// Canned [`ChainClient`] for tests: no sockets, no time.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticChainClient {
    code: std::collections::HashSet<(u64, Address)>,
    valid_eip1271: std::collections::HashSet<(u64, Address)>,
    managers: HashMap<(u64, Address), Address>,
}

#[cfg(test)]
impl StaticChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, chain_id: u64, address: Address) -> Self {
        self.code.insert((chain_id, address));
        self
    }

    pub fn with_valid_eip1271(mut self, chain_id: u64, address: Address) -> Self {
        self.valid_eip1271.insert((chain_id, address));
        self
    }

    pub fn with_manager(mut self, chain_id: u64, vault: Address, manager: Address) -> Self {
        self.managers.insert((chain_id, vault), manager);
        self
    }
}

#[cfg(test)]
#[async_trait]
impl ChainClient for StaticChainClient {
    async fn has_code(&self, chain_id: u64, address: Address) -> bool {
        self.code.contains(&(chain_id, address))
    }

    async fn verify_eip1271(
        &self,
        chain_id: u64,
        address: Address,
        _message_hash: B256,
        _signature: &[u8],
    ) -> bool {
        self.valid_eip1271.contains(&(chain_id, address))
    }

    async fn read_vault_manager(&self, chain_id: u64, vault: Address) -> Option<Address> {
        self.managers.get(&(chain_id, vault)).copied()
    }
}
