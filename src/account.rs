//! Deterministic smart-account address derivation.
//!
//! Takers and makers may sign with the EOA that owns a not-yet-deployed
//! kernel v3.1 smart account (ECDSA root validator, entrypoint v0.7). The
//! account address is fully determined by the owner: the factory deploys an
//! ERC-1967 proxy via CREATE2, salted with the kernel `initialize` calldata
//! that embeds the validator identifier and the owner. Reproducing that
//! computation here lets the relayer accept counterfactual accounts without
//! touching the chain.

use alloy_primitives::{Address, B256, Bytes, FixedBytes, address, fixed_bytes, keccak256};
use alloy_sol_types::{SolCall, sol};
use dashmap::DashMap;

sol! {
    /// Kernel v3.1 account initializer. `rootValidator` is a 21-byte
    /// identifier: a one-byte validator-type tag followed by the module
    /// address.
    function initialize(
        bytes21 rootValidator,
        address hook,
        bytes validatorData,
        bytes hookData,
        bytes[] initConfig
    );
}

/// Kernel v3.1 account factory.
pub const KERNEL_FACTORY: Address = address!("aac5D4240AF87249B3f71BC8E4A2cae074A3E419");

/// Kernel v3.1 implementation behind each ERC-1967 proxy.
pub const KERNEL_IMPLEMENTATION: Address = address!("BAC849bB641841b44E965fB01A4Bf5F074f84b4D");

/// ECDSA root validator module.
pub const ECDSA_VALIDATOR: Address = address!("845ADb2C711129d4f3966735eD98a9F09fC4cE57");

/// Validator-type tag for validator modules in the kernel identifier scheme.
const VALIDATOR_TYPE_MODULE: u8 = 0x01;

/// Account index within the factory; the relayer always derives index zero.
const ACCOUNT_INDEX: B256 = B256::ZERO;

/// ERC-1967 minimal-proxy creation code, split around the embedded
/// implementation address (Solady `LibClone` layout).
const PROXY_CODE_PREFIX: FixedBytes<9> = fixed_bytes!("603d3d8160223d3973");
const PROXY_CODE_SUFFIX: FixedBytes<66> = fixed_bytes!(
    "60095155f3363d3d373d3d363d7f360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc545af43d6000803e6038573d6000fd5b3d6000f3"
);

/// Pure derivation of kernel v3.1 account addresses with a process-wide
/// memo. Entries are immutable once written; concurrent readers are safe.
#[derive(Debug, Default)]
pub struct AddressDeriver {
    cache: DashMap<Address, Address>,
}

impl AddressDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The smart-account address owned by `owner`, memoized.
    pub fn derive(&self, owner: Address) -> Address {
        if let Some(hit) = self.cache.get(&owner) {
            return *hit;
        }
        let derived = derive_account_address(owner);
        self.cache.insert(owner, derived);
        derived
    }
}

/// CREATE2 address of the ERC-1967 proxy the factory would deploy for
/// `owner`: `create2(factory, keccak(initData ++ index), keccak(proxyCode))`.
fn derive_account_address(owner: Address) -> Address {
    let mut root_validator = [0u8; 21];
    root_validator[0] = VALIDATOR_TYPE_MODULE;
    root_validator[1..].copy_from_slice(ECDSA_VALIDATOR.as_slice());

    let init_data = initializeCall {
        rootValidator: FixedBytes(root_validator),
        hook: Address::with_last_byte(1),
        validatorData: Bytes::copy_from_slice(owner.as_slice()),
        hookData: Bytes::new(),
        initConfig: Vec::new(),
    }
    .abi_encode();

    let mut salt_preimage = init_data;
    salt_preimage.extend_from_slice(ACCOUNT_INDEX.as_slice());
    let salt = keccak256(&salt_preimage);

    let mut proxy_code =
        Vec::with_capacity(PROXY_CODE_PREFIX.len() + Address::len_bytes() + PROXY_CODE_SUFFIX.len());
    proxy_code.extend_from_slice(PROXY_CODE_PREFIX.as_slice());
    proxy_code.extend_from_slice(KERNEL_IMPLEMENTATION.as_slice());
    proxy_code.extend_from_slice(PROXY_CODE_SUFFIX.as_slice());

    KERNEL_FACTORY.create2(salt, keccak256(&proxy_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER_A: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    const OWNER_B: Address = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(derive_account_address(OWNER_A), derive_account_address(OWNER_A));
    }

    #[test]
    fn distinct_owners_get_distinct_accounts() {
        assert_ne!(derive_account_address(OWNER_A), derive_account_address(OWNER_B));
    }

    #[test]
    fn derived_account_differs_from_owner() {
        assert_ne!(derive_account_address(OWNER_A), OWNER_A);
    }

    #[test]
    fn cache_returns_same_address() {
        let deriver = AddressDeriver::new();
        let first = deriver.derive(OWNER_A);
        let second = deriver.derive(OWNER_A);
        assert_eq!(first, second);
        assert_eq!(first, derive_account_address(OWNER_A));
    }
}
