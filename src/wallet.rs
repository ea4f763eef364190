//! Deterministic smart wallets.
//!
//! The wallet of an owner is an ERC-1167 minimal proxy of the chain's wallet implementation,
//! deployed by the chain's factory with CREATE2. Its address is therefore known before it is
//! deployed, and identical on every chain sharing the same factory and implementation.
//!
//! Calls are executed through the wallet's ERC-7579 `execute(bytes32,bytes)` entry point.

use crate::chains::ChainSpec;
use alloy::{
    primitives::{Address, B256, Bytes, U256, b256, bytes, keccak256},
    providers::Provider,
    sol,
    sol_types::{SolCall, SolValue},
    transports::TransportResult,
};

sol! {
    /// A single call in an ERC-7579 batch.
    #[derive(Debug, PartialEq, Eq)]
    struct Execution {
        address target;
        uint256 value;
        bytes callData;
    }

    /// Factory deploying wallets for owners.
    interface IWalletFactory {
        function createAccount(address owner, bytes32 salt) external returns (address account);
    }

    /// ERC-7579 execution entry point of the wallet.
    interface ISmartWallet {
        function execute(bytes32 mode, bytes calldata executionCalldata) external payable;
    }
}

/// Execution mode of a single call: call type `0x00`, default exec type, no selector or payload.
pub const SINGLE_CALL_MODE: B256 = B256::ZERO;

/// Execution mode of a batch: call type `0x01`, default exec type, no selector or payload.
pub const BATCH_CALL_MODE: B256 =
    b256!("0x0100000000000000000000000000000000000000000000000000000000000000");

/// ERC-1167 creation code before the implementation address.
const PROXY_PREFIX: Bytes = bytes!("3d602d80600a3d3981f3363d3d373d3d3d363d73");

/// ERC-1167 creation code after the implementation address.
const PROXY_SUFFIX: Bytes = bytes!("5af43d82803e903d91602b57fd5bf3");

/// A call requested by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallIntent {
    /// Call target.
    pub to: Address,
    /// Native value sent with the call.
    pub value: U256,
    /// Calldata.
    pub data: Bytes,
    /// Gas limit override for this call.
    pub gas: Option<u64>,
}

impl CallIntent {
    /// A call to `to` without value or data.
    pub fn new(to: Address) -> Self {
        Self { to, ..Default::default() }
    }

    /// A native transfer.
    pub fn transfer(to: Address, value: U256) -> Self {
        Self { to, value, ..Default::default() }
    }

    /// Sets the calldata.
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Sets the value.
    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    /// Sets the gas limit override.
    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas = Some(gas);
        self
    }
}

impl From<&CallIntent> for Execution {
    fn from(call: &CallIntent) -> Self {
        Self { target: call.to, value: call.value, callData: call.data.clone() }
    }
}

/// Returns the creation code of a minimal proxy delegating to `implementation`.
pub fn proxy_init_code(implementation: Address) -> Bytes {
    [PROXY_PREFIX.as_ref(), implementation.as_slice(), PROXY_SUFFIX.as_ref()].concat().into()
}

/// Returns the CREATE2 salt the factory uses for `owner` and `salt`.
pub fn create2_salt(owner: Address, salt: B256) -> B256 {
    keccak256((owner, salt).abi_encode())
}

/// Derives the wallet address of `owner` on the chain.
pub fn derive_address(owner: Address, spec: &ChainSpec, salt: B256) -> Address {
    spec.factory.create2(create2_salt(owner, salt), keccak256(proxy_init_code(spec.implementation)))
}

/// Returns the factory call deploying the wallet of `owner` on the chain.
pub fn deployment_call(owner: Address, spec: &ChainSpec, salt: B256) -> CallIntent {
    CallIntent::new(spec.factory)
        .with_data(IWalletFactory::createAccountCall { owner, salt }.abi_encode())
}

/// Whether a contract is deployed at `address`.
pub async fn is_deployed<P: Provider>(provider: &P, address: Address) -> TransportResult<bool> {
    Ok(!provider.get_code_at(address).await?.is_empty())
}

/// Encodes `calls` as the wallet's `execute` calldata.
///
/// A single call uses the packed single-call encoding, more calls are encoded as a batch.
/// Returns `None` if there are no calls.
pub fn encode_execute(calls: &[CallIntent]) -> Option<Bytes> {
    let (mode, execution_calldata) = match calls {
        [] => return None,
        [call] => {
            let mut packed = Vec::with_capacity(52 + call.data.len());
            packed.extend_from_slice(call.to.as_slice());
            packed.extend_from_slice(&call.value.to_be_bytes::<32>());
            packed.extend_from_slice(&call.data);
            (SINGLE_CALL_MODE, packed)
        }
        calls => (BATCH_CALL_MODE, calls.iter().map(Execution::from).collect::<Vec<_>>().abi_encode()),
    };

    Some(
        ISmartWallet::executeCall { mode, executionCalldata: execution_calldata.into() }
            .abi_encode()
            .into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, hex};

    const OWNER: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

    fn spec(factory: Address) -> ChainSpec {
        ChainSpec::new(1, vec![]).with_factory(factory, address!("0x00000000000000000000000000000000000a11ce"))
    }

    #[test]
    fn address_is_deterministic() {
        let spec = spec(address!("0x00000000000000000000000000000000000000f1"));
        let first = derive_address(OWNER, &spec, B256::ZERO);
        assert_eq!(first, derive_address(OWNER, &spec, B256::ZERO));
        assert_ne!(first, derive_address(OWNER, &spec, B256::with_last_byte(1)));
        assert_ne!(first, derive_address(Address::with_last_byte(1), &spec, B256::ZERO));
    }

    #[test]
    fn address_depends_only_on_factory() {
        let factory = address!("0x00000000000000000000000000000000000000f1");
        let mainnet = spec(factory);
        let base = ChainSpec { chain_id: 8453, ..spec(factory) };
        assert_eq!(
            derive_address(OWNER, &mainnet, B256::ZERO),
            derive_address(OWNER, &base, B256::ZERO)
        );

        let other = spec(address!("0x00000000000000000000000000000000000000f2"));
        assert_ne!(
            derive_address(OWNER, &mainnet, B256::ZERO),
            derive_address(OWNER, &other, B256::ZERO)
        );
    }

    #[test]
    fn address_matches_create2_formula() {
        let spec = spec(address!("0x00000000000000000000000000000000000000f1"));
        let salt = create2_salt(OWNER, B256::ZERO);
        let init_code = proxy_init_code(spec.implementation);
        assert_eq!(init_code.len(), 55);

        let mut preimage = vec![0xff];
        preimage.extend_from_slice(spec.factory.as_slice());
        preimage.extend_from_slice(salt.as_slice());
        preimage.extend_from_slice(keccak256(&init_code).as_slice());
        let expected = Address::from_slice(&keccak256(preimage)[12..]);

        assert_eq!(derive_address(OWNER, &spec, B256::ZERO), expected);
    }

    #[test]
    fn deployment_call_targets_factory() {
        let spec = spec(address!("0x00000000000000000000000000000000000000f1"));
        let call = deployment_call(OWNER, &spec, B256::with_last_byte(7));
        assert_eq!(call.to, spec.factory);
        assert_eq!(call.value, U256::ZERO);

        let decoded = IWalletFactory::createAccountCall::abi_decode(&call.data).unwrap();
        assert_eq!(decoded.owner, OWNER);
        assert_eq!(decoded.salt, B256::with_last_byte(7));
    }

    #[test]
    fn encodes_single_call_packed() {
        let target = address!("0x1111111111111111111111111111111111111111");
        let call = CallIntent::new(target).with_value(U256::from(5)).with_data(hex!("abcd"));

        let data = encode_execute(&[call]).unwrap();
        let decoded = ISmartWallet::executeCall::abi_decode(&data).unwrap();
        assert_eq!(decoded.mode, SINGLE_CALL_MODE);

        let packed = decoded.executionCalldata;
        assert_eq!(packed.len(), 20 + 32 + 2);
        assert_eq!(&packed[..20], target.as_slice());
        assert_eq!(U256::from_be_slice(&packed[20..52]), U256::from(5));
        assert_eq!(&packed[52..], &hex!("abcd"));
    }

    #[test]
    fn encodes_batch() {
        let calls = vec![
            CallIntent::transfer(Address::with_last_byte(1), U256::from(1)),
            CallIntent::new(Address::with_last_byte(2)).with_data(hex!("deadbeef")),
        ];

        let data = encode_execute(&calls).unwrap();
        let decoded = ISmartWallet::executeCall::abi_decode(&data).unwrap();
        assert_eq!(decoded.mode, BATCH_CALL_MODE);

        let executions = <Vec<Execution>>::abi_decode(&decoded.executionCalldata).unwrap();
        assert_eq!(executions, calls.iter().map(Execution::from).collect::<Vec<_>>());
    }

    #[test]
    fn no_calls_no_payload() {
        assert!(encode_execute(&[]).is_none());
    }
}
