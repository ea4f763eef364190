//! Executor configuration.
use crate::{
    chains::ChainSpec,
    constants::{
        DEFAULT_BASE_FEE_MULTIPLIER_PERCENT, DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_ESTIMATION_RETRY_BACKOFF, DEFAULT_EXECUTION_OVERHEAD, DEFAULT_GAS_MARGIN_PERCENT,
        DEFAULT_INCLUSION_TIMEOUT, DEFAULT_MAX_BUMPS, DEFAULT_POLL_INTERVAL,
        DEFAULT_REQUEST_TIMEOUT, DEFAULT_UNAVAILABLE_FAILURE_BUDGET, MIN_BUMP_RATIO_PERCENT,
    },
};
use alloy::primitives::{B256, ChainId, map::HashMap};
use eyre::Context;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, time::Duration};

/// Executor configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Chain configurations, keyed by chain id.
    #[serde(with = "crate::serde::hash_map")]
    pub chains: HashMap<ChainId, ChainSpec>,
    /// Smart wallet configuration.
    #[serde(default)]
    pub wallet: WalletConfig,
    /// Transaction service configuration.
    #[serde(default)]
    pub transactions: TransactionServiceConfig,
    /// Secrets.
    #[serde(skip_serializing, default)]
    pub secrets: SecretsConfig,
}

impl ExecutorConfig {
    /// Adds a chain, replacing any chain with the same id.
    pub fn with_chain(mut self, spec: ChainSpec) -> Self {
        self.chains.insert(spec.chain_id, spec);
        self
    }

    /// Sets the salt of the smart wallet.
    pub fn with_salt(mut self, salt: B256) -> Self {
        self.wallet.salt = salt;
        self
    }

    /// Sets the transaction service configuration.
    pub fn with_transactions(mut self, transactions: TransactionServiceConfig) -> Self {
        self.transactions = transactions;
        self
    }

    /// Sets the owner key, either a hex private key or an AWS KMS key id.
    pub fn with_owner_key(mut self, owner_key: impl Into<String>) -> Self {
        self.secrets.owner_key = owner_key.into();
        self
    }

    /// Returns the chain specs with their ids filled in from the configuration keys.
    pub fn chain_specs(&self) -> Vec<ChainSpec> {
        self.chains
            .iter()
            .map(|(chain_id, spec)| ChainSpec { chain_id: *chain_id, ..spec.clone() })
            .collect()
    }

    /// Load from a YAML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        let config = serde_yaml::from_reader(&file)
            .wrap_err_with(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save to a YAML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> eyre::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Settings that affect fee estimation and replacement.
///
/// Across Ethereum L2s and EVM compatible L1s the fee markets differ. These settings can be
/// overridden per chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Percentage of the latest base fee budgeted in `maxFeePerGas`.
    ///
    /// The default of `200` tolerates the base fee doubling before inclusion.
    pub base_fee_multiplier_percent: u64,
    /// Floor for `maxPriorityFeePerGas`, in wei.
    ///
    /// Some chains require a fixed minimum tip that `eth_maxPriorityFeePerGas` does not reflect.
    pub min_priority_fee: u64,
    /// Safety margin added to gas estimates, in percent.
    pub gas_margin_percent: u64,
    /// Ratio between the fees of a replacement and the fees of the replaced transaction, in
    /// percent. Values below 110 are raised to 110.
    pub bump_ratio_percent: u64,
    /// Upper bound for `maxFeePerGas` (or `gasPrice`), in wei. Replacements are not sent above it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<u64>,
}

impl FeeConfig {
    /// The effective bump ratio, never below what pools accept for replacements.
    pub fn bump_ratio_percent(&self) -> u64 {
        self.bump_ratio_percent.max(MIN_BUMP_RATIO_PERCENT)
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            base_fee_multiplier_percent: DEFAULT_BASE_FEE_MULTIPLIER_PERCENT,
            min_priority_fee: 0,
            gas_margin_percent: DEFAULT_GAS_MARGIN_PERCENT,
            bump_ratio_percent: MIN_BUMP_RATIO_PERCENT,
            max_fee_per_gas: None,
        }
    }
}

/// Smart wallet configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Salt of the wallet. Together with the owner and the factory it determines the address.
    pub salt: B256,
    /// Gas budgeted for the wallet's own dispatch when every call carries a gas override.
    pub execution_overhead: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self { salt: B256::ZERO, execution_overhead: DEFAULT_EXECUTION_OVERHEAD }
    }
}

/// Configuration for submitting transactions and waiting for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionServiceConfig {
    /// Interval between receipt polls, in milliseconds.
    #[serde(with = "crate::serde::duration_ms")]
    pub poll_interval: Duration,
    /// Time a transaction is given to be included before its fees are bumped, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub inclusion_timeout: Duration,
    /// Maximum number of fee bumps per transaction.
    pub max_bumps: u32,
    /// Timeout of a single RPC request, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub request_timeout: Duration,
    /// Timeout for connecting to an endpoint, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub connect_timeout: Duration,
    /// Backoff before retrying a failed estimation query, in milliseconds.
    #[serde(with = "crate::serde::duration_ms")]
    pub estimation_retry_backoff: Duration,
    /// Consecutive unavailability failures after which a chain client is rebuilt.
    pub unavailable_failure_budget: u32,
}

impl Default for TransactionServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            inclusion_timeout: DEFAULT_INCLUSION_TIMEOUT,
            max_bumps: DEFAULT_MAX_BUMPS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            estimation_retry_backoff: DEFAULT_ESTIMATION_RETRY_BACKOFF,
            unavailable_failure_budget: DEFAULT_UNAVAILABLE_FAILURE_BUDGET,
        }
    }
}

/// Secrets (kept out of serialized output and debug logs).
#[derive(Clone, Default, Deserialize)]
pub struct SecretsConfig {
    /// The owner key: a hex private key or an AWS KMS key id.
    #[serde(default)]
    pub owner_key: String,
}

impl fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsConfig").field("owner_key", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
chains:
  "10":
    endpoints: ["https://mainnet.optimism.io"]
    tx_types: [legacy, eip1559, eip7702]
    factory: "0x00000000000000000000000000000000000000f1"
    implementation: "0x00000000000000000000000000000000000000a1"
    fees:
      min_priority_fee: 1000
  "56":
    endpoints: ["https://bsc-dataseed.bnb.org", "https://bsc.publicnode.com"]
    tx_types: [legacy]
wallet:
  salt: "0x0000000000000000000000000000000000000000000000000000000000000007"
transactions:
  poll_interval: 500
  max_bumps: 5
secrets:
  owner_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
"#;

    #[test]
    fn parses_and_fills_chain_ids() {
        let config: ExecutorConfig = serde_yaml::from_str(CONFIG).unwrap();

        let mut specs = config.chain_specs();
        specs.sort_by_key(|spec| spec.chain_id);
        assert_eq!(specs.iter().map(|spec| spec.chain_id).collect::<Vec<_>>(), vec![10, 56]);
        assert_eq!(specs[0].fees.min_priority_fee, 1000);
        assert_eq!(specs[0].fees.gas_margin_percent, DEFAULT_GAS_MARGIN_PERCENT);
        assert_eq!(specs[1].endpoints.len(), 2);

        assert_eq!(config.transactions.poll_interval, Duration::from_millis(500));
        assert_eq!(config.transactions.max_bumps, 5);
        assert_eq!(config.transactions.inclusion_timeout, DEFAULT_INCLUSION_TIMEOUT);
        assert_eq!(config.wallet.execution_overhead, DEFAULT_EXECUTION_OVERHEAD);
        assert!(config.secrets.owner_key.starts_with("0xac09"));
    }

    #[test]
    fn secrets_are_never_written() {
        let config: ExecutorConfig = serde_yaml::from_str(CONFIG).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();

        let written = std::fs::read_to_string(file.path()).unwrap();
        assert!(!written.contains("ac0974bec"));
        assert!(!format!("{config:?}").contains("ac0974bec"));

        let reloaded = ExecutorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(reloaded.chains.len(), 2);
        assert!(reloaded.secrets.owner_key.is_empty());
    }

    #[test]
    fn bump_ratio_has_a_floor() {
        let fees = FeeConfig { bump_ratio_percent: 100, ..Default::default() };
        assert_eq!(fees.bump_ratio_percent(), 110);
        let fees = FeeConfig { bump_ratio_percent: 125, ..Default::default() };
        assert_eq!(fees.bump_ratio_percent(), 125);
    }
}
