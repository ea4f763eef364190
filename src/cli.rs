//! # Executor CLI
use crate::{config::ExecutorConfig, executor::Executor, wallet::CallIntent};
use alloy::primitives::{Address, B256, Bytes, ChainId, U256};
use clap::{Parser, Subcommand};
use eyre::WrapErr;
use std::path::PathBuf;
use tracing::info;

/// Executes calls through a deterministic smart wallet on any configured chain.
#[derive(Debug, Parser)]
#[command(author, about = "Chain executor", long_about = None)]
pub struct Args {
    /// The configuration file.
    #[arg(long, value_name = "CONFIG", env = "EXECUTOR_CONFIG", default_value = "executor.yaml")]
    pub config: PathBuf,
    /// The owner key: a hex private key or an AWS KMS key id.
    ///
    /// Overrides the key in the configuration file.
    #[arg(long = "owner-key", value_name = "KEY", env = "EXECUTOR_OWNER_KEY", hide_env_values = true)]
    pub owner_key: Option<String>,
    /// The command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Commands of the executor CLI.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Prints the smart wallet address of the owner on a chain.
    Address {
        /// The chain id.
        #[arg(long, value_name = "CHAIN_ID")]
        chain: ChainId,
    },
    /// Executes a single call through the smart wallet.
    Execute {
        /// The chain id.
        #[arg(long, value_name = "CHAIN_ID")]
        chain: ChainId,
        /// The call target.
        #[arg(long, value_name = "ADDRESS")]
        to: Address,
        /// The value sent with the call, in wei.
        #[arg(long, value_name = "WEI", default_value_t = U256::ZERO)]
        value: U256,
        /// The calldata, hex encoded.
        #[arg(long, value_name = "HEX", default_value_t = Bytes::new())]
        data: Bytes,
        /// Gas limit of the call, estimated if unset.
        #[arg(long, value_name = "GAS")]
        gas: Option<u64>,
    },
    /// Prints the status of a transaction.
    Status {
        /// The chain id.
        #[arg(long, value_name = "CHAIN_ID")]
        chain: ChainId,
        /// The transaction hash.
        #[arg(long, value_name = "HASH")]
        hash: B256,
    },
}

impl Args {
    /// Loads the configuration, merging the command line overrides.
    pub fn load_config(&self) -> eyre::Result<ExecutorConfig> {
        let mut config = ExecutorConfig::load_from_file(&self.config)?;
        if let Some(owner_key) = &self.owner_key {
            config = config.with_owner_key(owner_key.clone());
        }
        Ok(config)
    }

    /// Runs the command.
    pub async fn run(self) -> eyre::Result<()> {
        let config = self.load_config()?;
        let executor = Executor::new(config).await?;
        info!(owner = %executor.owner(), chains = ?executor.chain_specs().chain_ids(), "Loaded executor");

        match self.command {
            Command::Address { chain } => {
                let address = executor
                    .get_wallet_address(chain)
                    .await
                    .wrap_err_with(|| format!("failed to resolve wallet on chain {chain}"))?;
                println!("{address}");
            }
            Command::Execute { chain, to, value, data, gas } => {
                let mut call = CallIntent::new(to).with_value(value).with_data(data);
                if let Some(gas) = gas {
                    call = call.with_gas(gas);
                }

                let tx_hash = executor
                    .execute(chain, vec![call])
                    .await
                    .wrap_err_with(|| format!("failed to execute on chain {chain}"))?;
                match executor.chain_specs().resolve(chain)?.explorer_tx_url(tx_hash) {
                    Some(url) => println!("{tx_hash} {url}"),
                    None => println!("{tx_hash}"),
                }
            }
            Command::Status { chain, hash } => {
                let status = executor
                    .transaction_status(chain, hash)
                    .await
                    .wrap_err_with(|| format!("failed to fetch status on chain {chain}"))?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_execute() {
        let args = Args::try_parse_from([
            "chain-executor",
            "--config",
            "custom.yaml",
            "execute",
            "--chain",
            "10",
            "--to",
            "0x0000000000000000000000000000000000000007",
            "--value",
            "1000",
            "--data",
            "0xdeadbeef",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("custom.yaml"));
        let Command::Execute { chain, to, value, data, gas } = args.command else {
            panic!("expected execute")
        };
        assert_eq!(chain, 10);
        assert_eq!(to, Address::with_last_byte(7));
        assert_eq!(value, U256::from(1000));
        assert_eq!(data, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(gas, None);
    }

    #[test]
    fn execute_defaults_to_an_empty_transfer() {
        let args = Args::try_parse_from([
            "chain-executor",
            "execute",
            "--chain",
            "1",
            "--to",
            "0x0000000000000000000000000000000000000007",
        ])
        .unwrap();

        let Command::Execute { value, data, .. } = args.command else { panic!("expected execute") };
        assert!(value.is_zero());
        assert!(data.is_empty());
    }

    #[test]
    fn requires_a_command() {
        assert!(Args::try_parse_from(["chain-executor"]).is_err());
    }

    #[test]
    fn merges_owner_key_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.yaml");
        ExecutorConfig::default().with_owner_key("0x01").save_to_file(&path).unwrap();

        let args = Args::try_parse_from([
            "chain-executor",
            "--config",
            path.to_str().unwrap(),
            "--owner-key",
            "0x02",
            "address",
            "--chain",
            "1",
        ])
        .unwrap();
        assert_eq!(args.load_config().unwrap().secrets.owner_key, "0x02");
    }
}
