//! Engine configuration loaded from the environment.
//!
//! Every key is read from an `ESCROW_`-prefixed environment variable
//! (`ESCROW_CLAIM_TTL_HOURS`, `ESCROW_STORE_DRIVER`, ...) and falls back to
//! the defaults below when unset.

use std::{str::FromStr, time::Duration};

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::{error::EscrowError, models::TxType, store::DEFAULT_EVENT_TAIL, EscrowResult};

/// Bitcoin network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet.
    Mainnet,
    /// Bitcoin testnet.
    #[default]
    Testnet,
    /// Bitcoin signet.
    Signet,
    /// Bitcoin regtest (local development).
    Regtest,
}

impl Network {
    /// Get the network name.
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }

    /// Convert to bitcoin crate network type.
    pub fn to_bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// Default Esplora-compatible explorer for the network.
    pub fn default_explorer_url(&self) -> Option<&'static str> {
        match self {
            Network::Mainnet => Some("https://blockstream.info/api"),
            Network::Testnet => Some("https://blockstream.info/testnet/api"),
            Network::Signet => Some("https://mempool.space/signet/api"),
            Network::Regtest => None,
        }
    }
}

/// Record persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// Process-lifetime maps only
    #[default]
    Memory,
    /// Durable records in PostgreSQL
    Postgres,
}

/// Funding-data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FundingProviderKind {
    /// In-memory chain fixture
    #[default]
    Mock,
    /// Esplora REST explorer (blockstream.info, mempool.space)
    #[serde(alias = "blockstream")]
    Esplora,
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hours a claimant has to submit before the claim lapses
    pub claim_ttl_hours: u32,
    pub store_driver: StoreDriver,
    pub database_url: Option<String>,
    pub funding_provider: FundingProviderKind,
    /// Overrides the network's default explorer
    pub esplora_url: Option<String>,
    pub network: Network,
    pub funding_sync_interval_secs: u64,
    pub ingestion_sync_interval_secs: u64,
    pub claim_sweep_interval_secs: u64,
    /// Upper bound on a single provider call
    pub provider_timeout_secs: u64,
    pub max_backoff_secs: u64,
    /// JSON feed of ingested proposals; fixture source when unset
    pub ingestion_url: Option<String>,
    /// Key required for privileged operations; open when unset
    pub api_key: Option<String>,
    pub funding_confirmations: u32,
    pub commitment_confirmations: u32,
    pub payout_confirmations: u32,
    pub sweep_confirmations: u32,
    /// Pending transactions never observed within this window are failed
    pub pending_timeout_hours: u32,
    /// Relative timeout (blocks) before the fallback branch opens
    pub timeout_blocks: u16,
    /// Default fallback address when a request does not name one
    pub fallback_address: Option<String>,
    /// Compressed hex key that must sign timeout spends; required off regtest
    pub fallback_pubkey: Option<String>,
    /// Audit events kept in memory; older ones stay in the record backend only
    pub event_tail_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            claim_ttl_hours: 24,
            store_driver: StoreDriver::Memory,
            database_url: None,
            funding_provider: FundingProviderKind::Mock,
            esplora_url: None,
            network: Network::Testnet,
            funding_sync_interval_secs: 30,
            ingestion_sync_interval_secs: 60,
            claim_sweep_interval_secs: 60,
            provider_timeout_secs: 10,
            max_backoff_secs: 300,
            ingestion_url: None,
            api_key: None,
            funding_confirmations: 6,
            commitment_confirmations: 1,
            payout_confirmations: 1,
            sweep_confirmations: 1,
            pending_timeout_hours: 72,
            timeout_blocks: 144,
            fallback_address: None,
            fallback_pubkey: None,
            event_tail_len: DEFAULT_EVENT_TAIL,
        }
    }
}

impl EngineConfig {
    /// Load from `ESCROW_*` environment variables.
    pub fn from_env() -> EscrowResult<Self> {
        let config: EngineConfig = ::config::Config::builder()
            .add_source(::config::Environment::with_prefix("ESCROW").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> EscrowResult<()> {
        if self.claim_ttl_hours == 0 {
            return Err(EscrowError::config("claim_ttl_hours must be at least 1"));
        }

        if self.funding_sync_interval_secs == 0
            || self.ingestion_sync_interval_secs == 0
            || self.claim_sweep_interval_secs == 0
        {
            return Err(EscrowError::config("sync intervals must be non-zero"));
        }

        if self.provider_timeout_secs == 0 {
            return Err(EscrowError::config("provider_timeout_secs must be non-zero"));
        }

        for tx_type in TxType::ALL {
            if self.required_depth(tx_type) == 0 {
                return Err(EscrowError::config(format!(
                    "{:?} confirmations must be at least 1",
                    tx_type
                )));
            }
        }

        if self.store_driver == StoreDriver::Postgres && self.database_url.is_none() {
            return Err(EscrowError::config(
                "database_url is required for the postgres store",
            ));
        }

        if self.funding_provider == FundingProviderKind::Esplora && self.explorer_url().is_none() {
            return Err(EscrowError::config(format!(
                "esplora_url is required on {}",
                self.network.name()
            )));
        }

        if self.timeout_blocks == 0 {
            return Err(EscrowError::config("timeout_blocks must be non-zero"));
        }

        if self.event_tail_len == 0 {
            return Err(EscrowError::config("event_tail_len must be non-zero"));
        }

        // without a key the timeout branch is spendable by anyone
        if self.fallback_key()?.is_none() && self.network != Network::Regtest {
            return Err(EscrowError::config(format!(
                "fallback_pubkey is required on {}",
                self.network.name()
            )));
        }

        Ok(())
    }

    /// Parsed fallback key, if configured.
    pub fn fallback_key(&self) -> EscrowResult<Option<PublicKey>> {
        self.fallback_pubkey
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| {
                PublicKey::from_str(key)
                    .map_err(|e| EscrowError::config(format!("invalid fallback_pubkey: {}", e)))
            })
            .transpose()
    }

    /// Required confirmation depth for a transaction type.
    pub fn required_depth(&self, tx_type: TxType) -> u32 {
        match tx_type {
            TxType::Funding => self.funding_confirmations,
            TxType::Commitment => self.commitment_confirmations,
            TxType::Payout => self.payout_confirmations,
            TxType::Sweep => self.sweep_confirmations,
        }
    }

    /// Explorer base URL in effect.
    pub fn explorer_url(&self) -> Option<String> {
        self.esplora_url
            .clone()
            .or_else(|| self.network.default_explorer_url().map(str::to_string))
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.claim_ttl_hours))
    }

    pub fn pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.pending_timeout_hours))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}
