//! Funding-data providers
//!
//! A provider reports the chain tip and, for a txid, the block it was mined
//! in together with the header merkle root and an inclusion path. It also
//! lists the outputs paying an address, which is how a funding transaction
//! broadcast under a wallet-chosen txid is found. It never judges the data:
//! verification happens in [`crate::merkle`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::{EngineConfig, FundingProviderKind},
    error::EscrowError,
    merkle::ProofCandidate,
    models::ProofStep,
    EscrowResult,
};

pub mod esplora;
pub mod mock;

pub use esplora::EsploraFundingProvider;
pub use mock::{MockFundingProvider, MockProviderConfig};

/// Where a transaction sits on chain, as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainObservation {
    pub txid: String,
    pub block_height: u64,
    pub block_hash: Option<String>,
    /// Header merkle root, display hex
    pub merkle_root: String,
    pub path: Vec<ProofStep>,
}

impl ChainObservation {
    pub fn candidate(&self) -> ProofCandidate {
        ProofCandidate {
            txid: self.txid.clone(),
            block_height: self.block_height,
            merkle_root: self.merkle_root.clone(),
            path: self.path.clone(),
        }
    }
}

/// An unspent output paying a watched address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressOutput {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

/// Provider reachability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub name: String,
    pub reachable: bool,
    pub tip_height: Option<u64>,
    pub detail: Option<String>,
}

/// Capability interface over a funding-data source
#[async_trait]
pub trait FundingProvider: Send + Sync {
    /// Provider name for logs and health output
    fn name(&self) -> &str;

    /// Current chain tip height
    async fn tip_height(&self) -> EscrowResult<u64>;

    /// Block placement of `txid`; `None` while unconfirmed or unknown
    async fn lookup(&self, txid: &str) -> EscrowResult<Option<ChainObservation>>;

    /// Unspent outputs paying `address`, mempool included
    async fn address_outputs(&self, address: &str) -> EscrowResult<Vec<AddressOutput>>;

    /// Reachability check
    async fn health(&self) -> ProviderHealth {
        match self.tip_height().await {
            Ok(height) => ProviderHealth {
                name: self.name().to_string(),
                reachable: true,
                tip_height: Some(height),
                detail: None,
            },
            Err(e) => ProviderHealth {
                name: self.name().to_string(),
                reachable: false,
                tip_height: None,
                detail: Some(e.to_string()),
            },
        }
    }
}

/// Build the provider named by configuration
pub fn build_provider(config: &EngineConfig) -> EscrowResult<Arc<dyn FundingProvider>> {
    let provider: Arc<dyn FundingProvider> = match config.funding_provider {
        FundingProviderKind::Mock => Arc::new(MockFundingProvider::new(MockProviderConfig {
            network: config.network,
            ..MockProviderConfig::default()
        })),
        FundingProviderKind::Esplora => {
            let base_url = config.explorer_url().ok_or_else(|| {
                EscrowError::config(format!(
                    "no explorer URL configured for {}",
                    config.network.name()
                ))
            })?;
            Arc::new(EsploraFundingProvider::new(
                base_url,
                config.provider_timeout(),
            )?)
        }
    };

    info!("Using {} funding provider", provider.name());
    Ok(provider)
}
