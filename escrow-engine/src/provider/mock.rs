//! Mock provider for tests and local development.
//!
//! Simulates a chain in memory: blocks are mined on demand, every block gets
//! a real merkle tree, and lookups return genuine inclusion paths. Outputs
//! paid to an address are tracked separately from blocks. Failure, latency
//! and forged roots can be injected.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::{sha256d, Hash};
use tokio::sync::RwLock;
use tracing::debug;

use super::{AddressOutput, ChainObservation, FundingProvider};
use crate::{
    config::Network,
    error::EscrowError,
    merkle::{build_proof, compute_root, encode_hash},
    EscrowResult,
};

/// Configuration for the mock provider.
#[derive(Debug, Clone)]
pub struct MockProviderConfig {
    pub network: Network,
    /// Height of the simulated tip at start
    pub initial_height: u64,
    /// Delay applied to every call
    pub latency: Duration,
}

impl Default for MockProviderConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            initial_height: 100,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct MockBlock {
    hash: String,
    txids: Vec<String>,
    merkle_root: String,
}

#[derive(Debug, Default)]
struct MockChain {
    tip: u64,
    blocks: BTreeMap<u64, MockBlock>,
    index: HashMap<String, u64>,
    /// address -> (txid, vout, value)
    outputs: HashMap<String, Vec<(String, u32, u64)>>,
}

/// In-memory funding provider
pub struct MockFundingProvider {
    config: MockProviderConfig,
    chain: RwLock<MockChain>,
    latency: RwLock<Duration>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl MockFundingProvider {
    pub fn new(config: MockProviderConfig) -> Self {
        Self {
            chain: RwLock::new(MockChain {
                tip: config.initial_height,
                ..MockChain::default()
            }),
            latency: RwLock::new(config.latency),
            config,
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    /// Mine a block containing `txids` after a synthetic coinbase; returns its height
    pub async fn mine_block(&self, txids: &[String]) -> EscrowResult<u64> {
        let mut chain = self.chain.write().await;
        let height = chain.tip + 1;

        let mut block_txids = vec![synthetic_hash(b"coinbase", height)];
        block_txids.extend(txids.iter().cloned());
        let merkle_root = compute_root(&block_txids)?;

        for txid in txids {
            chain.index.insert(txid.clone(), height);
        }
        chain.blocks.insert(
            height,
            MockBlock {
                hash: synthetic_hash(b"block", height),
                txids: block_txids,
                merkle_root,
            },
        );
        chain.tip = height;

        debug!("Mock chain mined block {} with {} txs", height, txids.len());
        Ok(height)
    }

    /// Extend the chain by `blocks` empty blocks
    pub async fn advance(&self, blocks: u64) -> EscrowResult<u64> {
        let mut height = self.chain.read().await.tip;
        for _ in 0..blocks {
            height = self.mine_block(&[]).await?;
        }
        Ok(height)
    }

    /// Mine `txid` and bury it so that `tip - height == depth`
    pub async fn confirm(&self, txid: &str, depth: u64) -> EscrowResult<u64> {
        let height = self.mine_block(&[txid.to_string()]).await?;
        self.advance(depth).await?;
        Ok(height)
    }

    /// Record that output `vout` of `txid` pays `value_sats` to `address`
    pub async fn pay_to_address(&self, txid: &str, vout: u32, address: &str, value_sats: u64) {
        self.chain
            .write()
            .await
            .outputs
            .entry(address.to_string())
            .or_default()
            .push((txid.to_string(), vout, value_sats));
    }

    /// Replace a block's reported merkle root, making its proofs invalid
    pub async fn forge_root(&self, height: u64, root: impl Into<String>) -> EscrowResult<()> {
        let mut chain = self.chain.write().await;
        let block = chain
            .blocks
            .get_mut(&height)
            .ok_or_else(|| EscrowError::not_found(format!("mock block {}", height)))?;
        block.merkle_root = root.into();
        Ok(())
    }

    pub async fn tip(&self) -> u64 {
        self.chain.read().await.tip
    }

    /// Make every call fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    /// Calls served (or refused) so far
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn simulate_call(&self) -> EscrowResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EscrowError::provider("mock provider unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl FundingProvider for MockFundingProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn tip_height(&self) -> EscrowResult<u64> {
        self.simulate_call().await?;
        Ok(self.chain.read().await.tip)
    }

    async fn lookup(&self, txid: &str) -> EscrowResult<Option<ChainObservation>> {
        self.simulate_call().await?;
        let chain = self.chain.read().await;

        let Some(height) = chain.index.get(txid).copied() else {
            return Ok(None);
        };
        let Some(block) = chain.blocks.get(&height) else {
            return Ok(None);
        };
        let position = block
            .txids
            .iter()
            .position(|t| t == txid)
            .ok_or_else(|| EscrowError::internal(format!("mock index out of sync for {}", txid)))?;

        Ok(Some(ChainObservation {
            txid: txid.to_string(),
            block_height: height,
            block_hash: Some(block.hash.clone()),
            merkle_root: block.merkle_root.clone(),
            path: build_proof(&block.txids, position)?,
        }))
    }

    async fn address_outputs(&self, address: &str) -> EscrowResult<Vec<AddressOutput>> {
        self.simulate_call().await?;
        let chain = self.chain.read().await;
        let Some(outputs) = chain.outputs.get(address) else {
            return Ok(Vec::new());
        };
        Ok(outputs
            .iter()
            .map(|(txid, vout, value)| {
                let block_height = chain.index.get(txid).copied();
                AddressOutput {
                    txid: txid.clone(),
                    vout: *vout,
                    value_sats: *value,
                    confirmed: block_height.is_some(),
                    block_height,
                }
            })
            .collect())
    }
}

fn synthetic_hash(tag: &[u8], height: u64) -> String {
    let mut data = tag.to_vec();
    data.extend_from_slice(&height.to_le_bytes());
    encode_hash(&sha256d::Hash::hash(&data).to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::MerkleVerifier;
    use crate::models::ProofStatus;

    fn txid(n: u8) -> String {
        hex::encode([n; 32])
    }

    #[tokio::test]
    async fn test_lookup_returns_verifiable_proof() {
        let provider = MockFundingProvider::new(MockProviderConfig::default());
        assert!(provider.lookup(&txid(1)).await.unwrap().is_none());

        let height = provider.confirm(&txid(1), 6).await.unwrap();
        assert_eq!(provider.tip_height().await.unwrap(), height + 6);

        let obs = provider.lookup(&txid(1)).await.unwrap().unwrap();
        let verifier = MerkleVerifier::new(Network::Regtest);
        assert_eq!(
            verifier.evaluate(&obs.candidate(), height + 6, 6),
            ProofStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_forged_root_is_invalid() {
        let provider = MockFundingProvider::new(MockProviderConfig::default());
        let height = provider.confirm(&txid(2), 1).await.unwrap();
        provider.forge_root(height, txid(9)).await.unwrap();

        let obs = provider.lookup(&txid(2)).await.unwrap().unwrap();
        let verifier = MerkleVerifier::new(Network::Regtest);
        assert_eq!(
            verifier.evaluate(&obs.candidate(), height + 1, 1),
            ProofStatus::Invalid
        );
    }

    #[tokio::test]
    async fn test_address_outputs_follow_chain() {
        let provider = MockFundingProvider::new(MockProviderConfig::default());
        assert!(provider.address_outputs("bcrt1qwatched").await.unwrap().is_empty());

        provider.pay_to_address(&txid(3), 1, "bcrt1qwatched", 4_200).await;
        let outputs = provider.address_outputs("bcrt1qwatched").await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(!outputs[0].confirmed);

        let height = provider.confirm(&txid(3), 2).await.unwrap();
        let outputs = provider.address_outputs("bcrt1qwatched").await.unwrap();
        assert_eq!(outputs[0].block_height, Some(height));
        assert_eq!((outputs[0].vout, outputs[0].value_sats), (1, 4_200));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let provider = MockFundingProvider::new(MockProviderConfig::default());
        provider.set_failing(true);
        assert!(matches!(
            provider.tip_height().await,
            Err(EscrowError::Provider(_))
        ));
        assert!(!provider.health().await.reachable);

        provider.set_failing(false);
        assert!(provider.health().await.reachable);
        assert_eq!(provider.call_count(), 3);
    }
}
