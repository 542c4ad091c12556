//! Escort Service - readiness and health over the proof and script subsystems
//!
//! Readiness runs fixed self-test vectors through the script builder, the
//! interpreter and the merkle verifier. Dispute resolution refuses to
//! adjudicate while readiness fails, since its evidence comes from those
//! subsystems.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::Network,
    error::EscrowError,
    merkle::{build_proof, compute_root, MerkleVerifier},
    models::Payout,
    monitor::{MonitoringStats, TransactionMonitor},
    provider::{FundingProvider, ProviderHealth},
    script::{interpret, sha256_digest, ExecutionContext, ScriptBuilder, ScriptParams, ScriptWitness},
    EscrowResult,
};

/// Status of one checked component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

impl ComponentStatus {
    fn from_result(name: &str, result: Result<(), String>) -> Self {
        Self {
            name: name.to_string(),
            healthy: result.is_ok(),
            detail: result.err(),
        }
    }
}

/// Readiness of the proof and script subsystems
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub components: Vec<ComponentStatus>,
    pub timestamp: DateTime<Utc>,
}

/// Full health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: Vec<ComponentStatus>,
    pub issues: Vec<String>,
    pub provider: Option<ProviderHealth>,
    pub monitor: Option<MonitoringStats>,
    pub timestamp: DateTime<Utc>,
}

pub struct EscortService {
    network: Network,
    scripts: ScriptBuilder,
    verifier: MerkleVerifier,
}

impl EscortService {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            scripts: ScriptBuilder::new(network),
            verifier: MerkleVerifier::new(network),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn readiness(&self) -> Readiness {
        let components = vec![
            ComponentStatus::from_result("script", self.check_scripts()),
            ComponentStatus::from_result("merkle", self.check_merkle()),
        ];
        Readiness {
            ready: components.iter().all(|c| c.healthy),
            components,
            timestamp: Utc::now(),
        }
    }

    /// Fail with `NotReady` unless every subsystem passes its self-test
    pub fn ensure_ready(&self) -> EscrowResult<()> {
        let readiness = self.readiness();
        if readiness.ready {
            return Ok(());
        }
        let failed: Vec<String> = readiness
            .components
            .iter()
            .filter(|c| !c.healthy)
            .map(|c| format!("{}: {}", c.name, c.detail.clone().unwrap_or_default()))
            .collect();
        warn!("Escort readiness failed: {}", failed.join("; "));
        Err(EscrowError::not_ready(failed.join("; ")))
    }

    /// Readiness plus provider reachability and monitor statistics
    pub async fn health(
        &self,
        provider: Option<&Arc<dyn FundingProvider>>,
        monitor: Option<&TransactionMonitor>,
    ) -> HealthReport {
        let readiness = self.readiness();
        let mut components = readiness.components;
        let mut issues: Vec<String> = components
            .iter()
            .filter(|c| !c.healthy)
            .map(|c| format!("{} self-test failed", c.name))
            .collect();

        let provider_health = match provider {
            Some(p) => {
                let health = p.health().await;
                if !health.reachable {
                    issues.push(format!(
                        "Funding provider {} unreachable: {}",
                        health.name,
                        health.detail.clone().unwrap_or_default()
                    ));
                }
                components.push(ComponentStatus {
                    name: format!("provider:{}", health.name),
                    healthy: health.reachable,
                    detail: health.detail.clone(),
                });
                Some(health)
            }
            None => None,
        };

        let monitor_stats = match monitor {
            Some(m) => Some(m.get_monitoring_stats().await),
            None => None,
        };

        HealthReport {
            healthy: issues.is_empty(),
            components,
            issues,
            provider: provider_health,
            monitor: monitor_stats,
            timestamp: Utc::now(),
        }
    }

    fn check_scripts(&self) -> Result<(), String> {
        let preimage = b"escort-self-test";
        let fallback = self_test_address(self.network, 0xfa);
        let params = ScriptParams {
            commitment_hash: sha256_digest(preimage).to_vec(),
            payouts: vec![Payout::new(self_test_address(self.network, 0x01), 1_000)],
            fallback_address: fallback,
            timeout_blocks: 6,
            fallback_pubkey: None,
        };

        let first = self.scripts.derive(&params, 1_000).map_err(|e| e.to_string())?;
        let second = self.scripts.derive(&params, 1_000).map_err(|e| e.to_string())?;
        if first != second {
            return Err("script derivation is not deterministic".to_string());
        }

        let ctx = ExecutionContext::default();
        if !interpret(&first.redeem_script, &ScriptWitness::reveal(preimage), &ctx).passed {
            return Err("reveal vector rejected".to_string());
        }
        if interpret(&first.redeem_script, &ScriptWitness::reveal(b"wrong"), &ctx).passed {
            return Err("forged reveal vector accepted".to_string());
        }
        Ok(())
    }

    fn check_merkle(&self) -> Result<(), String> {
        let genesis = &self.verifier.params().genesis_merkle_root;
        if !self.verifier.verify_inclusion(genesis, 0, genesis, &[]) {
            return Err("genesis root check failed".to_string());
        }

        let txids: Vec<String> = (1u8..=5).map(|i| hex::encode([i; 32])).collect();
        let root = compute_root(&txids).map_err(|e| e.to_string())?;
        let path = build_proof(&txids, 3).map_err(|e| e.to_string())?;
        if !self.verifier.verify_inclusion(&txids[3], 1, &root, &path) {
            return Err("round-trip proof rejected".to_string());
        }
        if self.verifier.verify_inclusion(&txids[2], 1, &root, &path) {
            return Err("proof for the wrong leaf accepted".to_string());
        }
        Ok(())
    }
}

fn self_test_address(network: Network, seed: u8) -> String {
    bitcoin::Address::p2wsh(
        &bitcoin::ScriptBuf::from_bytes(vec![seed]),
        network.to_bitcoin_network(),
    )
    .to_string()
}
