//! Main Escrow Node - High-level API for the escrow system
//!
//! This module wires the store, monitor, escrow manager, claim board, dispute
//! resolver, escort service, providers and scheduler together from one
//! [`EngineConfig`], and exposes the operations the transport layer calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    dispute::DisputeResolver,
    error::EscrowError,
    escort::{ComponentStatus, EscortService},
    escrow::{
        EscrowManager, EscrowManagerConfig, FundingRequest, NewContract, NewGoal, SpendPsbt,
    },
    ingestion::{build_ingestion_source, IngestionSource},
    merkle::MerkleVerifier,
    models::{Claim, Contract, EscrowEvent, Payout, Proposal, ProposalStatus, Submission},
    monitor::{MonitorConfig, MonitoringStats, TransactionMonitor},
    provider::{build_provider, FundingProvider},
    scheduler::{Scheduler, SchedulerConfig, SchedulerDeps, SchedulerStatsSnapshot},
    store::{EscrowStore, RecordKind},
    tasks::{ClaimBoard, ClaimBoardConfig, SubmitWork},
    EscrowResult,
};

/// Funding template request for a contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractPsbtRequest {
    /// Address the timeout branch pays when the commitment is never revealed
    pub contractor_wallet: String,
    pub task_id: Option<String>,
    pub budget_sats: u64,
    pub fee_rate_sats_vb: f64,
    /// Hex sha256 of the visible pixel / commitment preimage
    pub pixel_hash: String,
    pub payouts: Vec<Payout>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractPsbtResponse {
    pub contract_id: String,
    pub psbt: String,
    pub txid: String,
    pub commitment_hash: String,
    pub commitment_script: String,
    pub redeem_script: String,
    pub commitment_address: String,
    pub payout_scripts: Vec<String>,
    pub payout_amounts: Vec<u64>,
    pub funding_amount_sats: u64,
    pub fee_reserve_sats: u64,
}

/// Reveal template request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentPsbtRequest {
    pub task_id: Option<String>,
    /// Hex preimage of the commitment hash
    pub preimage: String,
    pub fee_rate_sats_vb: f64,
}

/// Node health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub components: Vec<ComponentStatus>,
    pub store_backend: String,
    pub scheduler_running: bool,
    pub scheduler: SchedulerStatsSnapshot,
    pub monitor: Option<MonitoringStats>,
    pub timestamp: DateTime<Utc>,
}

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    config: EngineConfig,
    store: Arc<EscrowStore>,
    monitor: Arc<TransactionMonitor>,
    escrow: Arc<EscrowManager>,
    board: Arc<ClaimBoard>,
    disputes: Arc<DisputeResolver>,
    escort: Arc<EscortService>,
    provider: Arc<dyn FundingProvider>,
    scheduler: Arc<Scheduler>,
}

impl EscrowNode {
    /// Create a node with the store and sources named by `config`
    pub async fn new(config: EngineConfig) -> EscrowResult<Self> {
        config.validate()?;
        let store = Arc::new(EscrowStore::open(&config).await?);
        let provider = build_provider(&config)?;
        let ingestion = build_ingestion_source(&config)?;
        Self::assemble(config, store, provider, ingestion).await
    }

    /// Create a node over explicit collaborators
    pub async fn with_sources(
        config: EngineConfig,
        store: Arc<EscrowStore>,
        provider: Arc<dyn FundingProvider>,
        ingestion: Arc<dyn IngestionSource>,
    ) -> EscrowResult<Self> {
        config.validate()?;
        Self::assemble(config, store, provider, ingestion).await
    }

    async fn assemble(
        config: EngineConfig,
        store: Arc<EscrowStore>,
        provider: Arc<dyn FundingProvider>,
        ingestion: Arc<dyn IngestionSource>,
    ) -> EscrowResult<Self> {
        info!(
            "Initializing escrow node on {} ({} store, {} provider)",
            config.network.name(),
            store.backend_name(),
            provider.name()
        );

        let monitor = Arc::new(TransactionMonitor::new(
            MonitorConfig::from_config(&config),
            store.clone(),
        ));
        monitor.restore().await?;

        let escort = Arc::new(EscortService::new(config.network));
        let escrow = Arc::new(EscrowManager::new(
            EscrowManagerConfig::from_config(&config)?,
            store.clone(),
            monitor.clone(),
        ));
        let disputes = Arc::new(DisputeResolver::new(
            store.clone(),
            escort.clone(),
            escrow.clone(),
        ));
        let board = Arc::new(ClaimBoard::new(
            ClaimBoardConfig::from_config(&config),
            store.clone(),
            disputes.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::from_config(&config),
            SchedulerDeps {
                store: store.clone(),
                monitor: monitor.clone(),
                escrow: escrow.clone(),
                board: board.clone(),
                disputes: disputes.clone(),
                provider: provider.clone(),
                ingestion,
                verifier: MerkleVerifier::new(config.network),
            },
        ));

        if config.api_key.is_none() {
            warn!("No API key configured; privileged operations are open");
        }
        info!("Escrow node initialized successfully");

        Ok(Self {
            config,
            store,
            monitor,
            escrow,
            board,
            disputes,
            escort,
            provider,
            scheduler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EscrowStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<TransactionMonitor> {
        &self.monitor
    }

    pub fn escrow(&self) -> &Arc<EscrowManager> {
        &self.escrow
    }

    pub fn board(&self) -> &Arc<ClaimBoard> {
        &self.board
    }

    pub fn disputes(&self) -> &Arc<DisputeResolver> {
        &self.disputes
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Build the funding template for a contract
    pub async fn build_contract_psbt(
        &self,
        contract_id: &str,
        request: ContractPsbtRequest,
    ) -> EscrowResult<ContractPsbtResponse> {
        info!("Building funding PSBT for contract {}", contract_id);

        if request.budget_sats == 0 {
            return Err(EscrowError::validation("budget_sats must be greater than 0"));
        }
        let payout_total = request
            .payouts
            .iter()
            .try_fold(0u64, |acc, p| acc.checked_add(p.amount_sats))
            .ok_or_else(|| EscrowError::validation("payouts total overflows"))?;
        if payout_total > request.budget_sats {
            return Err(EscrowError::validation(format!(
                "payouts total {} exceeds budget {}",
                payout_total, request.budget_sats
            )));
        }
        if let Some(task_id) = &request.task_id {
            self.check_task(contract_id, task_id).await?;
        }

        let fallback = request.contractor_wallet.trim();
        let funding = self
            .escrow
            .build_funding_psbt(
                contract_id,
                FundingRequest {
                    payouts: request.payouts,
                    fee_rate_sats_vb: request.fee_rate_sats_vb,
                    commitment_hash_hex: request.pixel_hash,
                    fallback_address: (!fallback.is_empty()).then(|| fallback.to_string()),
                    timeout_blocks: None,
                },
            )
            .await?;

        Ok(ContractPsbtResponse {
            contract_id: funding.contract_id,
            psbt: funding.psbt_base64,
            txid: funding.txid,
            commitment_hash: funding.commitment_hash,
            commitment_script: funding.commitment_script,
            redeem_script: funding.redeem_script,
            commitment_address: funding.commitment_address,
            payout_scripts: funding.payout_scripts,
            payout_amounts: funding.payout_amounts,
            funding_amount_sats: funding.funding_amount_sats,
            fee_reserve_sats: funding.fee_reserve_sats,
        })
    }

    /// Reveal the commitment and build the reveal template
    pub async fn build_commitment_psbt(
        &self,
        contract_id: &str,
        request: CommitmentPsbtRequest,
    ) -> EscrowResult<SpendPsbt> {
        info!("Building commitment PSBT for contract {}", contract_id);
        if let Some(task_id) = &request.task_id {
            self.check_task(contract_id, task_id).await?;
        }
        self.escrow
            .build_commitment_psbt(contract_id, &request.preimage, request.fee_rate_sats_vb)
            .await
    }

    pub async fn build_sweep_psbt(&self, contract_id: &str) -> EscrowResult<SpendPsbt> {
        self.escrow.build_sweep_psbt(contract_id).await
    }

    pub async fn claim_task(&self, task_id: &str, claimant: &str) -> EscrowResult<Claim> {
        self.board.claim_task(task_id, claimant, Utc::now()).await
    }

    pub async fn submit_work(&self, claim_id: Uuid, work: SubmitWork) -> EscrowResult<Submission> {
        self.board.submit_work(claim_id, work, Utc::now()).await
    }

    /// Reconciled proposals awaiting review, oldest first
    pub async fn pending_proposals(&self) -> Vec<Proposal> {
        self.proposals(Some(ProposalStatus::Pending)).await
    }

    pub async fn proposals(&self, status: Option<ProposalStatus>) -> Vec<Proposal> {
        let mut proposals: Vec<Proposal> = self
            .store
            .proposals
            .snapshot()
            .await
            .into_iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .collect();
        proposals.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at).then(a.id.cmp(&b.id)));
        proposals
    }

    /// Approve a pending proposal and create its contract (privileged)
    pub async fn approve_proposal(
        &self,
        api_key: &str,
        proposal_id: &str,
        goals: Vec<NewGoal>,
    ) -> EscrowResult<Contract> {
        self.authorize(api_key)?;

        let handle = self.store.proposals.get(proposal_id).await?;
        let mut proposal = handle.lock().await;
        if proposal.status != ProposalStatus::Pending {
            return Err(EscrowError::conflict(format!(
                "proposal {} is already {:?}",
                proposal_id, proposal.status
            )));
        }

        let contract = self
            .escrow
            .create_contract(NewContract {
                id: None,
                title: proposal.title.clone(),
                total_budget_sats: proposal.budget_sats,
                goals,
                skills: proposal.skills.clone(),
                proposal_id: Some(proposal.id.clone()),
            })
            .await?;

        proposal.status = ProposalStatus::Approved;
        proposal.contract_id = Some(contract.id.clone());
        proposal.updated_at = Utc::now();
        self.store
            .save(RecordKind::Proposal, proposal_id, &*proposal)
            .await?;
        self.store
            .record_event(
                EscrowEvent::new("proposal.approved")
                    .contract(&contract.id)
                    .metadata(serde_json::json!({ "proposal_id": proposal_id })),
            )
            .await?;

        info!("Approved proposal {} as contract {}", proposal_id, contract.id);
        Ok(contract)
    }

    /// Reject a pending proposal (privileged)
    pub async fn reject_proposal(
        &self,
        api_key: &str,
        proposal_id: &str,
        reason: &str,
    ) -> EscrowResult<Proposal> {
        self.authorize(api_key)?;

        let handle = self.store.proposals.get(proposal_id).await?;
        let mut proposal = handle.lock().await;
        if proposal.status != ProposalStatus::Pending {
            return Err(EscrowError::conflict(format!(
                "proposal {} is already {:?}",
                proposal_id, proposal.status
            )));
        }
        proposal.status = ProposalStatus::Rejected;
        proposal.updated_at = Utc::now();
        self.store
            .save(RecordKind::Proposal, proposal_id, &*proposal)
            .await?;
        self.store
            .record_event(
                EscrowEvent::new("proposal.rejected")
                    .metadata(serde_json::json!({ "proposal_id": proposal_id, "reason": reason })),
            )
            .await?;

        info!("Rejected proposal {}: {}", proposal_id, reason);
        Ok(proposal.clone())
    }

    /// Health check for the escrow node
    pub async fn health_check(&self) -> EscrowResult<NodeHealth> {
        let report = self
            .escort
            .health(Some(&self.provider), Some(&self.monitor))
            .await;

        Ok(NodeHealth {
            healthy: report.healthy,
            issues: report.issues,
            components: report.components,
            store_backend: self.store.backend_name().to_string(),
            scheduler_running: self.scheduler.is_running().await,
            scheduler: self.scheduler.stats(),
            monitor: report.monitor,
            timestamp: Utc::now(),
        })
    }

    /// Start the background loops
    pub async fn start(&self) -> EscrowResult<()> {
        self.escort.ensure_ready()?;
        self.scheduler.start().await
    }

    /// Shutdown the escrow node gracefully
    pub async fn shutdown(&self) -> EscrowResult<()> {
        info!("Shutting down escrow node");
        self.scheduler.stop().await;
        info!("Escrow node shutdown complete");
        Ok(())
    }

    fn authorize(&self, api_key: &str) -> EscrowResult<()> {
        match &self.config.api_key {
            Some(expected) if expected.as_bytes() != api_key.as_bytes() => {
                warn!("Rejected privileged call with a wrong API key");
                Err(EscrowError::unauthorized("invalid API key"))
            }
            _ => Ok(()),
        }
    }

    async fn check_task(&self, contract_id: &str, task_id: &str) -> EscrowResult<()> {
        let task = self.store.tasks.read(task_id).await?;
        if task.contract_id != contract_id {
            return Err(EscrowError::validation(format!(
                "task {} does not belong to contract {}",
                task_id, contract_id
            )));
        }
        Ok(())
    }
}
