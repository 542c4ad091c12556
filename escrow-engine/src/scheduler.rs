//! Reconciliation Scheduler - background sync loops
//!
//! Three independent loops run on fixed intervals:
//!
//! * **funding sync**: asks the funding provider where each active monitored
//!   transaction sits, verifies the inclusion proof and advances the monitor,
//!   then delivers every unacknowledged confirmation to the escrow manager
//! * **ingestion sync**: upserts proposal records from the ingestion source
//! * **claim sweep**: expires claims past their deadline
//!
//! Each provider call is bounded by a timeout. A failing loop backs off
//! exponentially without affecting the others. Cancellation stops further
//! ticks; a tick already running completes first.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::EngineConfig,
    dispute::DisputeResolver,
    error::EscrowError,
    escrow::EscrowManager,
    ingestion::{upsert_proposals, IngestionReport, IngestionSource},
    merkle::{depth, MerkleVerifier},
    models::{
        FundingObservation, MerkleProof, MonitoredTransaction, ProofStatus, TxStatus, TxType,
    },
    monitor::TransactionMonitor,
    provider::FundingProvider,
    store::{EscrowStore, RecordKind},
    tasks::ClaimBoard,
    EscrowResult,
};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub funding_interval: Duration,
    pub ingestion_interval: Duration,
    pub claim_sweep_interval: Duration,
    /// Bound on every provider or ingestion call
    pub provider_timeout: Duration,
    pub max_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            funding_interval: Duration::from_secs(30),
            ingestion_interval: Duration::from_secs(60),
            claim_sweep_interval: Duration::from_secs(60),
            provider_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            funding_interval: Duration::from_secs(config.funding_sync_interval_secs),
            ingestion_interval: Duration::from_secs(config.ingestion_sync_interval_secs),
            claim_sweep_interval: Duration::from_secs(config.claim_sweep_interval_secs),
            provider_timeout: config.provider_timeout(),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Funding,
    Ingestion,
    ClaimSweep,
}

impl LoopKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Funding => "funding sync",
            Self::Ingestion => "ingestion sync",
            Self::ClaimSweep => "claim sweep",
        }
    }
}

/// Observability counters
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub funding_ticks: AtomicU64,
    pub ingestion_ticks: AtomicU64,
    pub claim_sweep_ticks: AtomicU64,
    pub provider_errors: AtomicU64,
    pub ingestion_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub proofs_confirmed: AtomicU64,
    pub proofs_invalid: AtomicU64,
    pub claims_expired: AtomicU64,
    pub fundings_rebound: AtomicU64,
    pub delivery_errors: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatsSnapshot {
    pub funding_ticks: u64,
    pub ingestion_ticks: u64,
    pub claim_sweep_ticks: u64,
    pub provider_errors: u64,
    pub ingestion_errors: u64,
    pub timeouts: u64,
    pub proofs_confirmed: u64,
    pub proofs_invalid: u64,
    pub claims_expired: u64,
    pub fundings_rebound: u64,
    pub delivery_errors: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            funding_ticks: self.funding_ticks.load(Ordering::Relaxed),
            ingestion_ticks: self.ingestion_ticks.load(Ordering::Relaxed),
            claim_sweep_ticks: self.claim_sweep_ticks.load(Ordering::Relaxed),
            provider_errors: self.provider_errors.load(Ordering::Relaxed),
            ingestion_errors: self.ingestion_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            proofs_confirmed: self.proofs_confirmed.load(Ordering::Relaxed),
            proofs_invalid: self.proofs_invalid.load(Ordering::Relaxed),
            claims_expired: self.claims_expired.load(Ordering::Relaxed),
            fundings_rebound: self.fundings_rebound.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
        }
    }
}

/// Result of one funding tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingTickReport {
    pub tip_height: u64,
    pub checked: usize,
    pub observed: usize,
    pub confirmed: Vec<String>,
    pub invalid: Vec<String>,
    pub expired: Vec<String>,
    /// Confirmations the escrow manager acknowledged this tick
    pub delivered: Vec<String>,
    pub errors: usize,
}

/// Collaborators the scheduler drives
pub struct SchedulerDeps {
    pub store: Arc<EscrowStore>,
    pub monitor: Arc<TransactionMonitor>,
    pub escrow: Arc<EscrowManager>,
    pub board: Arc<ClaimBoard>,
    pub disputes: Arc<DisputeResolver>,
    pub provider: Arc<dyn FundingProvider>,
    pub ingestion: Arc<dyn IngestionSource>,
    pub verifier: MerkleVerifier,
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    deps: SchedulerDeps,
    stats: SchedulerStats,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> Self {
        Self {
            config,
            deps,
            stats: SchedulerStats::default(),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the three loops
    pub async fn start(self: &Arc<Self>) -> EscrowResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(EscrowError::conflict("scheduler is already running"));
        }

        let token = CancellationToken::new();
        let handles = [LoopKind::Funding, LoopKind::Ingestion, LoopKind::ClaimSweep]
            .into_iter()
            .map(|kind| tokio::spawn(self.clone().run_loop(kind, token.clone())))
            .collect();

        *running = Some(Running { token, handles });
        info!(
            "Scheduler started (funding every {:?}, ingestion every {:?}, claim sweep every {:?})",
            self.config.funding_interval,
            self.config.ingestion_interval,
            self.config.claim_sweep_interval
        );
        Ok(())
    }

    /// Cancel the loops and wait for in-flight ticks to finish
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.token.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                error!("Scheduler loop ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    async fn run_loop(self: Arc<Self>, kind: LoopKind, token: CancellationToken) {
        let interval = match kind {
            LoopKind::Funding => self.config.funding_interval,
            LoopKind::Ingestion => self.config.ingestion_interval,
            LoopKind::ClaimSweep => self.config.claim_sweep_interval,
        };
        let mut delay = Duration::ZERO;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            // not raced against the token so a started tick always completes
            let result = match kind {
                LoopKind::Funding => self.run_funding_tick().await.map(|_| ()),
                LoopKind::Ingestion => self.run_ingestion_tick().await.map(|_| ()),
                LoopKind::ClaimSweep => self.run_claim_sweep_tick(Utc::now()).await.map(|_| ()),
            };

            match result {
                Ok(()) => {
                    failures = 0;
                    delay = interval;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    delay = backoff_delay(interval, failures, self.config.max_backoff);
                    warn!(
                        "{} tick failed ({} in a row), retrying in {:?}: {}",
                        kind.name(),
                        failures,
                        delay,
                        e
                    );
                }
            }
        }

        debug!("{} loop exited", kind.name());
    }

    /// One funding reconciliation pass over every active monitored transaction
    pub async fn run_funding_tick(&self) -> EscrowResult<FundingTickReport> {
        self.stats.funding_ticks.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        let tip = self
            .bounded("tip height", self.deps.provider.tip_height())
            .await
            .inspect_err(|_| {
                self.stats.provider_errors.fetch_add(1, Ordering::Relaxed);
            })?;

        let mut report = FundingTickReport {
            tip_height: tip,
            ..FundingTickReport::default()
        };

        for tx in self.deps.monitor.list_active().await {
            report.checked += 1;
            let watched = tx.txid.clone();
            match self.reconcile(tx, tip, now).await {
                Ok(Some((txid, status))) => {
                    report.observed += 1;
                    match status {
                        ProofStatus::Confirmed => report.confirmed.push(txid),
                        ProofStatus::Invalid => report.invalid.push(txid),
                        ProofStatus::Provisional => {}
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    if matches!(e, EscrowError::Provider(_)) {
                        self.stats.provider_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    warn!("Funding sync for {} failed: {}", watched, e);
                }
            }
        }

        report.delivered = self.deliver_confirmations().await;
        report.expired = self.deps.monitor.expire_stale(now).await?;
        self.refresh_proposal_funding(now).await?;

        if report.observed > 0 || !report.expired.is_empty() {
            info!(
                "Funding sync at tip {}: {} checked, {} confirmed, {} invalid, {} expired",
                tip,
                report.checked,
                report.confirmed.len(),
                report.invalid.len(),
                report.expired.len()
            );
        }
        Ok(report)
    }

    /// One ingestion pass
    pub async fn run_ingestion_tick(&self) -> EscrowResult<IngestionReport> {
        self.stats.ingestion_ticks.fetch_add(1, Ordering::Relaxed);
        let records = self
            .bounded("ingestion fetch", self.deps.ingestion.fetch())
            .await
            .inspect_err(|_| {
                self.stats.ingestion_errors.fetch_add(1, Ordering::Relaxed);
            })?;

        upsert_proposals(
            &self.deps.store,
            self.deps.ingestion.name(),
            records,
            Utc::now(),
        )
        .await
    }

    /// One claim-TTL sweep
    pub async fn run_claim_sweep_tick(&self, now: DateTime<Utc>) -> EscrowResult<usize> {
        self.stats.claim_sweep_ticks.fetch_add(1, Ordering::Relaxed);
        let expired = self.deps.board.expire_claims(now).await?;
        self.stats
            .claims_expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        Ok(expired.len())
    }

    /// Verify and apply the provider's view of one transaction.
    ///
    /// Returns the txid actually observed, which differs from the monitored
    /// one when a funding template was broadcast under a wallet-built txid.
    async fn reconcile(
        &self,
        mut tx: MonitoredTransaction,
        tip: u64,
        now: DateTime<Utc>,
    ) -> EscrowResult<Option<(String, ProofStatus)>> {
        let stored = match self.deps.store.proofs.find(&tx.txid).await {
            Some(handle) => Some(handle.lock().await.clone()),
            None => None,
        };

        // confirmed proofs are final; only the depth keeps moving
        let proof = match stored {
            Some(proof) if proof.status == ProofStatus::Confirmed => proof,
            _ => {
                let mut observation = self
                    .bounded("lookup", self.deps.provider.lookup(&tx.txid))
                    .await?;
                if observation.is_none() {
                    if let Some(rebound) = self.locate_broadcast_funding(&tx).await? {
                        tx = rebound;
                        observation = self
                            .bounded("lookup", self.deps.provider.lookup(&tx.txid))
                            .await?;
                    }
                }
                let Some(observation) = observation else {
                    debug!("{} not yet observed on chain", tx.txid);
                    return Ok(None);
                };

                let status = self.deps.verifier.evaluate(
                    &observation.candidate(),
                    tip,
                    tx.required_depth,
                );
                let commitment_hash = self
                    .deps
                    .store
                    .contracts
                    .read(&tx.contract_id)
                    .await
                    .ok()
                    .and_then(|c| c.escrow.map(|e| e.commitment_hash));

                let proof = MerkleProof {
                    txid: tx.txid.clone(),
                    block_height: observation.block_height,
                    merkle_root: observation.merkle_root,
                    path: observation.path,
                    commitment_hash,
                    funded_amount_sats: tx.amount_sats,
                    funding_address: tx.watch_address.clone(),
                    status,
                    confirmed_at: (status == ProofStatus::Confirmed).then_some(now),
                    updated_at: now,
                };
                self.upsert_proof(&proof).await?;
                proof
            }
        };

        match proof.status {
            ProofStatus::Invalid => {
                self.stats.proofs_invalid.fetch_add(1, Ordering::Relaxed);
                self.deps
                    .monitor
                    .mark_failed(&tx.txid, "inclusion proof does not match the block header")
                    .await?;
                self.deps
                    .disputes
                    .open_for_invalid_proof(&tx.contract_id, None, proof)
                    .await?;
                Ok(Some((tx.txid, ProofStatus::Invalid)))
            }
            status => {
                let Some(observed) = depth(tip, proof.block_height) else {
                    return Ok(Some((tx.txid, ProofStatus::Provisional)));
                };
                let outcome = self
                    .deps
                    .monitor
                    .update_confirmations(&tx.txid, observed)
                    .await?;
                if outcome.current == TxStatus::Confirmed && outcome.previous != TxStatus::Confirmed {
                    self.stats.proofs_confirmed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Some((tx.txid, status)))
            }
        }
    }

    /// Find the wallet-built transaction paying a funding template's commitment address
    async fn locate_broadcast_funding(
        &self,
        tx: &MonitoredTransaction,
    ) -> EscrowResult<Option<MonitoredTransaction>> {
        if tx.tx_type != TxType::Funding {
            return Ok(None);
        }
        let Some(address) = tx.watch_address.as_deref() else {
            return Ok(None);
        };

        let mut outputs = self
            .bounded("address outputs", self.deps.provider.address_outputs(address))
            .await?;
        // prefer what is already mined, earliest first
        outputs.sort_by_key(|o| (!o.confirmed, o.block_height.unwrap_or(u64::MAX)));

        for output in outputs {
            if output.txid == tx.txid || output.value_sats < tx.amount_sats {
                continue;
            }
            if self.deps.monitor.get(&output.txid).await.is_some() {
                continue;
            }
            self.deps
                .escrow
                .rebind_funding(&tx.contract_id, &tx.txid, &output)
                .await?;
            self.stats.fundings_rebound.fetch_add(1, Ordering::Relaxed);
            return Ok(self.deps.monitor.get(&output.txid).await);
        }
        Ok(None)
    }

    /// Hand every unacknowledged confirmation to the escrow manager.
    ///
    /// A confirmation is acknowledged only after the manager applied it, so
    /// a failure here is retried on the next tick.
    async fn deliver_confirmations(&self) -> Vec<String> {
        let mut delivered = Vec::new();
        for event in self.deps.monitor.pending_notifications().await {
            let applied = match event.tx_type {
                TxType::Sweep => {
                    self.deps
                        .escrow
                        .on_sweep_confirmed(&event.contract_id, &event.txid)
                        .await
                }
                _ => self.deps.escrow.on_transaction_confirmed(&event).await,
            };
            let result = match applied {
                Ok(_) => self.deps.monitor.mark_notified(&event.txid).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => delivered.push(event.txid),
                Err(e) => {
                    self.stats.delivery_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Delivering {:?} confirmation {} for contract {} failed, will retry: {}",
                        event.tx_type, event.txid, event.contract_id, e
                    );
                }
            }
        }
        delivered
    }

    async fn upsert_proof(&self, proof: &MerkleProof) -> EscrowResult<()> {
        let (handle, inserted) = self
            .deps
            .store
            .proofs
            .get_or_insert(proof.txid.clone(), proof.clone())
            .await;
        if !inserted {
            let mut current = handle.lock().await;
            if current.status == ProofStatus::Confirmed {
                return Ok(());
            }
            *current = proof.clone();
        }
        self.deps
            .store
            .save(RecordKind::MerkleProof, &proof.txid, proof)
            .await
    }

    /// Refresh each proposal's funding view from the contract sharing its pixel hash
    async fn refresh_proposal_funding(&self, now: DateTime<Utc>) -> EscrowResult<()> {
        let mut funding_by_hash: HashMap<String, String> = HashMap::new();
        for contract in self.deps.store.contracts.snapshot().await {
            if let Some(escrow) = contract.escrow {
                funding_by_hash.insert(escrow.commitment_hash.to_lowercase(), escrow.funding_txid);
            }
        }
        if funding_by_hash.is_empty() {
            return Ok(());
        }

        for handle in self.deps.store.proposals.handles().await {
            let mut proposal = handle.lock().await;
            let Some(hash) = proposal.visible_pixel_hash.as_ref().map(|h| h.to_lowercase()) else {
                continue;
            };
            let Some(txid) = funding_by_hash.get(&hash) else {
                continue;
            };
            let Some(tx) = self.deps.monitor.get(txid).await else {
                continue;
            };

            let unchanged = proposal.funding.as_ref().is_some_and(|f| {
                f.txid == tx.txid && f.status == tx.status && f.depth == tx.observed_depth
            });
            if unchanged {
                continue;
            }

            proposal.funding = Some(FundingObservation {
                txid: tx.txid.clone(),
                status: tx.status,
                depth: tx.observed_depth,
                observed_at: now,
            });
            proposal.updated_at = now;
            self.deps
                .store
                .save(RecordKind::Proposal, &proposal.id, &*proposal)
                .await?;
            debug!(
                "Proposal {} funding now {:?} ({})",
                proposal.id, tx.status, tx.txid
            );
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> EscrowResult<T>
    where
        F: Future<Output = EscrowResult<T>>,
    {
        match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(EscrowError::provider(format!(
                    "{} timed out after {:?}",
                    what, self.config.provider_timeout
                )))
            }
        }
    }
}

/// `interval * 2^failures`, capped at `max`
pub fn backoff_delay(interval: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    interval.saturating_mul(factor).min(max.max(interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::config::Network;
    use crate::escort::EscortService;
    use crate::escrow::{
        EscrowManagerConfig, FundingPsbt, FundingRequest, NewContract, NewGoal, NewTask,
    };
    use crate::models::{ContractStatus, Payout};
    use crate::script::sha256_digest;
    use crate::store::{MemoryBackend, RecordBackend};
    use crate::test_support::regtest_address;
    use crate::ingestion::{FixtureIngestionSource, IngestedProposal};
    use crate::monitor::MonitorConfig;
    use crate::provider::{MockFundingProvider, MockProviderConfig};
    use crate::tasks::ClaimBoardConfig;

    struct Harness {
        scheduler: Arc<Scheduler>,
        provider: Arc<MockFundingProvider>,
        ingestion: Arc<FixtureIngestionSource>,
        monitor: Arc<TransactionMonitor>,
        escrow: Arc<EscrowManager>,
        store: Arc<EscrowStore>,
    }

    fn harness(config: SchedulerConfig) -> Harness {
        harness_over(config, Arc::new(EscrowStore::in_memory()))
    }

    fn harness_over(config: SchedulerConfig, store: Arc<EscrowStore>) -> Harness {
        let monitor = Arc::new(TransactionMonitor::new(MonitorConfig::default(), store.clone()));
        let escrow = Arc::new(EscrowManager::new(
            EscrowManagerConfig {
                network: Network::Regtest,
                fallback_address: Some(regtest_address(9)),
                ..EscrowManagerConfig::default()
            },
            store.clone(),
            monitor.clone(),
        ));
        let disputes = Arc::new(DisputeResolver::new(
            store.clone(),
            Arc::new(EscortService::new(Network::Regtest)),
            escrow.clone(),
        ));
        let board = Arc::new(ClaimBoard::new(
            ClaimBoardConfig::default(),
            store.clone(),
            disputes.clone(),
        ));
        let provider = Arc::new(MockFundingProvider::new(MockProviderConfig::default()));
        let ingestion = Arc::new(FixtureIngestionSource::default());

        let scheduler = Arc::new(Scheduler::new(
            config,
            SchedulerDeps {
                store: store.clone(),
                monitor: monitor.clone(),
                escrow: escrow.clone(),
                board,
                disputes,
                provider: provider.clone(),
                ingestion: ingestion.clone(),
                verifier: MerkleVerifier::new(Network::Regtest),
            },
        ));
        Harness {
            scheduler,
            provider,
            ingestion,
            monitor,
            escrow,
            store,
        }
    }

    /// Fails the next `n` contract writes
    #[derive(Default)]
    struct FlakyContractBackend {
        inner: MemoryBackend,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RecordBackend for FlakyContractBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn upsert(
            &self,
            kind: RecordKind,
            id: &str,
            body: serde_json::Value,
        ) -> EscrowResult<()> {
            if kind == RecordKind::Contract
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(EscrowError::storage("contract write refused"));
            }
            self.inner.upsert(kind, id, body).await
        }

        async fn delete(&self, kind: RecordKind, id: &str) -> EscrowResult<()> {
            self.inner.delete(kind, id).await
        }

        async fn load_all(&self, kind: RecordKind) -> EscrowResult<Vec<serde_json::Value>> {
            self.inner.load_all(kind).await
        }
    }

    async fn funded_template(h: &Harness) -> FundingPsbt {
        h.escrow
            .create_contract(NewContract {
                id: Some("c1".to_string()),
                title: "Pixel mural".to_string(),
                total_budget_sats: 1_000,
                goals: vec![NewGoal {
                    title: "Paint".to_string(),
                    tasks: vec![NewTask {
                        title: "Sky".to_string(),
                        budget_sats: 1_000,
                        difficulty: None,
                        requirements: vec![],
                    }],
                }],
                skills: vec![],
                proposal_id: None,
            })
            .await
            .unwrap();
        h.escrow
            .build_funding_psbt(
                "c1",
                FundingRequest {
                    payouts: vec![Payout::new(regtest_address(1), 1_000)],
                    fee_rate_sats_vb: 1.0,
                    commitment_hash_hex: hex::encode(sha256_digest(b"pixel")),
                    fallback_address: None,
                    timeout_blocks: None,
                },
            )
            .await
            .unwrap()
    }

    fn txid(n: u8) -> String {
        hex::encode([n; 32])
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_secs(240));
        assert_eq!(backoff_delay(base, 4, max), max);
        assert_eq!(backoff_delay(base, u32::MAX, max), max);
    }

    #[tokio::test]
    async fn test_funding_tick_advances_monitor() {
        let h = harness(SchedulerConfig::default());
        h.monitor
            .add_transaction(MonitoredTransaction::new(txid(1), "c1", TxType::Payout, 500))
            .await
            .unwrap();

        let report = h.scheduler.run_funding_tick().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.observed, 0);

        h.provider.confirm(&txid(1), 1).await.unwrap();
        let report = h.scheduler.run_funding_tick().await.unwrap();
        assert_eq!(report.confirmed, vec![txid(1)]);
        assert_eq!(h.monitor.status(&txid(1)).await, Some(TxStatus::Confirmed));

        let proof = h.store.proofs.read(&txid(1)).await.unwrap();
        assert_eq!(proof.status, ProofStatus::Confirmed);
        assert!(proof.confirmed_at.is_some());
        assert_eq!(h.scheduler.stats().proofs_confirmed, 1);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let h = harness(SchedulerConfig {
            provider_timeout: Duration::from_millis(20),
            ..SchedulerConfig::default()
        });
        h.provider.set_latency(Duration::from_millis(500)).await;

        let err = h.scheduler.run_funding_tick().await.unwrap_err();
        assert!(matches!(err, EscrowError::Provider(_)));
        let stats = h.scheduler.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.provider_errors, 1);
    }

    #[tokio::test]
    async fn test_ingestion_failure_does_not_block_funding() {
        let h = harness(SchedulerConfig::default());
        h.ingestion.set_failing(true);
        assert!(h.scheduler.run_ingestion_tick().await.is_err());
        assert!(h.scheduler.run_funding_tick().await.is_ok());

        h.ingestion.set_failing(false);
        h.ingestion
            .push(IngestedProposal {
                id: "p1".to_string(),
                title: "Mural".to_string(),
                description: String::new(),
                budget_sats: 1_000,
                skills: vec![],
                visible_pixel_hash: None,
            })
            .await;
        let report = h.scheduler.run_ingestion_tick().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(h.scheduler.stats().ingestion_errors, 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let h = harness(SchedulerConfig {
            funding_interval: Duration::from_millis(10),
            ingestion_interval: Duration::from_millis(10),
            claim_sweep_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        });

        h.scheduler.start().await.unwrap();
        assert!(h.scheduler.is_running().await);
        assert!(h.scheduler.start().await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.scheduler.stop().await;
        assert!(!h.scheduler.is_running().await);

        let ticks = h.scheduler.stats().funding_ticks;
        assert!(ticks >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.scheduler.stats().funding_ticks, ticks);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let backend = Arc::new(FlakyContractBackend::default());
        let store = Arc::new(EscrowStore::new(backend.clone()));
        let h = harness_over(SchedulerConfig::default(), store.clone());
        let funding = funded_template(&h).await;
        h.provider.confirm(&funding.txid, 6).await.unwrap();

        backend.failures.store(1, Ordering::SeqCst);
        let report = h.scheduler.run_funding_tick().await.unwrap();
        assert_eq!(report.confirmed, vec![funding.txid.clone()]);
        assert!(report.delivered.is_empty());
        assert_eq!(h.scheduler.stats().delivery_errors, 1);
        assert_eq!(h.monitor.status(&funding.txid).await, Some(TxStatus::Confirmed));
        assert_eq!(
            h.escrow.get_contract("c1").await.unwrap().status,
            ContractStatus::Active
        );
        assert_eq!(h.monitor.pending_notifications().await.len(), 1);

        let report = h.scheduler.run_funding_tick().await.unwrap();
        assert_eq!(report.delivered, vec![funding.txid.clone()]);
        assert_eq!(
            h.escrow.get_contract("c1").await.unwrap().status,
            ContractStatus::Funded
        );
        assert!(h.monitor.pending_notifications().await.is_empty());

        // the acknowledgement is durable
        let restarted = TransactionMonitor::new(MonitorConfig::default(), store);
        restarted.restore().await.unwrap();
        assert!(restarted.pending_notifications().await.is_empty());

        let report = h.scheduler.run_funding_tick().await.unwrap();
        assert!(report.delivered.is_empty());
    }

    #[tokio::test]
    async fn test_funding_found_by_commitment_address() {
        let h = harness(SchedulerConfig::default());
        let funding = funded_template(&h).await;
        let broadcast = txid(7);
        h.provider
            .pay_to_address(&txid(8), 0, &funding.commitment_address, 10)
            .await;
        h.provider
            .pay_to_address(
                &broadcast,
                1,
                &funding.commitment_address,
                funding.funding_amount_sats,
            )
            .await;

        // seen in the mempool first
        let report = h.scheduler.run_funding_tick().await.unwrap();
        assert_eq!(report.observed, 0);
        assert!(h.monitor.get(&funding.txid).await.is_none());
        assert_eq!(h.monitor.status(&broadcast).await, Some(TxStatus::Pending));
        assert_eq!(h.scheduler.stats().fundings_rebound, 1);

        h.provider.confirm(&broadcast, 6).await.unwrap();
        let report = h.scheduler.run_funding_tick().await.unwrap();
        assert_eq!(report.confirmed, vec![broadcast.clone()]);
        assert_eq!(report.delivered, vec![broadcast.clone()]);

        let contract = h.escrow.get_contract("c1").await.unwrap();
        assert_eq!(contract.status, ContractStatus::Funded);
        let state = contract.escrow.unwrap();
        assert_eq!((state.funding_txid.as_str(), state.funding_vout), (broadcast.as_str(), 1));
        assert!(h.store.proofs.find(&broadcast).await.is_some());
        assert_eq!(h.scheduler.stats().fundings_rebound, 1);
    }
}
