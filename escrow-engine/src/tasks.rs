//! Claim Board - task claiming, submission and claim expiry
//!
//! A task holds at most one unexpired claim. Every operation locks the task
//! first and then the claim, so claim, submit and expiry on the same task are
//! serialized. A submission made strictly before the deadline wins; once the
//! deadline passes the claim is expired, the task is released and the late
//! submission is rejected.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    dispute::DisputeResolver,
    error::EscrowError,
    models::{
        Claim, ClaimEvidence, ClaimStatus, ContractStatus, DisputeCase, DisputeTrigger,
        EscrowEvent, Submission, Task, TaskStatus,
    },
    store::{EscrowStore, RecordKind},
    EscrowResult,
};

/// Configuration for the claim board
#[derive(Debug, Clone)]
pub struct ClaimBoardConfig {
    /// How long a claim holds its task
    pub claim_ttl: Duration,
}

impl Default for ClaimBoardConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::hours(24),
        }
    }
}

impl ClaimBoardConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            claim_ttl: config.claim_ttl(),
        }
    }
}

/// Work submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitWork {
    pub deliverable: String,
    /// Transaction backing the work, if any
    pub txid: Option<String>,
}

pub struct ClaimBoard {
    config: ClaimBoardConfig,
    store: Arc<EscrowStore>,
    disputes: Arc<DisputeResolver>,
}

impl ClaimBoard {
    pub fn new(
        config: ClaimBoardConfig,
        store: Arc<EscrowStore>,
        disputes: Arc<DisputeResolver>,
    ) -> Self {
        Self {
            config,
            store,
            disputes,
        }
    }

    pub fn claim_ttl(&self) -> Duration {
        self.config.claim_ttl
    }

    /// Claim an available task for `claimant`
    pub async fn claim_task(
        &self,
        task_id: &str,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<Claim> {
        info!("Claiming task {} for {}", task_id, claimant);
        validate_claimant(claimant)?;

        let contract_id = self.store.tasks.read(task_id).await?.contract_id;
        let contract = self.store.contracts.read(&contract_id).await?;
        if matches!(contract.status, ContractStatus::Closed | ContractStatus::Disputed) {
            return Err(EscrowError::conflict(format!(
                "contract {} is {:?}; its tasks cannot be claimed",
                contract_id, contract.status
            )));
        }

        let handle = self.store.tasks.get(task_id).await?;
        let mut task = handle.lock().await;

        if let Some(active) = task.active_claim {
            let claim_handle = self.store.claims.get(&active.to_string()).await?;
            let mut claim = claim_handle.lock().await;
            if claim.is_live_at(now) {
                return Err(EscrowError::conflict(format!(
                    "task {} is already claimed until {}",
                    task_id, claim.expires_at
                )));
            }
            if claim.status == ClaimStatus::Active {
                self.expire_locked(&mut task, &mut claim).await?;
            }
        }

        if !task.status.can_claim() {
            return Err(EscrowError::conflict(format!(
                "task {} is {:?} and cannot be claimed",
                task_id, task.status
            )));
        }

        let claim = Claim::new(
            task_id.to_string(),
            claimant.to_string(),
            now,
            self.config.claim_ttl,
        );
        task.transition(TaskStatus::Claimed)?;
        task.active_claim = Some(claim.id);
        task.claimant = Some(claimant.to_string());

        self.store.claims.insert(claim.id.to_string(), claim.clone()).await?;
        self.store
            .save(RecordKind::Claim, &claim.id.to_string(), &claim)
            .await?;
        self.store.save(RecordKind::Task, task_id, &*task).await?;
        self.store
            .record_event(
                EscrowEvent::new("task.claimed")
                    .contract(&task.contract_id)
                    .task(task_id)
                    .actor(claimant)
                    .metadata(serde_json::json!({
                        "claim_id": claim.id,
                        "expires_at": claim.expires_at,
                    })),
            )
            .await?;

        info!(
            "Task {} claimed by {} until {}",
            task_id, claimant, claim.expires_at
        );
        Ok(claim)
    }

    /// Submit work under a live claim
    pub async fn submit_work(
        &self,
        claim_id: Uuid,
        work: SubmitWork,
        now: DateTime<Utc>,
    ) -> EscrowResult<Submission> {
        if work.deliverable.trim().is_empty() {
            return Err(EscrowError::validation("deliverable cannot be empty"));
        }

        let task_id = self.store.claims.read(&claim_id.to_string()).await?.task_id;
        let task_handle = self.store.tasks.get(&task_id).await?;
        let mut task = task_handle.lock().await;
        let claim_handle = self.store.claims.get(&claim_id.to_string()).await?;
        let mut claim = claim_handle.lock().await;

        match claim.status {
            ClaimStatus::Active => {}
            ClaimStatus::Expired => {
                return Err(EscrowError::claim_expired(format!(
                    "claim {} expired at {}",
                    claim_id, claim.expires_at
                )))
            }
            status => {
                return Err(EscrowError::conflict(format!(
                    "claim {} is {:?}",
                    claim_id, status
                )))
            }
        }

        if now >= claim.expires_at {
            self.expire_locked(&mut task, &mut claim).await?;
            warn!(
                "Rejected submission for claim {}: deadline {} passed",
                claim_id, claim.expires_at
            );
            return Err(EscrowError::claim_expired(format!(
                "claim {} expired at {}",
                claim_id, claim.expires_at
            )));
        }

        if task.active_claim != Some(claim.id) {
            return Err(EscrowError::conflict(format!(
                "claim {} no longer holds task {}",
                claim_id, task_id
            )));
        }

        let submission = Submission {
            id: Uuid::new_v4(),
            claim_id,
            claimant: claim.claimant.clone(),
            deliverable: work.deliverable,
            txid: work.txid,
            submitted_at: now,
        };

        task.transition(TaskStatus::Submitted)?;
        task.submission = Some(submission.clone());
        claim.status = ClaimStatus::Submitted;

        self.store
            .save(RecordKind::Claim, &claim_id.to_string(), &*claim)
            .await?;
        self.store.save(RecordKind::Task, &task_id, &*task).await?;
        self.store
            .record_event(
                EscrowEvent::new("task.submitted")
                    .contract(&task.contract_id)
                    .task(&task_id)
                    .actor(&claim.claimant)
                    .metadata(serde_json::json!({ "submission_id": submission.id })),
            )
            .await?;

        info!("Work submitted for task {} by {}", task_id, claim.claimant);
        Ok(submission)
    }

    /// Expire every active claim whose deadline is at or before `now`
    pub async fn expire_claims(&self, now: DateTime<Utc>) -> EscrowResult<Vec<Uuid>> {
        let due: Vec<Claim> = self
            .store
            .claims
            .snapshot()
            .await
            .into_iter()
            .filter(|c| c.status == ClaimStatus::Active && now >= c.expires_at)
            .collect();

        let mut expired = Vec::new();
        for stale in due {
            let task_handle = self.store.tasks.get(&stale.task_id).await?;
            let mut task = task_handle.lock().await;
            let claim_handle = self.store.claims.get(&stale.id.to_string()).await?;
            let mut claim = claim_handle.lock().await;

            // a submission may have landed between the snapshot and the lock
            if claim.status != ClaimStatus::Active || now < claim.expires_at {
                continue;
            }
            self.expire_locked(&mut task, &mut claim).await?;
            expired.push(claim.id);
        }

        if !expired.is_empty() {
            info!("Expired {} claims", expired.len());
        }
        Ok(expired)
    }

    /// Accept submitted work
    pub async fn confirm_task(&self, task_id: &str) -> EscrowResult<Task> {
        let handle = self.store.tasks.get(task_id).await?;
        let mut task = handle.lock().await;
        task.transition(TaskStatus::Confirmed)?;
        self.store.save(RecordKind::Task, task_id, &*task).await?;
        self.store
            .record_event(
                EscrowEvent::new("task.confirmed")
                    .contract(&task.contract_id)
                    .task(task_id),
            )
            .await?;

        info!("Task {} confirmed", task_id);
        Ok(task.clone())
    }

    /// Mark the task disputed and hand the evidence to dispute resolution
    pub async fn report_conflict(
        &self,
        task_id: &str,
        evidence: Vec<ClaimEvidence>,
    ) -> EscrowResult<DisputeCase> {
        if evidence.is_empty() {
            return Err(EscrowError::validation("a conflict needs at least one candidate"));
        }

        let contract_id = {
            let handle = self.store.tasks.get(task_id).await?;
            let mut task = handle.lock().await;
            if task.status.can_transition(TaskStatus::Disputed) {
                task.transition(TaskStatus::Disputed)?;
                self.store.save(RecordKind::Task, task_id, &*task).await?;
                self.store
                    .record_event(
                        EscrowEvent::new("task.disputed")
                            .contract(&task.contract_id)
                            .task(task_id)
                            .metadata(serde_json::json!({ "candidates": evidence.len() })),
                    )
                    .await?;
            }
            task.contract_id.clone()
        };

        warn!(
            "Conflict reported on task {} with {} candidates",
            task_id,
            evidence.len()
        );
        self.disputes
            .resolve(&contract_id, task_id, DisputeTrigger::ConflictingClaims, evidence)
            .await
    }

    /// Evidence for a claim, using the stored proof of its submission txid
    pub async fn evidence_for_claim(&self, claim_id: Uuid) -> EscrowResult<ClaimEvidence> {
        let claim = self.store.claims.read(&claim_id.to_string()).await?;
        let task = self.store.tasks.read(&claim.task_id).await?;
        let txid = task
            .submission
            .as_ref()
            .filter(|s| s.claim_id == claim_id)
            .and_then(|s| s.txid.clone());

        let proof = match txid {
            Some(txid) => match self.store.proofs.find(&txid).await {
                Some(handle) => Some(handle.lock().await.clone()),
                None => None,
            },
            None => None,
        };

        Ok(ClaimEvidence {
            reference: claim_id.to_string(),
            claimant: claim.claimant,
            proof,
            script_passed: None,
        })
    }

    pub async fn get_task(&self, task_id: &str) -> EscrowResult<Task> {
        self.store.tasks.read(task_id).await
    }

    pub async fn get_claim(&self, claim_id: Uuid) -> EscrowResult<Claim> {
        self.store.claims.read(&claim_id.to_string()).await
    }

    /// Tasks of a contract in goal order
    pub async fn tasks_for_contract(&self, contract_id: &str) -> EscrowResult<Vec<Task>> {
        let contract = self.store.contracts.read(contract_id).await?;
        let mut tasks = Vec::new();
        for task_id in contract.goals.iter().flat_map(|g| g.task_ids.iter()) {
            tasks.push(self.store.tasks.read(task_id).await?);
        }
        Ok(tasks)
    }

    pub async fn available_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .store
            .tasks
            .snapshot()
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Available)
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Expire `claim` and release its task; both guards are held by the caller
    async fn expire_locked(&self, task: &mut Task, claim: &mut Claim) -> EscrowResult<()> {
        claim.status = ClaimStatus::Expired;
        if task.active_claim == Some(claim.id) {
            task.active_claim = None;
            task.claimant = None;
            if task.status == TaskStatus::Claimed {
                task.transition(TaskStatus::Available)?;
            }
        }

        self.store
            .save(RecordKind::Claim, &claim.id.to_string(), &*claim)
            .await?;
        self.store.save(RecordKind::Task, &task.id, &*task).await?;
        self.store
            .record_event(
                EscrowEvent::new("claim.expired")
                    .contract(&task.contract_id)
                    .task(&task.id)
                    .actor(&claim.claimant)
                    .metadata(serde_json::json!({
                        "claim_id": claim.id,
                        "expires_at": claim.expires_at,
                    })),
            )
            .await?;

        info!(
            "Claim {} on task {} expired; task is {:?}",
            claim.id, task.id, task.status
        );
        Ok(())
    }
}

fn validate_claimant(claimant: &str) -> EscrowResult<()> {
    if claimant.trim().is_empty() {
        return Err(EscrowError::validation("claimant cannot be empty"));
    }
    if claimant.len() > 128 {
        return Err(EscrowError::validation("claimant is too long (max 128 characters)"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::escort::EscortService;
    use crate::escrow::{EscrowManager, EscrowManagerConfig, NewContract, NewGoal, NewTask};
    use crate::monitor::{MonitorConfig, TransactionMonitor};

    const TASK: &str = "c1-g1-t1";

    async fn setup() -> (ClaimBoard, Arc<EscrowStore>) {
        let store = Arc::new(EscrowStore::in_memory());
        let monitor = Arc::new(TransactionMonitor::new(MonitorConfig::default(), store.clone()));
        let escrow = Arc::new(EscrowManager::new(
            EscrowManagerConfig {
                network: Network::Regtest,
                ..EscrowManagerConfig::default()
            },
            store.clone(),
            monitor,
        ));
        escrow
            .create_contract(NewContract {
                id: Some("c1".to_string()),
                title: "Mural".to_string(),
                total_budget_sats: 1_000,
                goals: vec![NewGoal {
                    title: "Paint".to_string(),
                    tasks: vec![NewTask {
                        title: "Sky".to_string(),
                        budget_sats: 500,
                        difficulty: Some("easy".to_string()),
                        requirements: vec![],
                    }],
                }],
                skills: vec![],
                proposal_id: None,
            })
            .await
            .unwrap();
        let disputes = Arc::new(DisputeResolver::new(
            store.clone(),
            Arc::new(EscortService::new(Network::Regtest)),
            escrow,
        ));
        let board = ClaimBoard::new(ClaimBoardConfig::default(), store.clone(), disputes);
        (board, store)
    }

    fn work() -> SubmitWork {
        SubmitWork {
            deliverable: "ipfs://sky".to_string(),
            txid: None,
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_expiry() {
        let (board, _) = setup().await;
        let now = Utc::now();

        let claim = board.claim_task(TASK, "alice", now).await.unwrap();
        assert_eq!(claim.expires_at, now + Duration::hours(24));
        assert!(matches!(
            board.claim_task(TASK, "bob", now + Duration::hours(1)).await,
            Err(EscrowError::Conflict(_))
        ));

        // a lapsed claim is replaced by the next claimant
        let later = now + Duration::hours(25);
        let second = board.claim_task(TASK, "bob", later).await.unwrap();
        assert_eq!(board.get_claim(claim.id).await.unwrap().status, ClaimStatus::Expired);
        let task = board.get_task(TASK).await.unwrap();
        assert_eq!(task.active_claim, Some(second.id));
        assert_eq!(task.claimant.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_submission_before_deadline_wins() {
        let (board, _) = setup().await;
        let now = Utc::now();
        let claim = board.claim_task(TASK, "alice", now).await.unwrap();

        let just_before = claim.expires_at - Duration::milliseconds(1);
        let submission = board.submit_work(claim.id, work(), just_before).await.unwrap();
        assert_eq!(submission.claimant, "alice");
        assert_eq!(board.get_task(TASK).await.unwrap().status, TaskStatus::Submitted);

        // submitted claims are not swept
        assert!(board.expire_claims(claim.expires_at).await.unwrap().is_empty());
        assert_eq!(board.confirm_task(TASK).await.unwrap().status, TaskStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_submission_at_deadline_is_rejected() {
        let (board, store) = setup().await;
        let now = Utc::now();
        let claim = board.claim_task(TASK, "alice", now).await.unwrap();

        assert!(matches!(
            board.submit_work(claim.id, work(), claim.expires_at).await,
            Err(EscrowError::ClaimExpired(_))
        ));
        let task = store.tasks.read(TASK).await.unwrap();
        assert_eq!(task.status, TaskStatus::Available);
        assert!(task.active_claim.is_none());

        // never resurrected
        assert!(matches!(
            board.submit_work(claim.id, work(), now).await,
            Err(EscrowError::ClaimExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_claims_releases_tasks() {
        let (board, store) = setup().await;
        let now = Utc::now();
        let claim = board.claim_task(TASK, "alice", now).await.unwrap();

        assert!(board.expire_claims(now).await.unwrap().is_empty());
        let expired = board.expire_claims(claim.expires_at).await.unwrap();
        assert_eq!(expired, vec![claim.id]);
        assert_eq!(board.available_tasks().await.len(), 1);

        let events = store.events_for_contract("c1").await;
        assert!(events.iter().any(|e| e.event_type == "claim.expired"));
    }

    #[tokio::test]
    async fn test_report_conflict_opens_dispute() {
        let (board, _) = setup().await;
        let claim = board.claim_task(TASK, "alice", Utc::now()).await.unwrap();
        let evidence = board.evidence_for_claim(claim.id).await.unwrap();
        assert!(evidence.proof.is_none());

        let case = board.report_conflict(TASK, vec![evidence]).await.unwrap();
        assert!(!case.is_resolved());
        assert_eq!(board.get_task(TASK).await.unwrap().status, TaskStatus::Disputed);
        assert!(matches!(
            board.claim_task(TASK, "bob", Utc::now()).await,
            Err(EscrowError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_validation() {
        let (board, _) = setup().await;
        assert!(matches!(
            board.claim_task(TASK, " ", Utc::now()).await,
            Err(EscrowError::Validation(_))
        ));
        assert!(matches!(
            board.claim_task("missing", "alice", Utc::now()).await,
            Err(EscrowError::NotFound(_))
        ));
    }
}
