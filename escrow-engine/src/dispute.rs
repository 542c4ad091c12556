//! Dispute Resolution - adjudicates conflicting claims and invalid proofs
//!
//! Adjudication is a pure function of the evidence set:
//!
//! 1. candidates whose witness failed script evaluation are ineligible
//! 2. a `confirmed` inclusion proof beats a provisional or missing one
//! 3. between confirmed proofs the earliest `confirmed_at` wins, then the
//!    lexically smaller txid, then the smaller claim reference
//!
//! With no eligible confirmed proof the case stays open and the task stays
//! disputed. A resolved case is never reopened.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::EscrowError,
    escort::EscortService,
    escrow::EscrowManager,
    models::{
        ClaimEvidence, DisputeCase, DisputeOutcome, DisputeTrigger, EscrowEvent, MerkleProof,
        ProofStatus, TaskStatus,
    },
    store::{EscrowStore, RecordKind},
    EscrowResult,
};

/// Claimant recorded for evidence that came from the funding provider
pub const PROVIDER_CLAIMANT: &str = "funding-provider";

/// Adjudicated winner of a case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub winner: String,
    pub reference: String,
    pub reason: String,
}

/// Pick the winning candidate, if any
pub fn adjudicate(candidates: &[ClaimEvidence]) -> Option<Verdict> {
    let mut confirmed: Vec<(&ClaimEvidence, &MerkleProof)> = candidates
        .iter()
        .filter(|c| c.script_passed != Some(false))
        .filter_map(|c| match &c.proof {
            Some(p) if p.status == ProofStatus::Confirmed && p.confirmed_at.is_some() => {
                Some((c, p))
            }
            _ => None,
        })
        .collect();

    confirmed.sort_by(|(ca, pa), (cb, pb)| {
        pa.confirmed_at
            .cmp(&pb.confirmed_at)
            .then_with(|| pa.txid.cmp(&pb.txid))
            .then_with(|| ca.reference.cmp(&cb.reference))
    });

    let rivals = confirmed.len();
    let (candidate, proof) = confirmed.into_iter().next()?;
    let reason = if rivals == 1 {
        format!("only confirmed proof ({})", proof.txid)
    } else {
        format!(
            "earliest confirmed proof ({}) among {} confirmed candidates",
            proof.txid, rivals
        )
    };

    Some(Verdict {
        winner: candidate.claimant.clone(),
        reference: candidate.reference.clone(),
        reason,
    })
}

pub struct DisputeResolver {
    store: Arc<EscrowStore>,
    escort: Arc<EscortService>,
    escrow: Arc<EscrowManager>,
}

impl DisputeResolver {
    pub fn new(
        store: Arc<EscrowStore>,
        escort: Arc<EscortService>,
        escrow: Arc<EscrowManager>,
    ) -> Self {
        Self {
            store,
            escort,
            escrow,
        }
    }

    /// Open or continue the case for `task_id` and try to resolve it.
    ///
    /// New evidence is merged into an open case by reference. A resolved
    /// case is returned unchanged.
    pub async fn resolve(
        &self,
        contract_id: &str,
        task_id: &str,
        trigger: DisputeTrigger,
        candidates: Vec<ClaimEvidence>,
    ) -> EscrowResult<DisputeCase> {
        self.escort.ensure_ready()?;

        // the task lock serializes case intake for the task
        let task_handle = self.store.tasks.get(task_id).await?;
        let mut task = task_handle.lock().await;
        if task.contract_id != contract_id {
            return Err(EscrowError::validation(format!(
                "task {} does not belong to contract {}",
                task_id, contract_id
            )));
        }

        let case_handle = match self.find_case(|c| c.task_id.as_deref() == Some(task_id)).await {
            Some(handle) => handle,
            None => {
                let case = DisputeCase::new(
                    contract_id.to_string(),
                    Some(task_id.to_string()),
                    trigger,
                    Vec::new(),
                );
                info!("Opening dispute {} for task {}", case.id, task_id);
                self.store
                    .record_event(
                        EscrowEvent::new("dispute.opened")
                            .contract(contract_id)
                            .task(task_id)
                            .metadata(serde_json::json!({ "case_id": case.id, "trigger": trigger })),
                    )
                    .await?;
                self.store.disputes.insert(case.id.to_string(), case).await?
            }
        };

        let mut case = case_handle.lock().await;
        if case.is_resolved() {
            return Ok(case.clone());
        }

        merge_evidence(&mut case.candidates, candidates);

        match adjudicate(&case.candidates) {
            Some(verdict) => {
                if task.status != TaskStatus::Disputed && task.status.can_transition(TaskStatus::Disputed) {
                    task.transition(TaskStatus::Disputed)?;
                }
                if task.status != TaskStatus::Confirmed {
                    task.transition(TaskStatus::Confirmed)?;
                }
                task.claimant = Some(verdict.winner.clone());
                self.store.save(RecordKind::Task, task_id, &*task).await?;
                self.close_case(&mut case, verdict).await?;
            }
            None => {
                if task.status.can_transition(TaskStatus::Disputed) {
                    task.transition(TaskStatus::Disputed)?;
                    self.store.save(RecordKind::Task, task_id, &*task).await?;
                }
                warn!(
                    "Dispute {} for task {} stays open: no eligible confirmed proof among {} candidates",
                    case.id,
                    task_id,
                    case.candidates.len()
                );
                self.store
                    .save(RecordKind::Dispute, &case.id.to_string(), &*case)
                    .await?;
            }
        }

        let result = case.clone();
        drop(case);
        drop(task);
        self.release_contract(&result).await?;
        Ok(result)
    }

    /// Record an invalid inclusion proof and dispute the contract
    pub async fn open_for_invalid_proof(
        &self,
        contract_id: &str,
        task_id: Option<&str>,
        proof: MerkleProof,
    ) -> EscrowResult<DisputeCase> {
        self.escort.ensure_ready()?;

        if proof.status != ProofStatus::Invalid {
            return Err(EscrowError::validation(format!(
                "proof for {} is {:?}, not invalid",
                proof.txid, proof.status
            )));
        }

        let existing = self
            .find_case(|c| {
                !c.is_resolved()
                    && c.trigger == DisputeTrigger::InvalidProof
                    && c.contract_id == contract_id
                    && c.task_id.as_deref() == task_id
                    && c.candidates.iter().any(|e| e.reference == proof.txid)
            })
            .await;
        if let Some(handle) = existing {
            return Ok(handle.lock().await.clone());
        }

        let txid = proof.txid.clone();
        let case = DisputeCase::new(
            contract_id.to_string(),
            task_id.map(str::to_string),
            DisputeTrigger::InvalidProof,
            vec![ClaimEvidence {
                reference: txid.clone(),
                claimant: PROVIDER_CLAIMANT.to_string(),
                proof: Some(proof),
                script_passed: None,
            }],
        );

        if let Some(task_id) = task_id {
            let handle = self.store.tasks.get(task_id).await?;
            let mut task = handle.lock().await;
            if task.status.can_transition(TaskStatus::Disputed) {
                task.transition(TaskStatus::Disputed)?;
                self.store.save(RecordKind::Task, task_id, &*task).await?;
            }
        }
        self.escrow.set_disputed(contract_id, true).await?;

        self.store
            .save(RecordKind::Dispute, &case.id.to_string(), &case)
            .await?;
        self.store
            .disputes
            .insert(case.id.to_string(), case.clone())
            .await?;
        self.store
            .record_event(
                EscrowEvent::new("dispute.opened")
                    .contract(contract_id)
                    .txid(&txid)
                    .metadata(serde_json::json!({
                        "case_id": case.id,
                        "trigger": DisputeTrigger::InvalidProof,
                    })),
            )
            .await?;

        warn!(
            "Invalid inclusion proof for {}; contract {} disputed (case {})",
            txid, contract_id, case.id
        );
        Ok(case)
    }

    /// Resolve an open case in favour of the candidate with `reference`
    pub async fn resolve_manually(
        &self,
        case_id: Uuid,
        reference: &str,
        reason: &str,
    ) -> EscrowResult<DisputeCase> {
        let handle = self.store.disputes.get(&case_id.to_string()).await?;
        let snapshot = handle.lock().await.clone();
        if snapshot.is_resolved() {
            return Ok(snapshot);
        }

        let winner = snapshot
            .candidates
            .iter()
            .find(|c| c.reference == reference)
            .map(|c| c.claimant.clone())
            .ok_or_else(|| {
                EscrowError::not_found(format!("no candidate {} in case {}", reference, case_id))
            })?;

        if let Some(task_id) = &snapshot.task_id {
            let task_handle = self.store.tasks.get(task_id).await?;
            let mut task = task_handle.lock().await;
            if task.status != TaskStatus::Confirmed {
                if task.status != TaskStatus::Disputed {
                    task.transition(TaskStatus::Disputed)?;
                }
                task.transition(TaskStatus::Confirmed)?;
            }
            task.claimant = Some(winner.clone());
            self.store.save(RecordKind::Task, task_id, &*task).await?;
        }

        let mut case = handle.lock().await;
        if case.is_resolved() {
            return Ok(case.clone());
        }
        self.close_case(
            &mut case,
            Verdict {
                winner,
                reference: reference.to_string(),
                reason: reason.to_string(),
            },
        )
        .await?;
        let result = case.clone();
        drop(case);
        self.release_contract(&result).await?;
        Ok(result)
    }

    pub async fn get_case(&self, case_id: Uuid) -> EscrowResult<DisputeCase> {
        self.store.disputes.read(&case_id.to_string()).await
    }

    pub async fn case_for_task(&self, task_id: &str) -> Option<DisputeCase> {
        match self.find_case(|c| c.task_id.as_deref() == Some(task_id)).await {
            Some(handle) => Some(handle.lock().await.clone()),
            None => None,
        }
    }

    pub async fn list_cases(&self) -> Vec<DisputeCase> {
        let mut cases = self.store.disputes.snapshot().await;
        cases.sort_by_key(|c| c.created_at);
        cases
    }

    pub async fn open_cases(&self) -> Vec<DisputeCase> {
        self.list_cases()
            .await
            .into_iter()
            .filter(|c| !c.is_resolved())
            .collect()
    }

    async fn find_case<F>(&self, predicate: F) -> Option<crate::store::Shared<DisputeCase>>
    where
        F: Fn(&DisputeCase) -> bool,
    {
        for handle in self.store.disputes.handles().await {
            if predicate(&*handle.lock().await) {
                return Some(handle);
            }
        }
        None
    }

    /// Lift the contract dispute once an invalid-proof case is resolved
    async fn release_contract(&self, case: &DisputeCase) -> EscrowResult<()> {
        if case.is_resolved() && case.trigger == DisputeTrigger::InvalidProof {
            self.escrow.set_disputed(&case.contract_id, false).await?;
        }
        Ok(())
    }

    async fn close_case(&self, case: &mut DisputeCase, verdict: Verdict) -> EscrowResult<()> {
        info!(
            "Dispute {} resolved for {} ({}): {}",
            case.id, verdict.winner, verdict.reference, verdict.reason
        );

        case.outcome = DisputeOutcome::Resolved {
            winner: verdict.winner.clone(),
            reference: verdict.reference.clone(),
            reason: verdict.reason.clone(),
        };
        case.resolved_at = Some(Utc::now());
        self.store
            .save(RecordKind::Dispute, &case.id.to_string(), &*case)
            .await?;

        let mut event = EscrowEvent::new("dispute.resolved")
            .contract(&case.contract_id)
            .actor(&verdict.winner)
            .metadata(serde_json::json!({
                "case_id": case.id,
                "reference": verdict.reference,
                "reason": verdict.reason,
            }));
        if let Some(task_id) = &case.task_id {
            event = event.task(task_id);
        }
        self.store.record_event(event).await
    }
}

fn merge_evidence(existing: &mut Vec<ClaimEvidence>, incoming: Vec<ClaimEvidence>) {
    for evidence in incoming {
        match existing.iter_mut().find(|e| e.reference == evidence.reference) {
            Some(slot) => *slot = evidence,
            None => existing.push(evidence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::escrow::{EscrowManagerConfig, NewContract, NewGoal, NewTask};
    use crate::models::ContractStatus;
    use crate::monitor::{MonitorConfig, TransactionMonitor};
    use chrono::{DateTime, Duration};

    async fn setup() -> (DisputeResolver, Arc<EscrowStore>, Arc<EscrowManager>) {
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
                        difficulty: None,
                        requirements: vec![],
                    }],
                }],
                skills: vec![],
                proposal_id: None,
            })
            .await
            .unwrap();
        let resolver = DisputeResolver::new(
            store.clone(),
            Arc::new(EscortService::new(Network::Regtest)),
            escrow.clone(),
        );
        (resolver, store, escrow)
    }

    fn proof(txid: &str, status: ProofStatus, confirmed_at: Option<DateTime<Utc>>) -> MerkleProof {
        MerkleProof {
            txid: txid.to_string(),
            block_height: 101,
            merkle_root: "00".repeat(32),
            path: vec![],
            commitment_hash: None,
            funded_amount_sats: 500,
            funding_address: None,
            status,
            confirmed_at,
            updated_at: Utc::now(),
        }
    }

    fn evidence(reference: &str, claimant: &str, proof: Option<MerkleProof>) -> ClaimEvidence {
        ClaimEvidence {
            reference: reference.to_string(),
            claimant: claimant.to_string(),
            proof,
            script_passed: None,
        }
    }

    #[test]
    fn test_earliest_confirmation_wins() {
        let t0 = Utc::now();
        let verdict = adjudicate(&[
            evidence("claim-b", "bob", Some(proof("aa", ProofStatus::Confirmed, Some(t0 + Duration::seconds(5))))),
            evidence("claim-a", "alice", Some(proof("bb", ProofStatus::Confirmed, Some(t0)))),
        ])
        .unwrap();
        assert_eq!(verdict.winner, "alice");
        assert_eq!(verdict.reference, "claim-a");
    }

    #[test]
    fn test_tie_breaks_on_txid_then_reference() {
        let t0 = Utc::now();
        let verdict = adjudicate(&[
            evidence("claim-1", "bob", Some(proof("bb", ProofStatus::Confirmed, Some(t0)))),
            evidence("claim-2", "alice", Some(proof("aa", ProofStatus::Confirmed, Some(t0)))),
        ])
        .unwrap();
        assert_eq!(verdict.winner, "alice");

        let verdict = adjudicate(&[
            evidence("claim-9", "bob", Some(proof("aa", ProofStatus::Confirmed, Some(t0)))),
            evidence("claim-3", "carol", Some(proof("aa", ProofStatus::Confirmed, Some(t0)))),
        ])
        .unwrap();
        assert_eq!(verdict.winner, "carol");
    }

    #[test]
    fn test_confirmed_beats_provisional_and_failed_scripts_are_ineligible() {
        let t0 = Utc::now();
        let verdict = adjudicate(&[
            evidence("claim-a", "alice", Some(proof("aa", ProofStatus::Provisional, None))),
            evidence("claim-b", "bob", Some(proof("bb", ProofStatus::Confirmed, Some(t0)))),
        ])
        .unwrap();
        assert_eq!(verdict.winner, "bob");

        let mut failed = evidence("claim-b", "bob", Some(proof("bb", ProofStatus::Confirmed, Some(t0))));
        failed.script_passed = Some(false);
        assert!(adjudicate(&[failed, evidence("claim-c", "carol", None)]).is_none());
    }

    #[tokio::test]
    async fn test_unconfirmed_dispute_stays_open_then_resolves_once() {
        let (resolver, store, _) = setup().await;
        let case = resolver
            .resolve(
                "c1",
                "c1-g1-t1",
                DisputeTrigger::ConflictingClaims,
                vec![
                    evidence("claim-a", "alice", Some(proof("aa", ProofStatus::Provisional, None))),
                    evidence("claim-b", "bob", None),
                ],
            )
            .await
            .unwrap();
        assert_eq!(case.outcome, DisputeOutcome::Open);
        assert_eq!(
            store.tasks.read("c1-g1-t1").await.unwrap().status,
            TaskStatus::Disputed
        );

        let t0 = Utc::now();
        let case = resolver
            .resolve(
                "c1",
                "c1-g1-t1",
                DisputeTrigger::ConflictingClaims,
                vec![evidence("claim-a", "alice", Some(proof("aa", ProofStatus::Confirmed, Some(t0))))],
            )
            .await
            .unwrap();
        assert!(case.is_resolved());
        assert_eq!(case.candidates.len(), 2);
        let task = store.tasks.read("c1-g1-t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Confirmed);
        assert_eq!(task.claimant.as_deref(), Some("alice"));

        // later evidence cannot reopen a resolved case
        let again = resolver
            .resolve(
                "c1",
                "c1-g1-t1",
                DisputeTrigger::ConflictingClaims,
                vec![evidence("claim-z", "zed", Some(proof("00", ProofStatus::Confirmed, Some(t0 - Duration::hours(1)))))],
            )
            .await
            .unwrap();
        assert_eq!(again.outcome, case.outcome);
        assert_eq!(resolver.list_cases().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_proof_disputes_contract_until_resolved() {
        let (resolver, _, escrow) = setup().await;
        let case = resolver
            .open_for_invalid_proof("c1", None, proof("ff", ProofStatus::Invalid, None))
            .await
            .unwrap();
        assert_eq!(escrow.get_contract("c1").await.unwrap().status, ContractStatus::Disputed);

        let same = resolver
            .open_for_invalid_proof("c1", None, proof("ff", ProofStatus::Invalid, None))
            .await
            .unwrap();
        assert_eq!(same.id, case.id);

        assert!(resolver
            .open_for_invalid_proof("c1", None, proof("ee", ProofStatus::Confirmed, None))
            .await
            .is_err());

        let resolved = resolver
            .resolve_manually(case.id, "ff", "provider served a stale header")
            .await
            .unwrap();
        assert!(resolved.is_resolved());
        assert!(resolver.open_cases().await.is_empty());
        assert_eq!(escrow.get_contract("c1").await.unwrap().status, ContractStatus::Active);
    }
}
