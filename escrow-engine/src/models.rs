//! Core data models for the escrow system
//!
//! This module contains the persisted records, their state machines,
//! and the value types passed between the escrow components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::EscrowError, EscrowResult};

/// Contract lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    /// Approved, escrow not yet funded on chain
    Active,
    /// Funding transaction confirmed at required depth
    Funded,
    /// Conflicting evidence under adjudication
    Disputed,
    /// Commitment honored and funds moved out of escrow
    Closed,
}

impl ContractStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check whether moving to `to` is allowed
    pub fn can_transition(&self, to: ContractStatus) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Funded)
                | (Self::Active, Self::Disputed)
                | (Self::Funded, Self::Disputed)
                | (Self::Funded, Self::Closed)
                | (Self::Disputed, Self::Active)
                | (Self::Disputed, Self::Funded)
                | (Self::Disputed, Self::Closed)
        )
    }
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Open for claims
    Available,
    /// Held by exactly one unexpired claim
    Claimed,
    /// Work submitted under the active claim
    Submitted,
    /// Work accepted
    Confirmed,
    /// Conflicting claims or an invalid proof
    Disputed,
}

impl TaskStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    /// Check if this state allows claiming
    pub fn can_claim(&self) -> bool {
        matches!(self, Self::Available)
    }

    /// Check whether moving to `to` is allowed
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (Self::Available, Self::Claimed)
                | (Self::Available, Self::Disputed)
                | (Self::Claimed, Self::Available)
                | (Self::Claimed, Self::Submitted)
                | (Self::Claimed, Self::Disputed)
                | (Self::Submitted, Self::Confirmed)
                | (Self::Submitted, Self::Disputed)
                | (Self::Disputed, Self::Confirmed)
        )
    }
}

/// Claim lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Active,
    Submitted,
    Expired,
    Released,
}

/// A single payout of the escrow split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub address: String,
    pub amount_sats: u64,
}

impl Payout {
    pub fn new(address: impl Into<String>, amount_sats: u64) -> Self {
        Self {
            address: address.into(),
            amount_sats,
        }
    }
}

/// Ordered goal of a contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub task_ids: Vec<String>,
}

/// Escrow parameters derived when the funding template is built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowState {
    pub commitment_hash: String,
    pub commitment_script: String,
    pub redeem_script: String,
    pub commitment_address: String,
    pub payouts: Vec<Payout>,
    pub fallback_address: String,
    pub timeout_blocks: u16,
    pub funding_txid: String,
    pub funding_vout: u32,
    pub funding_amount_sats: u64,
    pub fee_reserve_sats: u64,
    pub funding_confirmed: bool,
    pub revealed_preimage: Option<String>,
    pub commitment_txid: Option<String>,
    pub commitment_confirmed: bool,
    pub sweep_txid: Option<String>,
}

impl EscrowState {
    /// Sum of all payout amounts, saturating at `u64::MAX`
    pub fn payout_total(&self) -> u64 {
        self.payouts
            .iter()
            .fold(0u64, |acc, p| acc.saturating_add(p.amount_sats))
    }
}

/// Contract model created on proposal approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub title: String,
    pub total_budget_sats: u64,
    /// Budget already paid out by earlier escrows
    pub settled_sats: u64,
    pub goals: Vec<Goal>,
    pub status: ContractStatus,
    pub skills: Vec<String>,
    pub escrow: Option<EscrowState>,
    pub proposal_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    /// Create a new contract
    pub fn new(
        id: String,
        title: String,
        total_budget_sats: u64,
        goals: Vec<Goal>,
        skills: Vec<String>,
    ) -> Self {
        Self {
            id,
            title,
            total_budget_sats,
            settled_sats: 0,
            goals,
            status: ContractStatus::Active,
            skills,
            escrow: None,
            proposal_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Budget not yet paid out
    pub fn remaining_budget(&self) -> u64 {
        self.total_budget_sats.saturating_sub(self.settled_sats)
    }

    /// Validate and apply a status transition
    pub fn transition(&mut self, to: ContractStatus) -> EscrowResult<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition(to) {
            return Err(EscrowError::state_transition(
                format!("{:?}", self.status),
                format!("{:?}", to),
                format!("contract {}", self.id),
            ));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Work submitted under a claim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub claimant: String,
    pub deliverable: String,
    /// On-chain evidence backing the submission, if any
    pub txid: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Task model, exclusively owned by its contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub contract_id: String,
    pub goal_id: String,
    pub title: String,
    pub budget_sats: u64,
    pub status: TaskStatus,
    pub difficulty: Option<String>,
    pub requirements: Vec<String>,
    pub active_claim: Option<Uuid>,
    pub claimant: Option<String>,
    pub submission: Option<Submission>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task
    pub fn new(
        id: String,
        contract_id: String,
        goal_id: String,
        title: String,
        budget_sats: u64,
    ) -> Self {
        Self {
            id,
            contract_id,
            goal_id,
            title,
            budget_sats,
            status: TaskStatus::Available,
            difficulty: None,
            requirements: Vec::new(),
            active_claim: None,
            claimant: None,
            submission: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Validate and apply a status transition
    pub fn transition(&mut self, to: TaskStatus) -> EscrowResult<()> {
        if !self.status.can_transition(to) {
            return Err(EscrowError::state_transition(
                format!("{:?}", self.status),
                format!("{:?}", to),
                format!("task {}", self.id),
            ));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Binding of a task to a claimant with a deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub task_id: String,
    pub claimant: String,
    pub status: ClaimStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(task_id: String, claimant: String, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            claimant,
            status: ClaimStatus::Active,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// A claim is live strictly before its deadline
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ClaimStatus::Active && now < self.expires_at
    }
}

/// Role of a monitored transaction in the escrow flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Funding,
    Commitment,
    Payout,
    Sweep,
}

impl TxType {
    pub const ALL: [TxType; 4] = [Self::Funding, Self::Commitment, Self::Payout, Self::Sweep];

    /// Whether confirmation of this type is reported to the escrow manager
    pub fn notifies_escrow(&self) -> bool {
        matches!(self, Self::Funding | Self::Commitment | Self::Sweep)
    }
}

/// Confirmation state of a monitored transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Registered, not yet observed on chain
    Pending,
    /// Observed, below required depth
    Confirming,
    /// Required depth reached
    Confirmed,
    /// Replaced, evicted or explicitly abandoned
    Failed,
}

impl TxStatus {
    pub const ALL: [TxStatus; 4] = [
        Self::Pending,
        Self::Confirming,
        Self::Confirmed,
        Self::Failed,
    ];

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    /// Check whether `self` is a valid predecessor of `to`
    pub fn can_advance_to(&self, to: TxStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Confirming)
                | (Self::Pending, Self::Confirmed)
                | (Self::Confirming, Self::Confirmed)
                | (Self::Pending, Self::Failed)
                | (Self::Confirming, Self::Failed)
        )
    }
}

/// A transaction the escrow expects to appear on chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredTransaction {
    pub txid: String,
    pub contract_id: String,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub required_depth: u32,
    pub observed_depth: Option<u32>,
    pub amount_sats: u64,
    pub counterparties: Vec<String>,
    pub metadata: serde_json::Value,
    /// Address the funder pays, used when the final txid differs from the template
    pub watch_address: Option<String>,
    pub notified: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl MonitoredTransaction {
    pub fn new(
        txid: impl Into<String>,
        contract_id: impl Into<String>,
        tx_type: TxType,
        amount_sats: u64,
    ) -> Self {
        Self {
            txid: txid.into(),
            contract_id: contract_id.into(),
            tx_type,
            status: TxStatus::Pending,
            required_depth: 0,
            observed_depth: None,
            amount_sats,
            counterparties: Vec::new(),
            metadata: serde_json::Value::Null,
            watch_address: None,
            notified: false,
            failure_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            confirmed_at: None,
        }
    }

    pub fn with_counterparties(mut self, counterparties: Vec<String>) -> Self {
        self.counterparties = counterparties;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_watch_address(mut self, address: impl Into<String>) -> Self {
        self.watch_address = Some(address.into());
        self
    }
}

/// Which side of the running hash a proof sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingPosition {
    Left,
    Right,
}

/// One step of a merkle inclusion path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Sibling hash in display (reversed) hex, as explorers print txids
    pub sibling: String,
    pub position: SiblingPosition,
}

/// Verification outcome of an inclusion proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    /// Not yet verifiable; retried on a later tick
    Provisional,
    /// Root matches and depth is satisfied; immutable from here on
    Confirmed,
    /// Root mismatch; terminal
    Invalid,
}

/// Inclusion proof for a funding or commitment transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    pub txid: String,
    pub block_height: u64,
    pub merkle_root: String,
    pub path: Vec<ProofStep>,
    pub commitment_hash: Option<String>,
    pub funded_amount_sats: u64,
    pub funding_address: Option<String>,
    pub status: ProofStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Why a dispute was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeTrigger {
    ConflictingClaims,
    InvalidProof,
}

/// Evidence backing one competing claim or submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimEvidence {
    /// Claim or submission id
    pub reference: String,
    pub claimant: String,
    pub proof: Option<MerkleProof>,
    /// Interpreter verdict for the claimant's witness, if evaluated
    pub script_passed: Option<bool>,
}

/// Outcome of a dispute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DisputeOutcome {
    Open,
    Resolved {
        winner: String,
        reference: String,
        reason: String,
    },
}

/// Recorded adjudication over a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeCase {
    pub id: Uuid,
    pub contract_id: String,
    /// Contested task; `None` for a contract-level invalid funding proof
    pub task_id: Option<String>,
    pub trigger: DisputeTrigger,
    pub candidates: Vec<ClaimEvidence>,
    pub outcome: DisputeOutcome,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DisputeCase {
    pub fn new(
        contract_id: String,
        task_id: Option<String>,
        trigger: DisputeTrigger,
        candidates: Vec<ClaimEvidence>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contract_id,
            task_id,
            trigger,
            candidates,
            outcome: DisputeOutcome::Open,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.outcome, DisputeOutcome::Resolved { .. })
    }
}

/// Proposal review state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Latest funding view of a proposal's commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingObservation {
    pub txid: String,
    pub status: TxStatus,
    pub depth: Option<u32>,
    pub observed_at: DateTime<Utc>,
}

/// Reconciled proposal surfaced to agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub budget_sats: u64,
    pub skills: Vec<String>,
    pub visible_pixel_hash: Option<String>,
    pub status: ProposalStatus,
    pub contract_id: Option<String>,
    pub funding: Option<FundingObservation>,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Escrow event for audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEvent {
    pub id: Uuid,
    pub event_type: String,
    pub contract_id: Option<String>,
    pub task_id: Option<String>,
    pub txid: Option<String>,
    pub actor: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl EscrowEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            contract_id: None,
            task_id: None,
            txid: None,
            actor: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn contract(mut self, contract_id: impl Into<String>) -> Self {
        self.contract_id = Some(contract_id.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn txid(mut self, txid: impl Into<String>) -> Self {
        self.txid = Some(txid.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
