//! Escrow Manager - contract lifecycle and PSBT templates
//!
//! Turns contract parameters into a commitment address and the three
//! unsigned transaction templates of the escrow flow:
//!
//! 1. **funding**: pays `payouts + fee reserve` to the P2WSH commitment
//!    address. It carries no inputs; the funder's wallet adds and signs them.
//! 2. **commitment (reveal)**: spends the escrow output through the hash-lock
//!    branch with the preimage, pays the payout set and announces the
//!    commitment hash in an `OP_RETURN`.
//! 3. **sweep**: moves the confirmed escrow output to exactly the payout set.
//!
//! Every successful build registers its txid with the [`TransactionMonitor`]
//! as pending. Nothing here signs or broadcasts.

use std::{str::FromStr, sync::Arc};

use bitcoin::{
    absolute::LockTime, opcodes::all::OP_RETURN, script::Builder, transaction::Version, Amount,
    OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use chrono::Utc;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::{EngineConfig, Network},
    error::EscrowError,
    models::{
        Contract, ContractStatus, EscrowEvent, EscrowState, Goal, MonitoredTransaction, Payout,
        ProofStatus, Task, TxStatus, TxType,
    },
    monitor::{ConfirmationEvent, TransactionMonitor},
    provider::AddressOutput,
    script::{
        interpret, sha256_digest, ExecutionContext, ScriptBuilder, ScriptParams, ScriptSet,
        ScriptWitness,
    },
    store::{EscrowStore, RecordKind},
    EscrowResult,
};

/// Preimage length assumed when sizing the fee reserve
const RESERVE_PREIMAGE_LEN: usize = 64;

/// Configuration for the escrow manager
#[derive(Debug, Clone)]
pub struct EscrowManagerConfig {
    pub network: Network,
    /// Relative timeout (blocks) when a request does not set one
    pub default_timeout_blocks: u16,
    /// Fallback address when a request does not name one
    pub fallback_address: Option<String>,
    /// Key required on the timeout branch; anyone-can-spend to the fallback when unset
    pub fallback_pubkey: Option<PublicKey>,
}

impl Default for EscrowManagerConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            default_timeout_blocks: 144, // ~1 day
            fallback_address: None,
            fallback_pubkey: None,
        }
    }
}

impl EscrowManagerConfig {
    pub fn from_config(config: &EngineConfig) -> EscrowResult<Self> {
        Ok(Self {
            network: config.network,
            default_timeout_blocks: config.timeout_blocks,
            fallback_address: config.fallback_address.clone(),
            fallback_pubkey: config.fallback_key()?,
        })
    }
}

/// Task definition inside a new contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub budget_sats: u64,
    pub difficulty: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Goal definition inside a new contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGoal {
    pub title: String,
    pub tasks: Vec<NewTask>,
}

/// Contract creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContract {
    pub id: Option<String>,
    pub title: String,
    pub total_budget_sats: u64,
    pub goals: Vec<NewGoal>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub proposal_id: Option<String>,
}

/// Funding template request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRequest {
    pub payouts: Vec<Payout>,
    pub fee_rate_sats_vb: f64,
    pub commitment_hash_hex: String,
    pub fallback_address: Option<String>,
    pub timeout_blocks: Option<u16>,
}

/// Funding template plus every derived script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPsbt {
    pub contract_id: String,
    pub psbt_base64: String,
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

/// Template spending the escrow output (reveal or sweep)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendPsbt {
    pub contract_id: String,
    pub tx_type: TxType,
    pub psbt_base64: String,
    pub txid: String,
    pub fee_sats: u64,
    pub payout_scripts: Vec<String>,
    pub payout_amounts: Vec<u64>,
    /// Whether the reveal witness is already finalized
    pub finalized: bool,
}

/// Escrow orchestrator
pub struct EscrowManager {
    config: EscrowManagerConfig,
    scripts: ScriptBuilder,
    store: Arc<EscrowStore>,
    monitor: Arc<TransactionMonitor>,
}

impl EscrowManager {
    /// Create a new escrow manager
    pub fn new(
        config: EscrowManagerConfig,
        store: Arc<EscrowStore>,
        monitor: Arc<TransactionMonitor>,
    ) -> Self {
        info!("Initializing escrow manager on {}", config.network.name());
        Self {
            scripts: ScriptBuilder::new(config.network),
            config,
            store,
            monitor,
        }
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    /// Create a contract and its tasks
    pub async fn create_contract(&self, request: NewContract) -> EscrowResult<Contract> {
        validate_new_contract(&request)?;

        let contract_id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut goals = Vec::new();
        let mut tasks = Vec::new();
        for (g, new_goal) in request.goals.iter().enumerate() {
            let goal_id = format!("{}-g{}", contract_id, g + 1);
            let mut task_ids = Vec::new();
            for (t, new_task) in new_goal.tasks.iter().enumerate() {
                let task_id = format!("{}-t{}", goal_id, t + 1);
                let mut task = Task::new(
                    task_id.clone(),
                    contract_id.clone(),
                    goal_id.clone(),
                    new_task.title.clone(),
                    new_task.budget_sats,
                );
                task.difficulty = new_task.difficulty.clone();
                task.requirements = new_task.requirements.clone();
                task_ids.push(task_id);
                tasks.push(task);
            }
            goals.push(Goal {
                id: goal_id,
                title: new_goal.title.clone(),
                task_ids,
            });
        }

        let mut contract = Contract::new(
            contract_id.clone(),
            request.title.clone(),
            request.total_budget_sats,
            goals,
            request.skills.clone(),
        );
        contract.proposal_id = request.proposal_id.clone();

        self.store
            .contracts
            .insert(contract_id.clone(), contract.clone())
            .await?;
        self.store
            .save(RecordKind::Contract, &contract_id, &contract)
            .await?;

        for task in tasks {
            self.store.tasks.insert(task.id.clone(), task.clone()).await?;
            self.store.save(RecordKind::Task, &task.id, &task).await?;
        }

        self.store
            .record_event(
                EscrowEvent::new("contract.created")
                    .contract(&contract_id)
                    .metadata(serde_json::json!({
                        "total_budget_sats": contract.total_budget_sats,
                        "goals": contract.goals.len(),
                    })),
            )
            .await?;

        info!(
            "Created contract {} with budget {} sats",
            contract_id, contract.total_budget_sats
        );
        Ok(contract)
    }

    /// Add a task to an existing goal, keeping the budget invariant
    pub async fn add_task(
        &self,
        contract_id: &str,
        goal_id: &str,
        new_task: NewTask,
    ) -> EscrowResult<Task> {
        if new_task.budget_sats == 0 {
            return Err(EscrowError::validation("task budget must be greater than 0"));
        }

        let handle = self.store.contracts.get(contract_id).await?;
        let mut contract = handle.lock().await;

        let allocated = self.allocated_budget(&contract).await;
        if allocated.saturating_add(new_task.budget_sats) > contract.total_budget_sats {
            return Err(EscrowError::validation(format!(
                "task budgets {} + {} exceed contract budget {}",
                allocated, new_task.budget_sats, contract.total_budget_sats
            )));
        }

        let goal = contract
            .goals
            .iter_mut()
            .find(|g| g.id == goal_id)
            .ok_or_else(|| EscrowError::not_found(format!("goal {} not found", goal_id)))?;
        let task_id = format!("{}-t{}", goal_id, goal.task_ids.len() + 1);
        goal.task_ids.push(task_id.clone());

        let mut task = Task::new(
            task_id.clone(),
            contract_id.to_string(),
            goal_id.to_string(),
            new_task.title,
            new_task.budget_sats,
        );
        task.difficulty = new_task.difficulty;
        task.requirements = new_task.requirements;

        self.store.tasks.insert(task_id.clone(), task.clone()).await?;
        self.store.save(RecordKind::Task, &task_id, &task).await?;
        contract.updated_at = Utc::now();
        self.store
            .save(RecordKind::Contract, contract_id, &*contract)
            .await?;

        info!("Added task {} to contract {}", task_id, contract_id);
        Ok(task)
    }

    /// Derive the escrow scripts and build the funding template
    pub async fn build_funding_psbt(
        &self,
        contract_id: &str,
        request: FundingRequest,
    ) -> EscrowResult<FundingPsbt> {
        validate_fee_rate(request.fee_rate_sats_vb)?;
        let commitment_hash = decode_commitment_hash(&request.commitment_hash_hex)?;

        let handle = self.store.contracts.get(contract_id).await?;
        let mut contract = handle.lock().await;

        if contract.status != ContractStatus::Active {
            return Err(EscrowError::state_transition(
                format!("{:?}", contract.status),
                "Funded".to_string(),
                format!("contract {} can only be funded while active", contract_id),
            ));
        }

        if let Some(existing) = &contract.escrow {
            if self.monitor.status(&existing.funding_txid).await != Some(TxStatus::Failed) {
                return Err(EscrowError::conflict(format!(
                    "contract {} already has funding template {}",
                    contract_id, existing.funding_txid
                )));
            }
        }

        let fallback_address = request
            .fallback_address
            .clone()
            .or_else(|| self.config.fallback_address.clone())
            .ok_or_else(|| EscrowError::validation("fallback address is required"))?;

        let params = ScriptParams {
            commitment_hash: commitment_hash.to_vec(),
            payouts: request.payouts.clone(),
            fallback_address: fallback_address.clone(),
            timeout_blocks: request
                .timeout_blocks
                .unwrap_or(self.config.default_timeout_blocks),
            fallback_pubkey: self.config.fallback_pubkey,
        };
        let scripts = self.scripts.derive(&params, contract.remaining_budget())?;

        let payout_total = scripts
            .payout_amounts
            .iter()
            .try_fold(0u64, |acc, amount| acc.checked_add(*amount))
            .ok_or_else(|| EscrowError::validation("payout sum overflows"))?;
        let reveal_outputs = reveal_outputs(&scripts, &commitment_hash);
        let reserve_vsize = estimate_spend_vsize(
            scripts.redeem_script.len(),
            RESERVE_PREIMAGE_LEN,
            &reveal_outputs,
        );
        let fee_reserve_sats = fee_for(reserve_vsize, request.fee_rate_sats_vb);
        let funding_amount_sats = payout_total
            .checked_add(fee_reserve_sats)
            .ok_or_else(|| EscrowError::validation("funding amount overflows"))?;

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(funding_amount_sats),
                script_pubkey: scripts.commitment_script_pubkey(),
            }],
        };
        let txid = tx.compute_txid().to_string();

        let mut psbt = Psbt::from_unsigned_tx(tx)
            .map_err(|e| EscrowError::psbt(format!("funding template: {}", e)))?;
        psbt.outputs[0].witness_script = Some(scripts.redeem_script.clone());

        let state = EscrowState {
            commitment_hash: hex::encode(commitment_hash),
            commitment_script: hex::encode(scripts.commitment_script.as_bytes()),
            redeem_script: hex::encode(scripts.redeem_script.as_bytes()),
            commitment_address: scripts.commitment_address.to_string(),
            payouts: request.payouts.clone(),
            fallback_address,
            timeout_blocks: params.timeout_blocks,
            funding_txid: txid.clone(),
            funding_vout: 0,
            funding_amount_sats,
            fee_reserve_sats,
            funding_confirmed: false,
            revealed_preimage: None,
            commitment_txid: None,
            commitment_confirmed: false,
            sweep_txid: None,
        };

        if let Some(previous) = &contract.escrow {
            // a failed template is replaced; stop watching it
            self.monitor.remove_transaction(&previous.funding_txid).await?;
        }

        self.monitor
            .add_transaction(
                MonitoredTransaction::new(&txid, contract_id, TxType::Funding, funding_amount_sats)
                    .with_counterparties(
                        request.payouts.iter().map(|p| p.address.clone()).collect(),
                    )
                    .with_watch_address(&state.commitment_address)
                    .with_metadata(serde_json::json!({
                        "commitment_hash": state.commitment_hash,
                        "fee_reserve_sats": fee_reserve_sats,
                    })),
            )
            .await?;

        let response = FundingPsbt {
            contract_id: contract_id.to_string(),
            psbt_base64: psbt.to_string(),
            txid: txid.clone(),
            commitment_hash: state.commitment_hash.clone(),
            commitment_script: state.commitment_script.clone(),
            redeem_script: state.redeem_script.clone(),
            commitment_address: state.commitment_address.clone(),
            payout_scripts: scripts
                .payout_scripts
                .iter()
                .map(|s| hex::encode(s.as_bytes()))
                .collect(),
            payout_amounts: scripts.payout_amounts.clone(),
            funding_amount_sats,
            fee_reserve_sats,
        };

        contract.escrow = Some(state);
        contract.updated_at = Utc::now();
        self.store
            .save(RecordKind::Contract, contract_id, &*contract)
            .await?;
        drop(contract);

        self.store
            .record_event(
                EscrowEvent::new("psbt.funding_built")
                    .contract(contract_id)
                    .txid(&txid)
                    .metadata(serde_json::json!({
                        "funding_amount_sats": funding_amount_sats,
                        "commitment_address": response.commitment_address,
                    })),
            )
            .await?;

        info!(
            "Built funding PSBT {} for contract {}: {} sats to {}",
            txid, contract_id, funding_amount_sats, response.commitment_address
        );
        Ok(response)
    }

    /// Build the reveal template satisfying the hash-lock with `preimage_hex`
    pub async fn build_commitment_psbt(
        &self,
        contract_id: &str,
        preimage_hex: &str,
        fee_rate_sats_vb: f64,
    ) -> EscrowResult<SpendPsbt> {
        validate_fee_rate(fee_rate_sats_vb)?;
        let preimage = hex::decode(preimage_hex.trim())?;
        if preimage.is_empty() {
            return Err(EscrowError::validation("preimage cannot be empty"));
        }

        let handle = self.store.contracts.get(contract_id).await?;
        let mut contract = handle.lock().await;
        ensure_open(&contract)?;

        let state = contract.escrow.clone().ok_or_else(|| {
            EscrowError::not_ready(format!("contract {} has no funding template", contract_id))
        })?;

        let actual = hex::encode(sha256_digest(&preimage));
        if actual != state.commitment_hash {
            warn!("Preimage mismatch for contract {}", contract_id);
            return Err(EscrowError::preimage_mismatch(
                state.commitment_hash.clone(),
                actual,
            ));
        }

        let scripts = self.rederive(&state)?;
        let evaluation = interpret(
            &scripts.redeem_script,
            &ScriptWitness::reveal(&preimage),
            &ExecutionContext::default(),
        );
        if !evaluation.passed {
            return Err(EscrowError::script(format!(
                "reveal witness rejected: {}",
                evaluation.failure.unwrap_or_default()
            )));
        }

        let commitment_hash = decode_commitment_hash(&state.commitment_hash)?;
        let outputs = reveal_outputs(&scripts, &commitment_hash);
        let vsize = estimate_spend_vsize(scripts.redeem_script.len(), preimage.len(), &outputs);
        let fee_sats = fee_for(vsize, fee_rate_sats_vb);
        let available = state
            .funding_amount_sats
            .saturating_sub(state.payout_total());
        if fee_sats > available {
            return Err(EscrowError::validation(format!(
                "fee {} sats at {} sat/vB exceeds the funded reserve of {} sats",
                fee_sats, fee_rate_sats_vb, available
            )));
        }

        let (psbt, txid) = spend_template(&state, &scripts, outputs, Some(&preimage))?;

        let mut updated = state.clone();
        updated.revealed_preimage = Some(hex::encode(&preimage));
        updated.commitment_txid = Some(txid.clone());
        contract.escrow = Some(updated);
        contract.updated_at = Utc::now();
        self.store
            .save(RecordKind::Contract, contract_id, &*contract)
            .await?;

        self.register_spend(contract_id, &txid, TxType::Commitment, &state)
            .await?;
        drop(contract);

        self.store
            .record_event(
                EscrowEvent::new("psbt.commitment_built")
                    .contract(contract_id)
                    .txid(&txid)
                    .metadata(serde_json::json!({ "fee_sats": fee_sats })),
            )
            .await?;

        info!(
            "Built commitment PSBT {} for contract {} (fee {} sats)",
            txid, contract_id, fee_sats
        );
        Ok(SpendPsbt {
            contract_id: contract_id.to_string(),
            tx_type: TxType::Commitment,
            psbt_base64: psbt.to_string(),
            txid,
            fee_sats,
            payout_scripts: hex_scripts(&scripts.payout_scripts),
            payout_amounts: scripts.payout_amounts,
            finalized: true,
        })
    }

    /// Build the sweep template once the escrow output is confirmed
    pub async fn build_sweep_psbt(&self, contract_id: &str) -> EscrowResult<SpendPsbt> {
        let handle = self.store.contracts.get(contract_id).await?;
        let mut contract = handle.lock().await;
        ensure_open(&contract)?;

        let state = contract.escrow.clone().ok_or_else(|| {
            EscrowError::not_ready(format!("contract {} has no funding template", contract_id))
        })?;

        if !self.escrow_output_confirmed(&state).await {
            return Err(EscrowError::not_ready(format!(
                "commitment output of contract {} is not confirmed",
                contract_id
            )));
        }

        if let Some(proof) = self.store.proofs.find(&state.funding_txid).await {
            if proof.lock().await.status == ProofStatus::Invalid {
                return Err(EscrowError::proof_invalid(format!(
                    "funding proof for {} is invalid",
                    state.funding_txid
                )));
            }
        }

        let scripts = self.rederive(&state)?;
        let outputs: Vec<TxOut> = payout_outputs(&scripts);
        let preimage = state
            .revealed_preimage
            .as_deref()
            .map(hex::decode)
            .transpose()?;

        let (psbt, txid) = spend_template(&state, &scripts, outputs, preimage.as_deref())?;
        let fee_sats = state
            .funding_amount_sats
            .saturating_sub(state.payout_total());

        let mut updated = state.clone();
        updated.sweep_txid = Some(txid.clone());
        contract.escrow = Some(updated);
        contract.updated_at = Utc::now();
        self.store
            .save(RecordKind::Contract, contract_id, &*contract)
            .await?;

        self.register_spend(contract_id, &txid, TxType::Sweep, &state)
            .await?;
        drop(contract);

        self.store
            .record_event(
                EscrowEvent::new("psbt.sweep_built")
                    .contract(contract_id)
                    .txid(&txid),
            )
            .await?;

        info!("Built sweep PSBT {} for contract {}", txid, contract_id);
        Ok(SpendPsbt {
            contract_id: contract_id.to_string(),
            tx_type: TxType::Sweep,
            psbt_base64: psbt.to_string(),
            txid,
            fee_sats,
            payout_scripts: hex_scripts(&scripts.payout_scripts),
            payout_amounts: scripts.payout_amounts,
            finalized: preimage.is_some(),
        })
    }

    /// Apply a funding or commitment confirmation; returns whether anything changed.
    ///
    /// The contract is updated in memory only after the new record is saved,
    /// so a failed save leaves the confirmation to be delivered again.
    pub async fn on_transaction_confirmed(&self, event: &ConfirmationEvent) -> EscrowResult<bool> {
        let handle = self.store.contracts.get(&event.contract_id).await?;
        let mut contract = handle.lock().await;
        let mut updated = contract.clone();
        let Some(state) = updated.escrow.as_mut() else {
            warn!(
                "Confirmation for {} but contract {} has no escrow",
                event.txid, event.contract_id
            );
            return Ok(false);
        };

        let event_type = match event.tx_type {
            TxType::Funding if state.funding_txid == event.txid && !state.funding_confirmed => {
                state.funding_confirmed = true;
                if updated.status == ContractStatus::Active {
                    updated.transition(ContractStatus::Funded)?;
                }
                "funding.confirmed"
            }
            TxType::Commitment
                if state.commitment_txid.as_deref() == Some(event.txid.as_str())
                    && !state.commitment_confirmed =>
            {
                state.commitment_confirmed = true;
                let paid = state.payout_total();
                updated.settled_sats = updated.settled_sats.saturating_add(paid);
                updated.transition(ContractStatus::Closed)?;
                "commitment.confirmed"
            }
            _ => return Ok(false),
        };

        updated.updated_at = Utc::now();
        self.store
            .save(RecordKind::Contract, &updated.id, &updated)
            .await?;
        *contract = updated.clone();
        drop(contract);

        self.store
            .record_event(
                EscrowEvent::new(event_type)
                    .contract(&updated.id)
                    .txid(&event.txid)
                    .metadata(serde_json::json!({ "depth": event.depth })),
            )
            .await?;

        info!(
            "Contract {} now {:?} after {} {}",
            updated.id, updated.status, event_type, event.txid
        );
        Ok(true)
    }

    /// Close the contract once its sweep confirms
    pub async fn on_sweep_confirmed(&self, contract_id: &str, txid: &str) -> EscrowResult<bool> {
        let handle = self.store.contracts.get(contract_id).await?;
        let mut contract = handle.lock().await;
        let matches = contract
            .escrow
            .as_ref()
            .is_some_and(|s| s.sweep_txid.as_deref() == Some(txid));
        if !matches || contract.status == ContractStatus::Closed {
            return Ok(false);
        }

        let mut updated = contract.clone();
        let paid = updated.escrow.as_ref().map_or(0, EscrowState::payout_total);
        updated.settled_sats = updated.settled_sats.saturating_add(paid);
        updated.transition(ContractStatus::Closed)?;
        self.store
            .save(RecordKind::Contract, contract_id, &updated)
            .await?;
        *contract = updated;
        drop(contract);

        self.store
            .record_event(EscrowEvent::new("sweep.confirmed").contract(contract_id).txid(txid))
            .await?;
        info!("Contract {} closed by sweep {}", contract_id, txid);
        Ok(true)
    }

    /// Point the contract's escrow at the funding output the wallet broadcast.
    ///
    /// The template carries no inputs, so the signed transaction has a
    /// different txid. Spends are built against `txid:vout` from here on and
    /// the monitor entry is re-keyed. Repeating the call for the same output
    /// is a no-op.
    pub async fn rebind_funding(
        &self,
        contract_id: &str,
        template_txid: &str,
        output: &AddressOutput,
    ) -> EscrowResult<bool> {
        let handle = self.store.contracts.get(contract_id).await?;
        let mut contract = handle.lock().await;
        let state = contract.escrow.as_ref().ok_or_else(|| {
            EscrowError::not_ready(format!("contract {} has no funding template", contract_id))
        })?;

        if state.funding_confirmed {
            return Err(EscrowError::conflict(format!(
                "funding of contract {} is already confirmed",
                contract_id
            )));
        }
        if output.value_sats < state.funding_amount_sats {
            return Err(EscrowError::validation(format!(
                "output {}:{} pays {} sats, funding needs {}",
                output.txid, output.vout, output.value_sats, state.funding_amount_sats
            )));
        }

        let already_bound = state.funding_txid == output.txid && state.funding_vout == output.vout;
        if !already_bound {
            if state.funding_txid != template_txid {
                return Err(EscrowError::conflict(format!(
                    "contract {} is funded by {}, not {}",
                    contract_id, state.funding_txid, template_txid
                )));
            }

            let mut updated = contract.clone();
            if let Some(state) = updated.escrow.as_mut() {
                state.funding_txid = output.txid.clone();
                state.funding_vout = output.vout;
                state.funding_amount_sats = output.value_sats;
            }
            updated.updated_at = Utc::now();
            self.store
                .save(RecordKind::Contract, contract_id, &updated)
                .await?;
            *contract = updated;
        }

        // a contract saved before a failed re-key still finds its entry here
        if self.monitor.get(template_txid).await.is_some() {
            self.monitor.rebind(template_txid, &output.txid).await?;
        }
        drop(contract);

        if already_bound {
            return Ok(false);
        }
        self.store
            .record_event(
                EscrowEvent::new("funding.rebound")
                    .contract(contract_id)
                    .txid(&output.txid)
                    .metadata(serde_json::json!({
                        "template_txid": template_txid,
                        "vout": output.vout,
                        "value_sats": output.value_sats,
                    })),
            )
            .await?;
        info!(
            "Contract {} funding template {} broadcast as {}:{}",
            contract_id, template_txid, output.txid, output.vout
        );
        Ok(true)
    }

    /// Move a contract into or out of dispute
    pub async fn set_disputed(&self, contract_id: &str, disputed: bool) -> EscrowResult<()> {
        let handle = self.store.contracts.get(contract_id).await?;
        let mut contract = handle.lock().await;
        let target = match (disputed, contract.status) {
            (true, ContractStatus::Closed) => return Ok(()),
            (true, _) => ContractStatus::Disputed,
            (false, ContractStatus::Disputed) => {
                if contract.escrow.as_ref().is_some_and(|s| s.funding_confirmed) {
                    ContractStatus::Funded
                } else {
                    ContractStatus::Active
                }
            }
            (false, _) => return Ok(()),
        };
        contract.transition(target)?;
        let snapshot = contract.clone();
        drop(contract);
        self.store
            .save(RecordKind::Contract, contract_id, &snapshot)
            .await
    }

    pub async fn get_contract(&self, contract_id: &str) -> EscrowResult<Contract> {
        self.store.contracts.read(contract_id).await
    }

    async fn escrow_output_confirmed(&self, state: &EscrowState) -> bool {
        if self.monitor.status(&state.funding_txid).await == Some(TxStatus::Confirmed) {
            return true;
        }
        match &state.commitment_txid {
            Some(txid) => self.monitor.status(txid).await == Some(TxStatus::Confirmed),
            None => false,
        }
    }

    async fn allocated_budget(&self, contract: &Contract) -> u64 {
        let mut total = 0u64;
        for goal in &contract.goals {
            for task_id in &goal.task_ids {
                if let Some(handle) = self.store.tasks.find(task_id).await {
                    total = total.saturating_add(handle.lock().await.budget_sats);
                }
            }
        }
        total
    }

    async fn register_spend(
        &self,
        contract_id: &str,
        txid: &str,
        tx_type: TxType,
        state: &EscrowState,
    ) -> EscrowResult<()> {
        // identical inputs rebuild the identical template; keep watching the first
        if self.monitor.get(txid).await.is_some() {
            return Ok(());
        }
        self.monitor
            .add_transaction(
                MonitoredTransaction::new(txid, contract_id, tx_type, state.payout_total())
                    .with_counterparties(state.payouts.iter().map(|p| p.address.clone()).collect())
                    .with_metadata(serde_json::json!({
                        "spends": format!("{}:{}", state.funding_txid, state.funding_vout),
                    })),
            )
            .await
    }

    fn rederive(&self, state: &EscrowState) -> EscrowResult<ScriptSet> {
        let params = ScriptParams {
            commitment_hash: decode_commitment_hash(&state.commitment_hash)?.to_vec(),
            payouts: state.payouts.clone(),
            fallback_address: state.fallback_address.clone(),
            timeout_blocks: state.timeout_blocks,
            fallback_pubkey: self.config.fallback_pubkey,
        };
        let scripts = self.scripts.derive(&params, state.payout_total())?;
        if hex::encode(scripts.redeem_script.as_bytes()) != state.redeem_script {
            return Err(EscrowError::internal(
                "stored redeem script no longer matches its parameters",
            ));
        }
        Ok(scripts)
    }
}

fn validate_new_contract(request: &NewContract) -> EscrowResult<()> {
    if request.title.trim().is_empty() {
        return Err(EscrowError::validation("contract title cannot be empty"));
    }

    if request.total_budget_sats == 0 {
        return Err(EscrowError::validation("contract budget must be greater than 0"));
    }

    let mut allocated = 0u64;
    for goal in &request.goals {
        for task in &goal.tasks {
            if task.budget_sats == 0 {
                return Err(EscrowError::validation(format!(
                    "task '{}' must have a budget",
                    task.title
                )));
            }
            allocated = allocated.saturating_add(task.budget_sats);
        }
    }

    if allocated > request.total_budget_sats {
        return Err(EscrowError::validation(format!(
            "task budgets {} exceed contract budget {}",
            allocated, request.total_budget_sats
        )));
    }

    Ok(())
}

fn ensure_open(contract: &Contract) -> EscrowResult<()> {
    match contract.status {
        ContractStatus::Closed => Err(EscrowError::state_transition(
            "Closed".to_string(),
            "Closed".to_string(),
            format!("contract {} is already settled", contract.id),
        )),
        ContractStatus::Disputed => Err(EscrowError::conflict(format!(
            "contract {} is under dispute",
            contract.id
        ))),
        _ => Ok(()),
    }
}

fn validate_fee_rate(fee_rate_sats_vb: f64) -> EscrowResult<()> {
    if !(fee_rate_sats_vb.is_finite() && fee_rate_sats_vb > 0.0) {
        return Err(EscrowError::validation(format!(
            "fee rate must be positive, got {}",
            fee_rate_sats_vb
        )));
    }
    Ok(())
}

fn decode_commitment_hash(commitment_hash_hex: &str) -> EscrowResult<[u8; 32]> {
    let bytes = hex::decode(commitment_hash_hex.trim())?;
    if bytes.is_empty() {
        return Err(EscrowError::validation("commitment hash cannot be empty"));
    }
    bytes.try_into().map_err(|b: Vec<u8>| {
        EscrowError::validation(format!("commitment hash must be 32 bytes, got {}", b.len()))
    })
}

fn payout_outputs(scripts: &ScriptSet) -> Vec<TxOut> {
    scripts
        .payout_scripts
        .iter()
        .zip(&scripts.payout_amounts)
        .map(|(script, amount)| TxOut {
            value: Amount::from_sat(*amount),
            script_pubkey: script.clone(),
        })
        .collect()
}

/// Payouts plus `OP_RETURN <commitment_hash>`
fn reveal_outputs(scripts: &ScriptSet, commitment_hash: &[u8; 32]) -> Vec<TxOut> {
    let mut outputs = payout_outputs(scripts);
    outputs.push(TxOut {
        value: Amount::ZERO,
        script_pubkey: Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(commitment_hash)
            .into_script(),
    });
    outputs
}

/// Unsigned spend of the escrow output; the reveal witness is finalized when a preimage is known
fn spend_template(
    state: &EscrowState,
    scripts: &ScriptSet,
    outputs: Vec<TxOut>,
    preimage: Option<&[u8]>,
) -> EscrowResult<(Psbt, String)> {
    let funding_txid = Txid::from_str(&state.funding_txid)
        .map_err(|e| EscrowError::psbt(format!("invalid funding txid: {}", e)))?;

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: funding_txid,
                vout: state.funding_vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: outputs,
    };
    let txid = tx.compute_txid().to_string();

    let mut psbt = Psbt::from_unsigned_tx(tx)
        .map_err(|e| EscrowError::psbt(format!("spend template: {}", e)))?;
    let input = &mut psbt.inputs[0];
    input.witness_utxo = Some(TxOut {
        value: Amount::from_sat(state.funding_amount_sats),
        script_pubkey: scripts.commitment_script_pubkey(),
    });
    input.witness_script = Some(scripts.redeem_script.clone());
    if let Some(preimage) = preimage {
        input.final_script_witness = Some(Witness::from_slice(&[
            preimage.to_vec(),
            vec![1],
            scripts.redeem_script.to_bytes(),
        ]));
    }

    Ok((psbt, txid))
}

fn hex_scripts(scripts: &[ScriptBuf]) -> Vec<String> {
    scripts.iter().map(|s| hex::encode(s.as_bytes())).collect()
}

fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        _ => 5,
    }
}

/// Virtual size of a one-input reveal spend of the P2WSH escrow output
fn estimate_spend_vsize(redeem_len: usize, preimage_len: usize, outputs: &[TxOut]) -> u64 {
    let outputs_len: usize = outputs
        .iter()
        .map(|o| 8 + varint_len(o.script_pubkey.len()) + o.script_pubkey.len())
        .sum();
    // version + input count + outpoint/script_sig/sequence + output count + locktime
    let base = 4 + 1 + 41 + varint_len(outputs.len()) + outputs_len + 4;
    // marker/flag + item count + preimage + selector + witness script
    let witness = 2
        + 1
        + varint_len(preimage_len)
        + preimage_len
        + 2
        + varint_len(redeem_len)
        + redeem_len;
    ((base * 4 + witness) as u64).div_ceil(4)
}

fn fee_for(vsize: u64, fee_rate_sats_vb: f64) -> u64 {
    (vsize as f64 * fee_rate_sats_vb).ceil() as u64
}
