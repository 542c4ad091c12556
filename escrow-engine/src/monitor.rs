//! Transaction Monitor - confirmation-depth state machine
//!
//! Tracks every transaction the escrow expects to see on chain:
//!
//! ```text
//! pending ──► confirming ──► confirmed
//!    │            │
//!    └────────────┴──────► failed
//! ```
//!
//! Transitions are compare-and-set under a per-transaction lock: a report
//! is applied only when the current status is a valid predecessor of the
//! target, so duplicate or out-of-order depth reports never regress a
//! transaction. Records are written while that lock is held, so the durable
//! copy follows the same order. A confirmed funding, commitment or sweep
//! transaction yields a [`ConfirmationEvent`] until the escrow manager
//! acknowledges it with [`TransactionMonitor::mark_notified`].

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    error::EscrowError,
    models::{MonitoredTransaction, TxStatus, TxType},
    store::{EscrowStore, RecordKind, Shared},
    EscrowResult,
};

/// Required confirmation depth per transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPolicy {
    pub funding: u32,
    pub commitment: u32,
    pub payout: u32,
    pub sweep: u32,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            funding: 6,
            commitment: 1,
            payout: 1,
            sweep: 1,
        }
    }
}

impl ConfirmationPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            funding: config.required_depth(TxType::Funding),
            commitment: config.required_depth(TxType::Commitment),
            payout: config.required_depth(TxType::Payout),
            sweep: config.required_depth(TxType::Sweep),
        }
    }

    pub fn required_depth(&self, tx_type: TxType) -> u32 {
        match tx_type {
            TxType::Funding => self.funding,
            TxType::Commitment => self.commitment,
            TxType::Payout => self.payout,
            TxType::Sweep => self.sweep,
        }
    }
}

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub policy: ConfirmationPolicy,
    /// Pending transactions never observed within this window are failed
    pub pending_timeout: chrono::Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            policy: ConfirmationPolicy::default(),
            pending_timeout: chrono::Duration::hours(72),
        }
    }
}

impl MonitorConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            policy: ConfirmationPolicy::from_config(config),
            pending_timeout: config.pending_timeout(),
        }
    }
}

/// Confirmation of a transaction the escrow manager reacts to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationEvent {
    pub txid: String,
    pub contract_id: String,
    pub tx_type: TxType,
    pub depth: u32,
    pub confirmed_at: DateTime<Utc>,
}

/// Result of a depth report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub previous: TxStatus,
    pub current: TxStatus,
    pub event: Option<ConfirmationEvent>,
}

impl UpdateOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Aggregate counts for observability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringStats {
    pub total: usize,
    pub active: usize,
    pub by_status: HashMap<TxStatus, usize>,
    pub by_type: HashMap<TxType, usize>,
}

/// Registry of in-flight transactions
pub struct TransactionMonitor {
    config: MonitorConfig,
    transactions: RwLock<HashMap<String, Shared<MonitoredTransaction>>>,
    store: Arc<EscrowStore>,
}

impl TransactionMonitor {
    pub fn new(config: MonitorConfig, store: Arc<EscrowStore>) -> Self {
        Self {
            config,
            transactions: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.config.policy
    }

    /// Reload persisted transactions; returns how many were restored
    pub async fn restore(&self) -> EscrowResult<usize> {
        let records = self
            .store
            .load_records::<MonitoredTransaction>(RecordKind::MonitoredTransaction)
            .await?;
        let mut transactions = self.transactions.write().await;
        let count = records.len();
        for tx in records {
            transactions.insert(tx.txid.clone(), Arc::new(Mutex::new(tx)));
        }
        info!("Restored {} monitored transactions", count);
        Ok(count)
    }

    /// Register a transaction as pending
    pub async fn add_transaction(&self, mut tx: MonitoredTransaction) -> EscrowResult<()> {
        tx.txid = tx.txid.trim().to_string();
        if tx.txid.is_empty() {
            return Err(EscrowError::validation("transaction id cannot be empty"));
        }
        if tx.contract_id.trim().is_empty() {
            return Err(EscrowError::validation("contract id cannot be empty"));
        }
        if tx.required_depth == 0 {
            tx.required_depth = self.config.policy.required_depth(tx.tx_type);
        }
        tx.status = TxStatus::Pending;

        // the handle stays locked until the record is written
        let handle = Arc::new(Mutex::new(tx.clone()));
        let guard = handle.lock().await;
        {
            let mut transactions = self.transactions.write().await;
            if transactions.contains_key(&tx.txid) {
                return Err(EscrowError::conflict(format!(
                    "transaction {} is already monitored",
                    tx.txid
                )));
            }
            transactions.insert(tx.txid.clone(), handle.clone());
        }

        if let Err(e) = self.persist(&guard).await {
            drop(guard);
            self.transactions.write().await.remove(&tx.txid);
            return Err(e);
        }
        drop(guard);
        info!(
            "Monitoring {:?} transaction {} for contract {} (depth {})",
            tx.tx_type, tx.txid, tx.contract_id, tx.required_depth
        );
        Ok(())
    }

    /// Stop monitoring; absent ids are a no-op. Returns whether anything was removed
    pub async fn remove_transaction(&self, txid: &str) -> EscrowResult<bool> {
        let removed = self.transactions.write().await.remove(txid).is_some();
        if removed {
            self.store
                .delete(RecordKind::MonitoredTransaction, txid)
                .await?;
            debug!("Removed monitored transaction {}", txid);
        }
        Ok(removed)
    }

    /// Apply an observed depth.
    ///
    /// Depth is kept as a running maximum, so a stale lower report cannot
    /// move the transaction backwards. Terminal transactions ignore reports.
    pub async fn update_confirmations(
        &self,
        txid: &str,
        observed_depth: u32,
    ) -> EscrowResult<UpdateOutcome> {
        let handle = self.handle(txid).await?;
        let mut tx = handle.lock().await;
        let previous = tx.status;

        if previous.is_terminal() {
            return Ok(UpdateOutcome {
                previous,
                current: previous,
                event: None,
            });
        }

        let depth = tx.observed_depth.map_or(observed_depth, |d| d.max(observed_depth));
        let target = if depth >= tx.required_depth {
            TxStatus::Confirmed
        } else {
            TxStatus::Confirming
        };

        let depth_changed = tx.observed_depth != Some(depth);
        tx.observed_depth = Some(depth);

        let mut event = None;
        if target != previous && previous.can_advance_to(target) {
            let now = Utc::now();
            tx.status = target;
            tx.updated_at = now;

            if target == TxStatus::Confirmed {
                tx.confirmed_at = Some(now);
                event = confirmation_event(&tx);
            }

            info!(
                "Transaction {} {:?} -> {:?} at depth {}/{}",
                tx.txid, previous, target, depth, tx.required_depth
            );
        } else if !depth_changed {
            return Ok(UpdateOutcome {
                previous,
                current: previous,
                event: None,
            });
        }

        // written under the lock so records land in transition order
        self.persist(&tx).await?;

        Ok(UpdateOutcome {
            previous,
            current: tx.status,
            event,
        })
    }

    /// Confirmed transactions whose escrow notification has not been acknowledged
    pub async fn pending_notifications(&self) -> Vec<ConfirmationEvent> {
        let mut events = Vec::new();
        for handle in self.handles().await {
            let tx = handle.lock().await;
            if let Some(event) = confirmation_event(&tx) {
                events.push(event);
            }
        }
        events.sort_by(|a, b| a.confirmed_at.cmp(&b.confirmed_at));
        events
    }

    /// Acknowledge delivery of the confirmation event for `txid`
    pub async fn mark_notified(&self, txid: &str) -> EscrowResult<()> {
        let handle = self.handle(txid).await?;
        let mut tx = handle.lock().await;
        if tx.notified {
            return Ok(());
        }
        tx.notified = true;
        tx.updated_at = Utc::now();
        self.persist(&tx).await
    }

    /// Move a pending entry to the txid the funder actually broadcast.
    ///
    /// Status, depth and timestamps carry over; the old record is deleted.
    pub async fn rebind(
        &self,
        old_txid: &str,
        new_txid: &str,
    ) -> EscrowResult<MonitoredTransaction> {
        let new_txid = new_txid.trim();
        if new_txid.is_empty() {
            return Err(EscrowError::validation("transaction id cannot be empty"));
        }
        if old_txid == new_txid {
            let handle = self.handle(old_txid).await?;
            let tx = handle.lock().await.clone();
            return Ok(tx);
        }

        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(new_txid) {
            return Err(EscrowError::conflict(format!(
                "transaction {} is already monitored",
                new_txid
            )));
        }
        let handle = transactions.remove(old_txid).ok_or_else(|| {
            EscrowError::not_found(format!("transaction {} is not monitored", old_txid))
        })?;
        let mut tx = handle.lock().await;
        if tx.status.is_terminal() {
            transactions.insert(old_txid.to_string(), handle.clone());
            return Err(EscrowError::state_transition(
                format!("{:?}", tx.status),
                "Pending".to_string(),
                format!("transaction {} is already terminal", old_txid),
            ));
        }

        tx.txid = new_txid.to_string();
        tx.updated_at = Utc::now();
        transactions.insert(new_txid.to_string(), handle.clone());
        drop(transactions);

        self.persist(&tx).await?;
        self.store
            .delete(RecordKind::MonitoredTransaction, old_txid)
            .await?;
        info!("Transaction {} rebound to broadcast txid {}", old_txid, new_txid);
        Ok(tx.clone())
    }

    /// Fail a non-terminal transaction; failing a failed one is a no-op
    pub async fn mark_failed(&self, txid: &str, reason: &str) -> EscrowResult<TxStatus> {
        let handle = self.handle(txid).await?;
        let mut tx = handle.lock().await;

        match tx.status {
            TxStatus::Failed => return Ok(TxStatus::Failed),
            TxStatus::Confirmed => {
                return Err(EscrowError::state_transition(
                    "Confirmed".to_string(),
                    "Failed".to_string(),
                    format!("transaction {} is already confirmed", txid),
                ))
            }
            _ => {}
        }

        tx.status = TxStatus::Failed;
        tx.failure_reason = Some(reason.to_string());
        tx.updated_at = Utc::now();
        self.persist(&tx).await?;
        warn!("Transaction {} marked failed: {}", txid, reason);
        Ok(TxStatus::Failed)
    }

    /// Fail pending transactions registered longer ago than the pending timeout
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> EscrowResult<Vec<String>> {
        let mut expired = Vec::new();
        for handle in self.handles().await {
            let (txid, stale) = {
                let tx = handle.lock().await;
                (
                    tx.txid.clone(),
                    tx.status == TxStatus::Pending
                        && tx.created_at + self.config.pending_timeout <= now,
                )
            };
            if stale {
                self.mark_failed(&txid, "not observed on chain within pending timeout")
                    .await?;
                expired.push(txid);
            }
        }
        Ok(expired)
    }

    pub async fn get(&self, txid: &str) -> Option<MonitoredTransaction> {
        let handle = self.transactions.read().await.get(txid).cloned()?;
        let tx = handle.lock().await.clone();
        Some(tx)
    }

    /// Current status of `txid`
    pub async fn status(&self, txid: &str) -> Option<TxStatus> {
        self.get(txid).await.map(|tx| tx.status)
    }

    /// Non-terminal transactions
    pub async fn list_active(&self) -> Vec<MonitoredTransaction> {
        let mut active = Vec::new();
        for handle in self.handles().await {
            let tx = handle.lock().await;
            if !tx.status.is_terminal() {
                active.push(tx.clone());
            }
        }
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active
    }

    pub async fn list_for_contract(&self, contract_id: &str) -> Vec<MonitoredTransaction> {
        let mut out = Vec::new();
        for handle in self.handles().await {
            let tx = handle.lock().await;
            if tx.contract_id == contract_id {
                out.push(tx.clone());
            }
        }
        out
    }

    /// Drop terminal transactions last updated before `before`
    pub async fn cleanup_terminal(&self, before: DateTime<Utc>) -> EscrowResult<usize> {
        let mut stale = Vec::new();
        for handle in self.handles().await {
            let tx = handle.lock().await;
            if tx.status.is_terminal() && tx.updated_at < before {
                stale.push(tx.txid.clone());
            }
        }

        for txid in &stale {
            self.remove_transaction(txid).await?;
        }
        if !stale.is_empty() {
            info!("Cleaned up {} terminal transactions", stale.len());
        }
        Ok(stale.len())
    }

    pub async fn get_monitoring_stats(&self) -> MonitoringStats {
        let mut stats = MonitoringStats::default();
        for handle in self.handles().await {
            let tx = handle.lock().await;
            stats.total += 1;
            if !tx.status.is_terminal() {
                stats.active += 1;
            }
            *stats.by_status.entry(tx.status).or_insert(0) += 1;
            *stats.by_type.entry(tx.tx_type).or_insert(0) += 1;
        }
        stats
    }

    async fn handle(&self, txid: &str) -> EscrowResult<Shared<MonitoredTransaction>> {
        self.transactions
            .read()
            .await
            .get(txid)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("transaction {} is not monitored", txid)))
    }

    async fn handles(&self) -> Vec<Shared<MonitoredTransaction>> {
        self.transactions.read().await.values().cloned().collect()
    }

    async fn persist(&self, tx: &MonitoredTransaction) -> EscrowResult<()> {
        self.store
            .save(RecordKind::MonitoredTransaction, &tx.txid, tx)
            .await
    }
}

fn confirmation_event(tx: &MonitoredTransaction) -> Option<ConfirmationEvent> {
    if tx.status != TxStatus::Confirmed || tx.notified || !tx.tx_type.notifies_escrow() {
        return None;
    }
    Some(ConfirmationEvent {
        txid: tx.txid.clone(),
        contract_id: tx.contract_id.clone(),
        tx_type: tx.tx_type,
        depth: tx.observed_depth.unwrap_or(tx.required_depth),
        confirmed_at: tx.confirmed_at.unwrap_or(tx.updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, RecordBackend};

    fn monitor() -> TransactionMonitor {
        TransactionMonitor::new(MonitorConfig::default(), Arc::new(EscrowStore::in_memory()))
    }

    #[tokio::test]
    async fn test_add_rejects_empty_and_duplicate() {
        let monitor = monitor();
        assert!(matches!(
            monitor
                .add_transaction(MonitoredTransaction::new("  ", "c1", TxType::Funding, 1))
                .await,
            Err(EscrowError::Validation(_))
        ));

        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Funding, 1))
            .await
            .unwrap();
        assert!(matches!(
            monitor
                .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Funding, 1))
                .await,
            Err(EscrowError::Conflict(_))
        ));
        assert_eq!(monitor.get("aa").await.unwrap().required_depth, 6);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let monitor = monitor();
        assert!(!monitor.remove_transaction("missing").await.unwrap());
        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Sweep, 1))
            .await
            .unwrap();
        assert!(monitor.remove_transaction("aa").await.unwrap());
        assert!(!monitor.remove_transaction("aa").await.unwrap());
    }

    #[tokio::test]
    async fn test_confirmation_event_emitted_once() {
        let monitor = monitor();
        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Funding, 1_000))
            .await
            .unwrap();

        let first = monitor.update_confirmations("aa", 2).await.unwrap();
        assert_eq!(first.current, TxStatus::Confirming);
        assert!(first.event.is_none());

        let second = monitor.update_confirmations("aa", 6).await.unwrap();
        assert_eq!(second.current, TxStatus::Confirmed);
        assert_eq!(second.event.as_ref().map(|e| e.depth), Some(6));

        let third = monitor.update_confirmations("aa", 9).await.unwrap();
        assert!(third.event.is_none());
        assert_eq!(third.current, TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_payout_confirmation_does_not_notify() {
        let monitor = monitor();
        monitor
            .add_transaction(MonitoredTransaction::new("bb", "c1", TxType::Payout, 1_000))
            .await
            .unwrap();
        let outcome = monitor.update_confirmations("bb", 1).await.unwrap();
        assert_eq!(outcome.current, TxStatus::Confirmed);
        assert!(outcome.event.is_none());
        assert!(monitor.pending_notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_notification_pending_until_acknowledged() {
        let monitor = monitor();
        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Funding, 1_000))
            .await
            .unwrap();
        monitor
            .add_transaction(MonitoredTransaction::new("bb", "c1", TxType::Sweep, 900))
            .await
            .unwrap();
        assert!(monitor.pending_notifications().await.is_empty());

        monitor.update_confirmations("aa", 6).await.unwrap();
        monitor.update_confirmations("bb", 1).await.unwrap();
        let pending = monitor.pending_notifications().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].txid, "aa");

        // still pending after a later report
        monitor.update_confirmations("aa", 8).await.unwrap();
        assert_eq!(monitor.pending_notifications().await.len(), 2);

        monitor.mark_notified("aa").await.unwrap();
        monitor.mark_notified("aa").await.unwrap();
        let pending = monitor.pending_notifications().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx_type, TxType::Sweep);
        assert!(matches!(
            monitor.mark_notified("missing").await,
            Err(EscrowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rebind_moves_pending_entry() {
        let store = Arc::new(EscrowStore::in_memory());
        let monitor = TransactionMonitor::new(MonitorConfig::default(), store.clone());
        monitor
            .add_transaction(
                MonitoredTransaction::new("template", "c1", TxType::Funding, 1_000)
                    .with_watch_address("bcrt1qwatched"),
            )
            .await
            .unwrap();
        monitor
            .add_transaction(MonitoredTransaction::new("other", "c2", TxType::Funding, 1_000))
            .await
            .unwrap();

        assert!(matches!(
            monitor.rebind("template", "other").await,
            Err(EscrowError::Conflict(_))
        ));

        let rebound = monitor.rebind("template", "broadcast").await.unwrap();
        assert_eq!(rebound.txid, "broadcast");
        assert_eq!(rebound.watch_address.as_deref(), Some("bcrt1qwatched"));
        assert!(monitor.get("template").await.is_none());

        let restarted = TransactionMonitor::new(MonitorConfig::default(), store);
        assert_eq!(restarted.restore().await.unwrap(), 2);
        assert!(restarted.get("template").await.is_none());
        assert_eq!(restarted.status("broadcast").await, Some(TxStatus::Pending));

        monitor.update_confirmations("broadcast", 6).await.unwrap();
        assert!(matches!(
            monitor.rebind("broadcast", "again").await,
            Err(EscrowError::StateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_lower_report_never_regresses() {
        let monitor = monitor();
        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Funding, 1))
            .await
            .unwrap();
        monitor.update_confirmations("aa", 4).await.unwrap();
        let outcome = monitor.update_confirmations("aa", 1).await.unwrap();
        assert_eq!(outcome.current, TxStatus::Confirming);
        assert_eq!(monitor.get("aa").await.unwrap().observed_depth, Some(4));
    }

    #[tokio::test]
    async fn test_mark_failed_rules() {
        let monitor = monitor();
        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Commitment, 1))
            .await
            .unwrap();
        monitor
            .add_transaction(MonitoredTransaction::new("bb", "c1", TxType::Commitment, 1))
            .await
            .unwrap();

        monitor.update_confirmations("aa", 1).await.unwrap();
        assert!(monitor.mark_failed("aa", "replaced").await.is_err());

        assert_eq!(
            monitor.mark_failed("bb", "evicted").await.unwrap(),
            TxStatus::Failed
        );
        let outcome = monitor.update_confirmations("bb", 10).await.unwrap();
        assert_eq!(outcome.current, TxStatus::Failed);
    }

    #[tokio::test]
    async fn test_expire_stale_and_stats() {
        let monitor = monitor();
        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Funding, 1))
            .await
            .unwrap();
        monitor
            .add_transaction(MonitoredTransaction::new("bb", "c1", TxType::Payout, 1))
            .await
            .unwrap();
        monitor.update_confirmations("bb", 0).await.unwrap();

        let expired = monitor
            .expire_stale(Utc::now() + chrono::Duration::hours(73))
            .await
            .unwrap();
        assert_eq!(expired, vec!["aa".to_string()]);

        let stats = monitor.get_monitoring_stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.by_status.get(&TxStatus::Failed), Some(&1));
        assert_eq!(stats.by_status.get(&TxStatus::Confirming), Some(&1));

        let removed = monitor
            .cleanup_terminal(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(monitor.get("aa").await.is_none());
    }

    #[tokio::test]
    async fn test_restore_keeps_confirmed_status() {
        let store = Arc::new(EscrowStore::in_memory());
        let monitor = TransactionMonitor::new(MonitorConfig::default(), store.clone());
        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Funding, 1))
            .await
            .unwrap();
        monitor.update_confirmations("aa", 6).await.unwrap();

        let restarted = TransactionMonitor::new(MonitorConfig::default(), store.clone());
        assert_eq!(restarted.restore().await.unwrap(), 1);
        assert_eq!(restarted.status("aa").await, Some(TxStatus::Confirmed));
        // never acknowledged, so still owed to the escrow manager
        assert_eq!(restarted.pending_notifications().await.len(), 1);
        restarted.mark_notified("aa").await.unwrap();

        let again = TransactionMonitor::new(MonitorConfig::default(), store);
        again.restore().await.unwrap();
        assert!(again.pending_notifications().await.is_empty());
        let outcome = again.update_confirmations("aa", 7).await.unwrap();
        assert!(outcome.event.is_none());
    }

    /// Delays every write of a `confirming` record
    struct SlowConfirmingBackend {
        inner: MemoryBackend,
        delay: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl RecordBackend for SlowConfirmingBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn upsert(
            &self,
            kind: RecordKind,
            id: &str,
            body: serde_json::Value,
        ) -> EscrowResult<()> {
            if body["status"] == "confirming" {
                tokio::time::sleep(self.delay).await;
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

    #[tokio::test]
    async fn test_concurrent_reports_persist_in_transition_order() {
        let store = Arc::new(EscrowStore::new(Arc::new(SlowConfirmingBackend {
            inner: MemoryBackend::new(),
            delay: std::time::Duration::from_millis(100),
        })));
        let monitor = TransactionMonitor::new(MonitorConfig::default(), store.clone());
        monitor
            .add_transaction(MonitoredTransaction::new("aa", "c1", TxType::Funding, 1))
            .await
            .unwrap();

        let (shallow, deep) = tokio::join!(monitor.update_confirmations("aa", 1), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            monitor.update_confirmations("aa", 6).await
        });
        assert_eq!(shallow.unwrap().current, TxStatus::Confirming);
        assert_eq!(deep.unwrap().current, TxStatus::Confirmed);

        let restarted = TransactionMonitor::new(MonitorConfig::default(), store);
        restarted.restore().await.unwrap();
        let restored = restarted.get("aa").await.unwrap();
        assert_eq!(restored.status, TxStatus::Confirmed);
        assert_eq!(restored.observed_depth, Some(6));
    }
}
