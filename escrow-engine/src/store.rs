//! Escrow Store - shared entity maps with per-entity locking
//!
//! The store is constructed once at startup and handed to every component
//! that needs it. Each entity sits behind its own `Arc<Mutex<_>>`; the map
//! lock is only held long enough to look up or insert a handle, so
//! operations on unrelated entities never serialize on each other.
//!
//! Every mutation is written through to a [`RecordBackend`]: either the
//! process-lifetime [`MemoryBackend`] or the durable [`PostgresBackend`].
//! Audit events are persisted in full but only a bounded tail is kept in
//! memory.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Row};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::{EngineConfig, StoreDriver},
    error::EscrowError,
    models::{Claim, Contract, DisputeCase, EscrowEvent, MerkleProof, Proposal, Task},
    EscrowResult,
};

/// Handle to a single locked entity
pub type Shared<T> = Arc<Mutex<T>>;

/// Audit events kept in memory unless configured otherwise
pub const DEFAULT_EVENT_TAIL: usize = 10_000;

/// Persisted record families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Contract,
    Task,
    Claim,
    Proposal,
    MonitoredTransaction,
    MerkleProof,
    Dispute,
    Event,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Task => "task",
            Self::Claim => "claim",
            Self::Proposal => "proposal",
            Self::MonitoredTransaction => "monitored_transaction",
            Self::MerkleProof => "merkle_proof",
            Self::Dispute => "dispute",
            Self::Event => "event",
        }
    }
}

/// Durable storage for JSON record bodies
#[async_trait]
pub trait RecordBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert or replace the record `(kind, id)`
    async fn upsert(&self, kind: RecordKind, id: &str, body: serde_json::Value) -> EscrowResult<()>;

    /// Delete a record; absent records are not an error
    async fn delete(&self, kind: RecordKind, id: &str) -> EscrowResult<()>;

    /// All records of one kind in write order
    async fn load_all(&self, kind: RecordKind) -> EscrowResult<Vec<serde_json::Value>>;
}

/// Process-lifetime backend
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<(RecordKind, String), (u64, serde_json::Value)>>,
    sequence: Mutex<u64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, kind: RecordKind, id: &str, body: serde_json::Value) -> EscrowResult<()> {
        let mut records = self.records.write().await;
        let seq = match records.get(&(kind, id.to_string())) {
            Some((seq, _)) => *seq,
            None => {
                let mut next = self.sequence.lock().await;
                *next += 1;
                *next
            }
        };
        records.insert((kind, id.to_string()), (seq, body));
        Ok(())
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> EscrowResult<()> {
        self.records.write().await.remove(&(kind, id.to_string()));
        Ok(())
    }

    async fn load_all(&self, kind: RecordKind) -> EscrowResult<Vec<serde_json::Value>> {
        let records = self.records.read().await;
        let mut rows: Vec<_> = records
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, (seq, body))| (*seq, body.clone()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, body)| body).collect())
    }
}

/// PostgreSQL backend over a single `escrow_records` table
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Connect and apply pending migrations
    pub async fn connect(database_url: &str) -> EscrowResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EscrowError::storage(format!("migration failed: {}", e)))?;
        info!("Escrow record migrations applied");

        Ok(Self { pool })
    }
}

#[async_trait]
impl RecordBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert(&self, kind: RecordKind, id: &str, body: serde_json::Value) -> EscrowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_records (kind, id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind, id)
            DO UPDATE SET body = EXCLUDED.body, updated_at = now()
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(Json(body))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> EscrowResult<()> {
        sqlx::query("DELETE FROM escrow_records WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self, kind: RecordKind) -> EscrowResult<Vec<serde_json::Value>> {
        let rows = sqlx::query(
            "SELECT body FROM escrow_records WHERE kind = $1 ORDER BY created_at, id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                row.try_get::<Json<serde_json::Value>, _>("body")
                    .map(|Json(body)| body)
                    .map_err(EscrowError::from)
            })
            .collect()
    }
}

/// Id-keyed map of individually locked entities
pub struct Table<V> {
    kind: RecordKind,
    rows: RwLock<HashMap<String, Shared<V>>>,
}

impl<V: Clone + Send> Table<V> {
    fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Insert a new entity; an existing id is a conflict
    pub async fn insert(&self, id: impl Into<String>, value: V) -> EscrowResult<Shared<V>> {
        let id = id.into();
        let mut rows = self.rows.write().await;
        if rows.contains_key(&id) {
            return Err(EscrowError::conflict(format!(
                "{} {} already exists",
                self.kind.as_str(),
                id
            )));
        }
        let handle = Arc::new(Mutex::new(value));
        rows.insert(id, handle.clone());
        Ok(handle)
    }

    /// Handle for `id`, inserting `value` first if absent; the flag is true on insert
    pub async fn get_or_insert(&self, id: impl Into<String>, value: V) -> (Shared<V>, bool) {
        let mut rows = self.rows.write().await;
        match rows.entry(id.into()) {
            std::collections::hash_map::Entry::Occupied(e) => (e.get().clone(), false),
            std::collections::hash_map::Entry::Vacant(e) => {
                (e.insert(Arc::new(Mutex::new(value))).clone(), true)
            }
        }
    }

    pub async fn find(&self, id: &str) -> Option<Shared<V>> {
        self.rows.read().await.get(id).cloned()
    }

    pub async fn get(&self, id: &str) -> EscrowResult<Shared<V>> {
        self.find(id).await.ok_or_else(|| {
            EscrowError::not_found(format!("{} {} not found", self.kind.as_str(), id))
        })
    }

    /// Snapshot of one entity
    pub async fn read(&self, id: &str) -> EscrowResult<V> {
        let handle = self.get(id).await?;
        let value = handle.lock().await.clone();
        Ok(value)
    }

    pub async fn handles(&self) -> Vec<Shared<V>> {
        self.rows.read().await.values().cloned().collect()
    }

    /// Snapshot of every entity, locking each in turn
    pub async fn snapshot(&self) -> Vec<V> {
        let mut out = Vec::new();
        for handle in self.handles().await {
            out.push(handle.lock().await.clone());
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

/// Shared contract/task/claim/proposal/proof/dispute store
pub struct EscrowStore {
    backend: Arc<dyn RecordBackend>,
    pub contracts: Table<Contract>,
    pub tasks: Table<Task>,
    pub claims: Table<Claim>,
    pub proposals: Table<Proposal>,
    pub proofs: Table<MerkleProof>,
    pub disputes: Table<DisputeCase>,
    events: RwLock<VecDeque<EscrowEvent>>,
    event_tail: usize,
}

impl EscrowStore {
    /// Empty store over `backend`
    pub fn new(backend: Arc<dyn RecordBackend>) -> Self {
        Self {
            backend,
            contracts: Table::new(RecordKind::Contract),
            tasks: Table::new(RecordKind::Task),
            claims: Table::new(RecordKind::Claim),
            proposals: Table::new(RecordKind::Proposal),
            proofs: Table::new(RecordKind::MerkleProof),
            disputes: Table::new(RecordKind::Dispute),
            events: RwLock::new(VecDeque::new()),
            event_tail: DEFAULT_EVENT_TAIL,
        }
    }

    /// Keep at most `event_tail` (at least one) audit events in memory
    pub fn with_event_tail(mut self, event_tail: usize) -> Self {
        self.event_tail = event_tail.max(1);
        self
    }

    /// In-memory store for tests and local runs
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open the backend selected by configuration and load persisted records
    pub async fn open(config: &EngineConfig) -> EscrowResult<Self> {
        let backend: Arc<dyn RecordBackend> = match config.store_driver {
            StoreDriver::Memory => Arc::new(MemoryBackend::new()),
            StoreDriver::Postgres => {
                let url = config.database_url.as_deref().ok_or_else(|| {
                    EscrowError::config("database_url is required for the postgres store")
                })?;
                Arc::new(PostgresBackend::connect(url).await?)
            }
        };

        let store = Self::new(backend).with_event_tail(config.event_tail_len);
        store.load().await?;
        Ok(store)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Populate the maps from the backend
    pub async fn load(&self) -> EscrowResult<()> {
        for contract in self.load_records::<Contract>(RecordKind::Contract).await? {
            self.contracts.get_or_insert(contract.id.clone(), contract).await;
        }
        for task in self.load_records::<Task>(RecordKind::Task).await? {
            self.tasks.get_or_insert(task.id.clone(), task).await;
        }
        for claim in self.load_records::<Claim>(RecordKind::Claim).await? {
            self.claims.get_or_insert(claim.id.to_string(), claim).await;
        }
        for proposal in self.load_records::<Proposal>(RecordKind::Proposal).await? {
            self.proposals.get_or_insert(proposal.id.clone(), proposal).await;
        }
        for proof in self.load_records::<MerkleProof>(RecordKind::MerkleProof).await? {
            self.proofs.get_or_insert(proof.txid.clone(), proof).await;
        }
        for dispute in self.load_records::<DisputeCase>(RecordKind::Dispute).await? {
            self.disputes.get_or_insert(dispute.id.to_string(), dispute).await;
        }
        let mut events: VecDeque<_> = self
            .load_records::<EscrowEvent>(RecordKind::Event)
            .await?
            .into();
        while events.len() > self.event_tail {
            events.pop_front();
        }
        *self.events.write().await = events;

        info!(
            "Loaded escrow store from {} backend: {} contracts, {} tasks, {} proofs",
            self.backend.name(),
            self.contracts.len().await,
            self.tasks.len().await,
            self.proofs.len().await
        );
        Ok(())
    }

    /// Decode every record of `kind`; undecodable rows are skipped with a warning
    pub async fn load_records<V: DeserializeOwned>(&self, kind: RecordKind) -> EscrowResult<Vec<V>> {
        let mut out = Vec::new();
        for body in self.backend.load_all(kind).await? {
            match serde_json::from_value(body) {
                Ok(value) => out.push(value),
                Err(e) => warn!("Skipping undecodable {} record: {}", kind.as_str(), e),
            }
        }
        Ok(out)
    }

    /// Write one record through to the backend
    pub async fn save<V: Serialize>(&self, kind: RecordKind, id: &str, value: &V) -> EscrowResult<()> {
        let body = serde_json::to_value(value)?;
        self.backend.upsert(kind, id, body).await?;
        debug!("Persisted {} {}", kind.as_str(), id);
        Ok(())
    }

    pub async fn delete(&self, kind: RecordKind, id: &str) -> EscrowResult<()> {
        self.backend.delete(kind, id).await
    }

    /// Append an audit event, dropping the oldest in-memory one past the tail length
    pub async fn record_event(&self, event: EscrowEvent) -> EscrowResult<()> {
        self.save(RecordKind::Event, &event.id.to_string(), &event).await?;
        let mut events = self.events.write().await;
        if events.len() >= self.event_tail {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    /// Most recent audit events, oldest first
    pub async fn events(&self) -> Vec<EscrowEvent> {
        self.events.read().await.iter().cloned().collect()
    }

    pub async fn events_for_contract(&self, contract_id: &str) -> Vec<EscrowEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.contract_id.as_deref() == Some(contract_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContractStatus, Goal};

    fn contract(id: &str) -> Contract {
        Contract::new(
            id.to_string(),
            "Mural".to_string(),
            1_000,
            vec![Goal {
                id: "g1".to_string(),
                title: "Sketch".to_string(),
                task_ids: vec![],
            }],
            vec!["design".to_string()],
        )
    }

    #[tokio::test]
    async fn test_insert_conflict_and_lookup() {
        let store = EscrowStore::in_memory();
        store.contracts.insert("c1", contract("c1")).await.unwrap();
        assert!(matches!(
            store.contracts.insert("c1", contract("c1")).await,
            Err(EscrowError::Conflict(_))
        ));
        assert!(matches!(
            store.contracts.get("missing").await,
            Err(EscrowError::NotFound(_))
        ));
        assert_eq!(store.contracts.read("c1").await.unwrap().id, "c1");
    }

    #[tokio::test]
    async fn test_records_survive_reload_from_backend() {
        let backend: Arc<dyn RecordBackend> = Arc::new(MemoryBackend::new());
        let store = EscrowStore::new(backend.clone());

        let mut c = contract("c1");
        c.transition(ContractStatus::Funded).unwrap();
        store.contracts.insert("c1", c.clone()).await.unwrap();
        store.save(RecordKind::Contract, "c1", &c).await.unwrap();
        store
            .record_event(EscrowEvent::new("funding.confirmed").contract("c1"))
            .await
            .unwrap();

        let reopened = EscrowStore::new(backend);
        reopened.load().await.unwrap();
        assert_eq!(
            reopened.contracts.read("c1").await.unwrap().status,
            ContractStatus::Funded
        );
        assert_eq!(reopened.events_for_contract("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_backend_keeps_write_order() {
        let backend = MemoryBackend::new();
        backend
            .upsert(RecordKind::Task, "b", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        backend
            .upsert(RecordKind::Task, "a", serde_json::json!({"n": 2}))
            .await
            .unwrap();
        backend
            .upsert(RecordKind::Task, "b", serde_json::json!({"n": 3}))
            .await
            .unwrap();
        backend.delete(RecordKind::Task, "missing").await.unwrap();

        let rows = backend.load_all(RecordKind::Task).await.unwrap();
        assert_eq!(rows, vec![serde_json::json!({"n": 3}), serde_json::json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_event_tail_is_bounded() {
        let backend: Arc<dyn RecordBackend> = Arc::new(MemoryBackend::new());
        let store = EscrowStore::new(backend.clone()).with_event_tail(3);
        for n in 0..5 {
            store
                .record_event(EscrowEvent::new(format!("tick.{}", n)).contract("c1"))
                .await
                .unwrap();
        }

        let kinds: Vec<String> = store.events().await.into_iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec!["tick.2", "tick.3", "tick.4"]);
        assert_eq!(backend.load_all(RecordKind::Event).await.unwrap().len(), 5);

        let reopened = EscrowStore::new(backend).with_event_tail(2);
        reopened.load().await.unwrap();
        let kinds: Vec<String> = reopened
            .events_for_contract("c1")
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec!["tick.3", "tick.4"]);
    }
}
