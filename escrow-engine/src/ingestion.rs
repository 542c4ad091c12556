//! Proposal ingestion
//!
//! An ingestion source yields proposal records derived from upstream
//! inscriptions. Records are upserted into the store by their stable id, so
//! fetching the same feed twice changes nothing.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    error::EscrowError,
    models::{EscrowEvent, Proposal, ProposalStatus},
    store::{EscrowStore, RecordKind},
    EscrowResult,
};

/// Proposal record as delivered by an ingestion source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedProposal {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub budget_sats: u64,
    #[serde(default)]
    pub skills: Vec<String>,
    pub visible_pixel_hash: Option<String>,
}

/// Counts from one upsert pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

#[async_trait]
pub trait IngestionSource: Send + Sync {
    fn name(&self) -> &str;

    /// Current set of proposal records
    async fn fetch(&self) -> EscrowResult<Vec<IngestedProposal>>;
}

/// In-memory feed for tests and local runs
#[derive(Default)]
pub struct FixtureIngestionSource {
    records: RwLock<Vec<IngestedProposal>>,
    failing: AtomicBool,
}

impl FixtureIngestionSource {
    pub fn new(records: Vec<IngestedProposal>) -> Self {
        Self {
            records: RwLock::new(records),
            failing: AtomicBool::new(false),
        }
    }

    /// Add or replace a record by id
    pub async fn push(&self, record: IngestedProposal) {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => *slot = record,
            None => records.push(record),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl IngestionSource for FixtureIngestionSource {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch(&self) -> EscrowResult<Vec<IngestedProposal>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EscrowError::provider("fixture ingestion source unavailable"));
        }
        Ok(self.records.read().await.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedBody {
    Wrapped { proposals: Vec<IngestedProposal> },
    Bare(Vec<IngestedProposal>),
}

/// JSON feed over HTTP
pub struct HttpIngestionSource {
    client: Client,
    url: String,
}

impl HttpIngestionSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> EscrowResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IngestionSource for HttpIngestionSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self) -> EscrowResult<Vec<IngestedProposal>> {
        let response = self.client.get(&self.url).send().await?;
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(EscrowError::provider(format!("rate limited by {}", self.url)))
            }
            status if !status.is_success() => {
                return Err(EscrowError::provider(format!(
                    "GET {} returned {}",
                    self.url, status
                )))
            }
            _ => {}
        }

        let records = match response.json::<FeedBody>().await? {
            FeedBody::Wrapped { proposals } => proposals,
            FeedBody::Bare(proposals) => proposals,
        };
        debug!("Fetched {} proposals from {}", records.len(), self.url);
        Ok(records)
    }
}

/// Build the source named by configuration; an empty fixture without a feed URL
pub fn build_ingestion_source(config: &EngineConfig) -> EscrowResult<Arc<dyn IngestionSource>> {
    match &config.ingestion_url {
        Some(url) => {
            info!("Ingesting proposals from {}", url);
            Ok(Arc::new(HttpIngestionSource::new(
                url.clone(),
                config.provider_timeout(),
            )?))
        }
        None => Ok(Arc::new(FixtureIngestionSource::default())),
    }
}

/// Upsert `records` into the proposal table by id
pub async fn upsert_proposals(
    store: &EscrowStore,
    source: &str,
    records: Vec<IngestedProposal>,
    now: DateTime<Utc>,
) -> EscrowResult<IngestionReport> {
    let mut report = IngestionReport::default();

    for record in records {
        if let Err(e) = validate_record(&record) {
            warn!("Skipping proposal {:?} from {}: {}", record.id, source, e);
            report.skipped += 1;
            continue;
        }

        let fresh = Proposal {
            id: record.id.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            budget_sats: record.budget_sats,
            skills: record.skills.clone(),
            visible_pixel_hash: record.visible_pixel_hash.clone(),
            status: ProposalStatus::Pending,
            contract_id: None,
            funding: None,
            source: source.to_string(),
            ingested_at: now,
            updated_at: now,
        };

        let (handle, inserted) = store.proposals.get_or_insert(record.id.clone(), fresh).await;
        let mut proposal = handle.lock().await;

        if inserted {
            report.inserted += 1;
            store
                .save(RecordKind::Proposal, &proposal.id, &*proposal)
                .await?;
            store
                .record_event(
                    EscrowEvent::new("proposal.ingested")
                        .metadata(serde_json::json!({ "proposal_id": proposal.id, "source": source })),
                )
                .await?;
            continue;
        }

        // re-ingestion keeps the review state and links
        let changed = proposal.title != record.title
            || proposal.description != record.description
            || proposal.budget_sats != record.budget_sats
            || proposal.skills != record.skills
            || proposal.visible_pixel_hash != record.visible_pixel_hash;
        if !changed {
            report.unchanged += 1;
            continue;
        }

        proposal.title = record.title;
        proposal.description = record.description;
        proposal.budget_sats = record.budget_sats;
        proposal.skills = record.skills;
        proposal.visible_pixel_hash = record.visible_pixel_hash;
        proposal.updated_at = now;
        store
            .save(RecordKind::Proposal, &proposal.id, &*proposal)
            .await?;
        report.updated += 1;
    }

    if report.inserted + report.updated > 0 {
        info!(
            "Ingested from {}: {} new, {} updated, {} unchanged, {} skipped",
            source, report.inserted, report.updated, report.unchanged, report.skipped
        );
    }
    Ok(report)
}

fn validate_record(record: &IngestedProposal) -> EscrowResult<()> {
    if record.id.trim().is_empty() {
        return Err(EscrowError::validation("proposal id cannot be empty"));
    }
    if record.title.trim().is_empty() {
        return Err(EscrowError::validation("proposal title cannot be empty"));
    }
    if record.budget_sats == 0 {
        return Err(EscrowError::validation("proposal budget must be greater than 0"));
    }
    if let Some(hash) = &record.visible_pixel_hash {
        let bytes = hex::decode(hash)?;
        if bytes.len() != 32 {
            return Err(EscrowError::validation(format!(
                "visible pixel hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
    }
    Ok(())
}
