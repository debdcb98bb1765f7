//! Export orchestration and ingest pipeline.
//!
//! The export cycle is deliberately sequential: snapshot unpushed listings,
//! write them to the spreadsheet sink, append the ledger record, then flip
//! push flags. The ledger append is the commit point: everything before it
//! is retryable with no state change, everything after it is healed by
//! [`ExportCoordinator::recover`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use gradscout_adapters::{adapter_for, load_capture_bundle};
use gradscout_core::{ListingRecord, RawListing, SourceTag};
use gradscout_store::{ExportLedger, ListingStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gradscout-sync";

/// One spreadsheet row. Column order is a positional contract with
/// downstream consumers; never reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetRow(Vec<String>);

impl SheetRow {
    pub const HEADERS: [&'static str; 10] = [
        "Title",
        "Company",
        "Location",
        "Salary",
        "Start Date",
        "URL",
        "Description",
        "Source",
        "Added Date",
        "Pushed",
    ];

    pub fn header() -> Self {
        SheetRow(Self::HEADERS.iter().map(|h| h.to_string()).collect())
    }

    pub fn from_record(record: &ListingRecord) -> Self {
        SheetRow(vec![
            record.listing.title().to_string(),
            record.listing.company().to_string(),
            record.listing.location_display(),
            record.listing.salary().unwrap_or_default().to_string(),
            record.listing.date_display(),
            record.listing.url().unwrap_or_default().to_string(),
            record.listing.short_description(),
            record.source().to_string(),
            record.created_at.format("%Y-%m-%d").to_string(),
            if record.pushed { "Yes" } else { "No" }.to_string(),
        ])
    }

    pub fn cells(&self) -> &[String] {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sheet transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("sheet api status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("{0}")]
    Message(String),
}

/// External spreadsheet service boundary. Implementations must not mutate
/// any local state; the coordinator relies on a failed sink call leaving
/// the store and ledger untouched.
#[async_trait]
pub trait SheetSink: Send + Sync {
    async fn create_sheet(&self, title: &str) -> Result<String, SinkError>;
    async fn write_rows(&self, sheet_id: &str, rows: &[SheetRow]) -> Result<(), SinkError>;
    async fn append_rows(&self, sheet_id: &str, rows: &[SheetRow]) -> Result<(), SinkError>;
}

/// Google Sheets v4 REST implementation. Takes an already-obtained bearer
/// token; the OAuth flow lives outside this system.
pub struct GoogleSheetsSink {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl GoogleSheetsSink {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: "https://sheets.googleapis.com".to_string(),
            token: token.into(),
        })
    }

    /// Point at a different endpoint, e.g. a local stub.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Api {
            status: status.as_u16(),
            body,
        })
    }

    fn values_body(rows: &[SheetRow]) -> serde_json::Value {
        serde_json::json!({
            "values": rows.iter().map(|r| r.cells()).collect::<Vec<_>>()
        })
    }
}

#[async_trait]
impl SheetSink for GoogleSheetsSink {
    async fn create_sheet(&self, title: &str) -> Result<String, SinkError> {
        let url = format!("{}/v4/spreadsheets", self.base_url);
        let body = serde_json::json!({
            "properties": { "title": title },
            "sheets": [{
                "properties": {
                    "title": "Jobs",
                    "gridProperties": { "frozenRowCount": 1 }
                }
            }]
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let value: serde_json::Value = resp.json().await?;
        value
            .get("spreadsheetId")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| SinkError::Message("create response missing spreadsheetId".into()))
    }

    async fn write_rows(&self, sheet_id: &str, rows: &[SheetRow]) -> Result<(), SinkError> {
        let url = format!(
            "{}/v4/spreadsheets/{}/values/Jobs!A1?valueInputOption=RAW",
            self.base_url, sheet_id
        );
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&Self::values_body(rows))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn append_rows(&self, sheet_id: &str, rows: &[SheetRow]) -> Result<(), SinkError> {
        let url = format!(
            "{}/v4/spreadsheets/{}/values/Jobs!A2:append?valueInputOption=RAW",
            self.base_url, sheet_id
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&Self::values_body(rows))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

/// In-memory sink for tests and `--dry-run` exports. Optionally fails every
/// call to exercise the abort path.
#[derive(Debug, Default)]
pub struct MemorySink {
    fail: AtomicBool,
    next_id: AtomicUsize,
    created: std::sync::Mutex<Vec<String>>,
    rows: std::sync::Mutex<HashMap<String, Vec<SheetRow>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn created_sheets(&self) -> Vec<String> {
        self.created.lock().expect("sink lock").clone()
    }

    pub fn rows_for(&self, sheet_id: &str) -> Vec<SheetRow> {
        self.rows
            .lock()
            .expect("sink lock")
            .get(sheet_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_failure(&self) -> Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(SinkError::Message("injected sink failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SheetSink for MemorySink {
    async fn create_sheet(&self, title: &str) -> Result<String, SinkError> {
        self.check_failure()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sheet_id = format!("mem-sheet-{n}");
        info!(sheet_id, title, "memory sink created sheet");
        self.created.lock().expect("sink lock").push(sheet_id.clone());
        Ok(sheet_id)
    }

    async fn write_rows(&self, sheet_id: &str, rows: &[SheetRow]) -> Result<(), SinkError> {
        self.check_failure()?;
        self.rows
            .lock()
            .expect("sink lock")
            .entry(sheet_id.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    async fn append_rows(&self, sheet_id: &str, rows: &[SheetRow]) -> Result<(), SinkError> {
        self.write_rows(sheet_id, rows).await
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("an export cycle is already running")]
    Busy,
    #[error("spreadsheet sink failed: {0}")]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExportOutcome {
    /// No unpushed listings; normal, nothing written anywhere.
    NothingToExport,
    Exported {
        spreadsheet_id: String,
        spreadsheet_url: String,
        exported: usize,
    },
}

/// Runs export cycles: snapshot -> sink -> ledger -> mark. At most one
/// cycle is in flight at a time; a concurrent request observes `Busy`.
pub struct ExportCoordinator {
    store: Arc<ListingStore>,
    ledger: Arc<ExportLedger>,
    sink: Arc<dyn SheetSink>,
    in_flight: Mutex<()>,
}

impl ExportCoordinator {
    pub fn new(store: Arc<ListingStore>, ledger: Arc<ExportLedger>, sink: Arc<dyn SheetSink>) -> Self {
        Self {
            store,
            ledger,
            sink,
            in_flight: Mutex::new(()),
        }
    }

    /// One export cycle. Before the ledger append this is abortable with no
    /// state change; after it, marking runs to completion and any crash in
    /// between is repaired by [`Self::recover`].
    pub async fn run_export(&self, title: Option<String>) -> Result<ExportOutcome, ExportError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ExportError::Busy)?;
        let run_id = Uuid::new_v4();

        let snapshot = self.store.get_unpushed().await?;
        if snapshot.is_empty() {
            info!(%run_id, "no unpushed listings; export cycle is a no-op");
            return Ok(ExportOutcome::NothingToExport);
        }
        info!(%run_id, unpushed = snapshot.len(), "starting export cycle");

        let title =
            title.unwrap_or_else(|| format!("Job Listings - {}", Utc::now().format("%Y-%m-%d")));
        let sheet_id = self.sink.create_sheet(&title).await?;
        let mut rows = Vec::with_capacity(snapshot.len() + 1);
        rows.push(SheetRow::header());
        rows.extend(snapshot.iter().map(SheetRow::from_record));
        self.sink.write_rows(&sheet_id, &rows).await?;

        // Durable proof of the completed sink write, before any flag flips.
        let fingerprints = snapshot.iter().map(|r| r.fingerprint.clone()).collect();
        let export = self.ledger.append(&sheet_id, fingerprints).await?;

        // Mark from the ledger record, not the in-memory snapshot, so the
        // live path and crash recovery share one source of truth.
        let marked = self.store.bulk_mark_pushed(&export.fingerprints).await?;
        info!(
            %run_id,
            exported = export.job_count,
            marked,
            spreadsheet_id = %export.spreadsheet_id,
            "export cycle complete"
        );

        Ok(ExportOutcome::Exported {
            spreadsheet_id: export.spreadsheet_id,
            spreadsheet_url: export.spreadsheet_url,
            exported: export.job_count,
        })
    }

    /// Re-applies push marks from the latest ledger record. Heals a crash
    /// between the ledger append and the marking step without re-invoking
    /// the sink or writing a new ledger entry. Returns the repaired count.
    pub async fn recover(&self) -> Result<usize, ExportError> {
        let Some(latest) = self.ledger.latest().await? else {
            return Ok(0);
        };

        let mut unmarked = Vec::new();
        for fp in &latest.fingerprints {
            if let Some(record) = self.store.get_by_fingerprint(fp).await? {
                if !record.pushed {
                    unmarked.push(fp.clone());
                }
            }
        }
        if unmarked.is_empty() {
            return Ok(0);
        }

        warn!(
            export_id = %latest.id,
            gap = unmarked.len(),
            "reconciliation gap: ledger entry has unmarked fingerprints; re-marking"
        );
        let marked = self.store.bulk_mark_pushed(&unmarked).await?;
        Ok(marked)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub tag: SourceTag,
    pub display_name: String,
    pub enabled: bool,
    /// Directory of capture bundles, relative to the captures root.
    pub capture_dir: String,
}

impl SourceRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceIngest {
    pub tag: SourceTag,
    pub bundles: usize,
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub sources: Vec<SourceIngest>,
}

impl IngestSummary {
    pub fn added(&self) -> usize {
        self.sources.iter().map(|s| s.added).sum()
    }

    pub fn skipped(&self) -> usize {
        self.sources.iter().map(|s| s.skipped).sum()
    }
}

/// Walks capture bundles per enabled source and bulk-inserts what the
/// adapters parse. One failing source or bundle never aborts the run.
pub struct IngestPipeline {
    store: Arc<ListingStore>,
    registry: SourceRegistry,
}

impl IngestPipeline {
    pub fn new(store: Arc<ListingStore>, registry: SourceRegistry) -> Self {
        Self { store, registry }
    }

    /// Single-record ingestion boundary for in-process crawlers.
    /// `Ok(true)` means newly accepted, `Ok(false)` a duplicate.
    pub async fn submit(&self, listing: RawListing) -> Result<bool, StoreError> {
        self.store.insert(listing).await
    }

    pub async fn run_once(&self, captures_root: &Path) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();

        for entry in self.registry.sources.iter().filter(|s| s.enabled) {
            let adapter = adapter_for(entry.tag);
            let dir = captures_root.join(&entry.capture_dir);
            let bundle_paths = match list_bundle_paths(&dir).await {
                Ok(paths) => paths,
                Err(err) => {
                    warn!(source = %entry.tag, error = %err, "skipping source; capture dir unreadable");
                    continue;
                }
            };

            let mut ingest = SourceIngest {
                tag: entry.tag,
                bundles: 0,
                added: 0,
                skipped: 0,
            };
            for bundle_path in bundle_paths {
                let bundle = match load_capture_bundle(&bundle_path) {
                    Ok(bundle) => bundle,
                    Err(err) => {
                        warn!(path = %bundle_path.display(), error = %err, "skipping unreadable capture bundle");
                        continue;
                    }
                };
                let listings = match adapter.parse_capture(&bundle) {
                    Ok(listings) => listings,
                    Err(err) => {
                        warn!(path = %bundle_path.display(), error = %err, "skipping unparseable capture bundle");
                        continue;
                    }
                };
                ingest.bundles += 1;
                let outcome = self.store.bulk_insert(listings).await;
                ingest.added += outcome.added;
                ingest.skipped += outcome.skipped;
            }

            info!(
                source = %entry.tag,
                bundles = ingest.bundles,
                added = ingest.added,
                skipped = ingest.skipped,
                "source ingest complete"
            );
            summary.sources.push(ingest);
        }

        Ok(summary)
    }
}

async fn list_bundle_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub captures_dir: PathBuf,
    pub sources_file: PathBuf,
    pub sheets_token: Option<String>,
    pub export_cron: String,
    pub scheduler_enabled: bool,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("GRADSCOUT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            captures_dir: std::env::var("GRADSCOUT_CAPTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./captures")),
            sources_file: std::env::var("GRADSCOUT_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            sheets_token: std::env::var("GRADSCOUT_SHEETS_TOKEN").ok(),
            export_cron: std::env::var("GRADSCOUT_EXPORT_CRON")
                .unwrap_or_else(|_| "0 0 7 * * *".to_string()),
            scheduler_enabled: std::env::var("GRADSCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            http_timeout_secs: std::env::var("GRADSCOUT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Builds the periodic export scheduler when enabled. Overlapping fires
/// observe the coordinator's busy condition and skip.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    coordinator: Arc<ExportCoordinator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.export_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            match coordinator.run_export(None).await {
                Ok(ExportOutcome::NothingToExport) => {
                    info!("scheduled export: nothing to export");
                }
                Ok(ExportOutcome::Exported { spreadsheet_id, exported, .. }) => {
                    info!(spreadsheet_id, exported, "scheduled export complete");
                }
                Err(ExportError::Busy) => {
                    warn!("scheduled export skipped; a cycle is already running");
                }
                Err(err) => {
                    warn!(error = %err, "scheduled export failed; will retry on next fire");
                }
            }
        })
    })
    .with_context(|| format!("creating export job for cron {cron}"))?;
    sched.add(job).await.context("adding export job")?;
    Ok(Some(sched))
}
