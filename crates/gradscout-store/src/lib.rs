//! File-backed listing store and export ledger.
//!
//! Both collections are directories of JSON documents. Listings are keyed
//! by fingerprint (`listings/<fingerprint>.json`); export records are
//! append-only (`exports/<export-id>.json`). Every write goes through a
//! temp file in the same directory; a record becomes visible only via an
//! atomic link or rename, so a crashed or cancelled write never leaves a
//! partial document behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use gradscout_core::{fingerprint, ExportRecord, Fingerprint, ListingRecord, RawListing};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gradscout-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BulkInsertOutcome {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub unpushed: usize,
    pub by_source: BTreeMap<String, usize>,
}

/// Writes `bytes` to a fresh temp file in `dir` and returns its path.
/// The temp name starts with a dot so directory scans skip it.
async fn write_temp(dir: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| io_err(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| io_err(&temp_path, e))?;
    file.flush().await.map_err(|e| io_err(&temp_path, e))?;
    Ok(temp_path)
}

fn is_record_file(path: &Path) -> bool {
    path.extension().map(|e| e == "json").unwrap_or(false)
        && !path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true)
}

async fn read_json_records<T: serde::de::DeserializeOwned>(
    dir: &Path,
) -> Result<Vec<T>, StoreError> {
    let mut entries = fs::read_dir(dir).await.map_err(|e| io_err(dir, e))?;
    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(dir, e))? {
        let path = entry.path();
        if !is_record_file(&path) {
            continue;
        }
        let bytes = fs::read(&path).await.map_err(|e| io_err(&path, e))?;
        let record = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            source: e,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Durable, dedup-enforcing storage of [`ListingRecord`]s.
///
/// At most one record exists per fingerprint. Insertion resolves races with
/// a fail-if-exists hard link rather than a lock, so concurrent crawlers
/// ingesting the same listing agree on exactly one winner.
#[derive(Debug, Clone)]
pub struct ListingStore {
    listings_dir: PathBuf,
}

impl ListingStore {
    /// Opens (and creates if needed) the listing collection under `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let listings_dir = root.into().join("listings");
        fs::create_dir_all(&listings_dir)
            .await
            .map_err(|e| io_err(&listings_dir, e))?;
        Ok(Self { listings_dir })
    }

    fn record_path(&self, fp: &Fingerprint) -> PathBuf {
        self.listings_dir.join(format!("{fp}.json"))
    }

    /// Inserts a listing keyed by its fingerprint. Returns `Ok(true)` when
    /// the record was newly added and `Ok(false)` for a duplicate. A write
    /// conflict on the same fingerprint is a duplicate, not an error; only
    /// genuine I/O failure surfaces as `Err`.
    pub async fn insert(&self, listing: RawListing) -> Result<bool, StoreError> {
        let fp = fingerprint(&listing);
        let final_path = self.record_path(&fp);

        if fs::try_exists(&final_path)
            .await
            .map_err(|e| io_err(&final_path, e))?
        {
            debug!(fingerprint = fp.short(), "duplicate listing skipped");
            return Ok(false);
        }

        let record = ListingRecord {
            fingerprint: fp.clone(),
            created_at: Utc::now(),
            pushed: false,
            listing,
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Corrupt {
            path: final_path.clone(),
            source: e,
        })?;

        let temp_path = write_temp(&self.listings_dir, &bytes).await?;
        // hard_link fails with AlreadyExists instead of overwriting, which
        // settles the insert race per fingerprint.
        match fs::hard_link(&temp_path, &final_path).await {
            Ok(()) => {
                let _ = fs::remove_file(&temp_path).await;
                info!(
                    fingerprint = fp.short(),
                    source = %record.source(),
                    title = record.listing.title(),
                    "added new listing"
                );
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                debug!(fingerprint = fp.short(), "duplicate listing lost insert race");
                Ok(false)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(&final_path, err))
            }
        }
    }

    /// Inserts each listing independently; a failing entry is logged and
    /// counted as skipped, never aborting the batch.
    pub async fn bulk_insert(&self, listings: Vec<RawListing>) -> BulkInsertOutcome {
        let mut outcome = BulkInsertOutcome::default();
        for listing in listings {
            match self.insert(listing).await {
                Ok(true) => outcome.added += 1,
                Ok(false) => outcome.skipped += 1,
                Err(err) => {
                    warn!(error = %err, "insert failed; skipping entry");
                    outcome.skipped += 1;
                }
            }
        }
        outcome
    }

    pub async fn get_by_fingerprint(
        &self,
        fp: &Fingerprint,
    ) -> Result<Option<ListingRecord>, StoreError> {
        let path = self.record_path(fp);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&path, err)),
        };
        let record = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path,
            source: e,
        })?;
        Ok(Some(record))
    }

    pub async fn get_all(&self) -> Result<Vec<ListingRecord>, StoreError> {
        read_json_records(&self.listings_dir).await
    }

    /// Snapshot of all records not yet included in a completed export.
    pub async fn get_unpushed(&self) -> Result<Vec<ListingRecord>, StoreError> {
        let mut records = self.get_all().await?;
        records.retain(|r| !r.pushed);
        Ok(records)
    }

    async fn rewrite(&self, record: &ListingRecord) -> Result<(), StoreError> {
        let final_path = self.record_path(&record.fingerprint);
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupt {
            path: final_path.clone(),
            source: e,
        })?;
        let temp_path = write_temp(&self.listings_dir, &bytes).await?;
        match fs::rename(&temp_path, &final_path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(&final_path, err))
            }
        }
    }

    /// Flips `pushed` to true. Idempotent: an already-pushed record returns
    /// `Ok(true)` without a write; an unknown fingerprint returns `Ok(false)`.
    pub async fn mark_pushed(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        let Some(mut record) = self.get_by_fingerprint(fp).await? else {
            return Ok(false);
        };
        if record.pushed {
            return Ok(true);
        }
        record.pushed = true;
        self.rewrite(&record).await?;
        Ok(true)
    }

    /// Marks each fingerprint; the returned count covers only records whose
    /// flag actually transitioned from false to true.
    pub async fn bulk_mark_pushed(&self, fps: &[Fingerprint]) -> Result<usize, StoreError> {
        let mut marked = 0;
        for fp in fps {
            match self.get_by_fingerprint(fp).await? {
                Some(mut record) if !record.pushed => {
                    record.pushed = true;
                    self.rewrite(&record).await?;
                    marked += 1;
                }
                Some(_) => {}
                None => {
                    warn!(fingerprint = fp.short(), "unknown fingerprint in bulk mark");
                }
            }
        }
        Ok(marked)
    }

    /// Administrative override: forces every record's flag to `pushed`.
    /// Only records whose flag differs are rewritten; returns that count.
    pub async fn reset_all(&self, pushed: bool) -> Result<usize, StoreError> {
        let mut changed = 0;
        for mut record in self.get_all().await? {
            if record.pushed != pushed {
                record.pushed = pushed;
                self.rewrite(&record).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let records = self.get_all().await?;
        let mut stats = StoreStats {
            total: records.len(),
            ..StoreStats::default()
        };
        for record in &records {
            if !record.pushed {
                stats.unpushed += 1;
            }
            *stats
                .by_source
                .entry(record.source().as_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }
}

/// Append-only audit log of completed export cycles. Records are never
/// rewritten or deleted; the latest entry drives crash recovery.
#[derive(Debug, Clone)]
pub struct ExportLedger {
    exports_dir: PathBuf,
}

impl ExportLedger {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let exports_dir = root.into().join("exports");
        fs::create_dir_all(&exports_dir)
            .await
            .map_err(|e| io_err(&exports_dir, e))?;
        Ok(Self { exports_dir })
    }

    /// Appends a record for a completed sink write. The spreadsheet URL is
    /// derived from the id; `export_date` is stamped now.
    pub async fn append(
        &self,
        spreadsheet_id: &str,
        fingerprints: Vec<Fingerprint>,
    ) -> Result<ExportRecord, StoreError> {
        let now = Utc::now();
        let record = ExportRecord {
            id: format!("export_{}_{}", now.timestamp_millis(), Uuid::new_v4().simple()),
            spreadsheet_id: spreadsheet_id.to_string(),
            spreadsheet_url: format!("https://docs.google.com/spreadsheets/d/{spreadsheet_id}"),
            export_date: now,
            job_count: fingerprints.len(),
            fingerprints,
        };

        let final_path = self.exports_dir.join(format!("{}.json", record.id));
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Corrupt {
            path: final_path.clone(),
            source: e,
        })?;
        let temp_path = write_temp(&self.exports_dir, &bytes).await?;
        match fs::hard_link(&temp_path, &final_path).await {
            Ok(()) => {
                let _ = fs::remove_file(&temp_path).await;
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(io_err(&final_path, err));
            }
        }
        info!(
            export_id = %record.id,
            jobs = record.job_count,
            spreadsheet_id,
            "export record appended"
        );
        Ok(record)
    }

    pub async fn all(&self) -> Result<Vec<ExportRecord>, StoreError> {
        read_json_records(&self.exports_dir).await
    }

    /// Exports from the last `within_days` days, newest first. A span too
    /// large to represent as a cutoff keeps every record.
    pub async fn recent(&self, within_days: i64) -> Result<Vec<ExportRecord>, StoreError> {
        let cutoff =
            Duration::try_days(within_days).and_then(|d| Utc::now().checked_sub_signed(d));
        let mut records = self.all().await?;
        if let Some(cutoff) = cutoff {
            records.retain(|r| r.export_date >= cutoff);
        }
        records.sort_by_key(|r| std::cmp::Reverse(r.export_date));
        Ok(records)
    }

    pub async fn by_spreadsheet_id(
        &self,
        spreadsheet_id: &str,
    ) -> Result<Option<ExportRecord>, StoreError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|r| r.spreadsheet_id == spreadsheet_id))
    }

    pub async fn latest(&self) -> Result<Option<ExportRecord>, StoreError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .max_by_key(|r| r.export_date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradscout_core::{OneOrMany, ProspleListing, SeekListing};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn seek_listing(title: &str, company: &str, description: &str) -> RawListing {
        RawListing::Seek(SeekListing {
            job_id: None,
            title: title.into(),
            company: company.into(),
            locations: OneOrMany::One("Melbourne VIC".into()),
            work_arrangement: None,
            salary: Some("$85k".into()),
            description: None,
            full_description: Some(description.into()),
            listing_date: Some("2d ago".into()),
            url: Some("https://www.seek.com.au/job/1".into()),
            is_premium: false,
            classification: None,
            sub_classification: None,
        })
    }

    fn prosple_listing(title: &str) -> RawListing {
        RawListing::Prosple(ProspleListing {
            title: title.into(),
            company: "Acme".into(),
            locations: OneOrMany::Many(vec!["Sydney".into(), "Remote".into()]),
            salary: None,
            start_date: None,
            url: Some(format!("https://au.prosple.com/{title}")),
            badges: Vec::new(),
            timing_info: None,
            full_description: None,
        })
    }

    #[tokio::test]
    async fn insert_deduplicates_by_fingerprint() {
        let dir = tempdir().expect("tempdir");
        let store = ListingStore::open(dir.path()).await.expect("open");

        let first = store
            .insert(seek_listing("Software Engineer", "Acme", "Build stuff."))
            .await
            .expect("first insert");
        let second = store
            .insert(seek_listing("Software Engineer", "Acme", "Build stuff."))
            .await
            .expect("second insert");

        assert!(first);
        assert!(!second);
        assert_eq!(store.get_all().await.expect("get_all").len(), 1);
    }

    #[tokio::test]
    async fn bulk_insert_counts_superficial_duplicates_as_skipped() {
        let dir = tempdir().expect("tempdir");
        let store = ListingStore::open(dir.path()).await.expect("open");

        // Same listing modulo case/whitespace/punctuation of the five
        // canonical fields.
        let a = seek_listing("Software Engineer", "Acme", "Build stuff.");
        let b = seek_listing(" software engineer ", "ACME", "build stuff");

        let outcome = store.bulk_insert(vec![a, b]).await;
        assert_eq!(outcome, BulkInsertOutcome { added: 1, skipped: 1 });
        assert_eq!(store.get_all().await.expect("get_all").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_agree_on_one_winner() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(ListingStore::open(dir.path()).await.expect("open"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert(seek_listing("Graduate Developer", "Acme", "desc"))
                    .await
                    .expect("insert")
            }));
        }

        let mut added = 0;
        for handle in handles {
            if handle.await.expect("join") {
                added += 1;
            }
        }
        assert_eq!(added, 1);
        assert_eq!(store.get_all().await.expect("get_all").len(), 1);
    }

    #[tokio::test]
    async fn mark_pushed_is_idempotent_and_preserves_created_at() {
        let dir = tempdir().expect("tempdir");
        let store = ListingStore::open(dir.path()).await.expect("open");
        let listing = seek_listing("Engineer", "Acme", "desc");
        let fp = fingerprint(&listing);
        store.insert(listing).await.expect("insert");

        assert!(store.mark_pushed(&fp).await.expect("first mark"));
        let after_first = store
            .get_by_fingerprint(&fp)
            .await
            .expect("get")
            .expect("present");

        assert!(store.mark_pushed(&fp).await.expect("second mark"));
        let after_second = store
            .get_by_fingerprint(&fp)
            .await
            .expect("get")
            .expect("present");

        assert!(after_first.pushed);
        assert_eq!(after_first, after_second);
        assert_eq!(after_first.created_at, after_second.created_at);
    }

    #[tokio::test]
    async fn mark_pushed_on_unknown_fingerprint_returns_false() {
        let dir = tempdir().expect("tempdir");
        let store = ListingStore::open(dir.path()).await.expect("open");
        let fp = Fingerprint::from_hex("ab".repeat(32));
        assert!(!store.mark_pushed(&fp).await.expect("mark"));
    }

    #[tokio::test]
    async fn bulk_mark_pushed_counts_only_real_transitions() {
        let dir = tempdir().expect("tempdir");
        let store = ListingStore::open(dir.path()).await.expect("open");

        let a = seek_listing("Role A", "Acme", "a");
        let b = seek_listing("Role B", "Acme", "b");
        let fp_a = fingerprint(&a);
        let fp_b = fingerprint(&b);
        store.insert(a).await.expect("insert a");
        store.insert(b).await.expect("insert b");
        store.mark_pushed(&fp_a).await.expect("pre-mark a");

        let unknown = Fingerprint::from_hex("cd".repeat(32));
        let marked = store
            .bulk_mark_pushed(&[fp_a, fp_b, unknown])
            .await
            .expect("bulk mark");
        assert_eq!(marked, 1);
    }

    #[tokio::test]
    async fn reset_all_touches_only_differing_records() {
        let dir = tempdir().expect("tempdir");
        let store = ListingStore::open(dir.path()).await.expect("open");

        let a = seek_listing("Role A", "Acme", "a");
        let fp_a = fingerprint(&a);
        store.insert(a).await.expect("insert a");
        store
            .insert(seek_listing("Role B", "Acme", "b"))
            .await
            .expect("insert b");
        store.mark_pushed(&fp_a).await.expect("mark a");

        assert_eq!(store.reset_all(true).await.expect("reset up"), 1);
        assert_eq!(store.reset_all(false).await.expect("reset down"), 2);
        assert_eq!(store.reset_all(false).await.expect("reset noop"), 0);
        assert_eq!(store.get_unpushed().await.expect("unpushed").len(), 2);
    }

    #[tokio::test]
    async fn get_unpushed_excludes_pushed_records() {
        let dir = tempdir().expect("tempdir");
        let store = ListingStore::open(dir.path()).await.expect("open");

        let a = seek_listing("Role A", "Acme", "a");
        let fp_a = fingerprint(&a);
        store.insert(a).await.expect("insert a");
        store.insert(prosple_listing("Role B")).await.expect("insert b");
        store.mark_pushed(&fp_a).await.expect("mark a");

        let unpushed = store.get_unpushed().await.expect("unpushed");
        assert_eq!(unpushed.len(), 1);
        assert_eq!(unpushed[0].listing.title(), "Role B");
    }

    #[tokio::test]
    async fn stats_counts_per_source_and_unpushed() {
        let dir = tempdir().expect("tempdir");
        let store = ListingStore::open(dir.path()).await.expect("open");

        let a = seek_listing("Role A", "Acme", "a");
        let fp_a = fingerprint(&a);
        store.insert(a).await.expect("insert a");
        store
            .insert(seek_listing("Role B", "Acme", "b"))
            .await
            .expect("insert b");
        store.insert(prosple_listing("Role C")).await.expect("insert c");
        store.mark_pushed(&fp_a).await.expect("mark a");

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unpushed, 2);
        assert_eq!(stats.by_source.get("seek"), Some(&2));
        assert_eq!(stats.by_source.get("prosple"), Some(&1));
    }

    #[tokio::test]
    async fn ledger_append_derives_url_and_count() {
        let dir = tempdir().expect("tempdir");
        let ledger = ExportLedger::open(dir.path()).await.expect("open");

        let fps = vec![
            Fingerprint::from_hex("ab".repeat(32)),
            Fingerprint::from_hex("cd".repeat(32)),
        ];
        let record = ledger.append("sheet-123", fps.clone()).await.expect("append");

        assert_eq!(record.spreadsheet_id, "sheet-123");
        assert_eq!(
            record.spreadsheet_url,
            "https://docs.google.com/spreadsheets/d/sheet-123"
        );
        assert_eq!(record.job_count, 2);
        assert_eq!(record.fingerprints, fps);
        assert_eq!(ledger.all().await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn ledger_latest_and_lookup_by_spreadsheet_id() {
        let dir = tempdir().expect("tempdir");
        let ledger = ExportLedger::open(dir.path()).await.expect("open");

        ledger.append("sheet-1", Vec::new()).await.expect("first");
        let second = ledger.append("sheet-2", Vec::new()).await.expect("second");

        let latest = ledger.latest().await.expect("latest").expect("present");
        assert_eq!(latest.id, second.id);

        let by_id = ledger
            .by_spreadsheet_id("sheet-1")
            .await
            .expect("by id")
            .expect("present");
        assert_eq!(by_id.spreadsheet_id, "sheet-1");
        assert!(ledger
            .by_spreadsheet_id("sheet-404")
            .await
            .expect("by id")
            .is_none());
    }

    #[tokio::test]
    async fn ledger_recent_filters_by_age_and_sorts_newest_first() {
        let dir = tempdir().expect("tempdir");
        let ledger = ExportLedger::open(dir.path()).await.expect("open");

        ledger.append("sheet-new-1", Vec::new()).await.expect("append");
        ledger.append("sheet-new-2", Vec::new()).await.expect("append");

        // Simulate an old completed export by writing its document directly.
        let stale = ExportRecord {
            id: "export_0_stale".into(),
            spreadsheet_id: "sheet-old".into(),
            spreadsheet_url: "https://docs.google.com/spreadsheets/d/sheet-old".into(),
            export_date: Utc::now() - Duration::days(30),
            job_count: 0,
            fingerprints: Vec::new(),
        };
        let stale_path = dir.path().join("exports").join("export_0_stale.json");
        fs::write(&stale_path, serde_json::to_vec_pretty(&stale).unwrap())
            .await
            .expect("write stale");

        let recent = ledger.recent(7).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert!(recent[0].export_date >= recent[1].export_date);
        assert!(recent.iter().all(|r| r.spreadsheet_id != "sheet-old"));

        let all = ledger.all().await.expect("all");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn ledger_recent_tolerates_extreme_day_spans() {
        let dir = tempdir().expect("tempdir");
        let ledger = ExportLedger::open(dir.path()).await.expect("open");
        ledger.append("sheet-1", Vec::new()).await.expect("append");

        // day spans that cannot be represented as a cutoff keep everything
        assert_eq!(ledger.recent(i64::MAX).await.expect("recent").len(), 1);
        assert_eq!(ledger.recent(i64::MIN).await.expect("recent").len(), 1);
    }
}
