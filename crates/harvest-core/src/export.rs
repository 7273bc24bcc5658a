//! Snapshot hand-off to reader processes.
//!
//! The writer publishes `<dir>/<dataset>/latest.json` by writing a temporary
//! file in the same directory, syncing it and renaming it over the previous
//! document. Readers therefore see either the old complete snapshot or the
//! new one. Every export also lands in `<dir>/<dataset>/archive/` under a
//! sortable UTC timestamp name with a sequence suffix. Archive files are
//! never replaced, even when two exports share a millisecond.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::error::AppError;
use crate::models::{DerivedRecord, ExportSnapshot};

const LATEST_FILE: &str = "latest.json";
const ARCHIVE_DIR: &str = "archive";
const ARCHIVE_SEQ_LIMIT: u32 = 1000;

/// Configuration for [`SnapshotExporter`].
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub dir: PathBuf,
    /// Archive files kept per dataset. Zero keeps everything.
    pub archive_keep: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./exports"),
            archive_keep: 48,
        }
    }
}

impl ExportConfig {
    /// Read configuration from environment variables.
    ///
    /// - `HARVEST_EXPORT_DIR` (optional, defaults to `./exports`)
    /// - `HARVEST_EXPORT_ARCHIVE_KEEP` (optional, defaults to 48)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            dir: std::env::var("HARVEST_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            archive_keep: crate::config::env_parse(
                "HARVEST_EXPORT_ARCHIVE_KEEP",
                defaults.archive_keep,
            )?,
        })
    }
}

/// Writes snapshot documents with atomic replace semantics.
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    config: ExportConfig,
}

impl SnapshotExporter {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Publish one snapshot. Returns the path of the `latest.json` document.
    pub fn export(&self, snapshot: &ExportSnapshot) -> Result<PathBuf, AppError> {
        let dataset_dir = dataset_dir(&self.config.dir, &snapshot.dataset_name)?;
        let archive_dir = dataset_dir.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archive_dir).map_err(|e| {
            AppError::ExportError(format!(
                "Failed to create export directory {}: {e}",
                archive_dir.display()
            ))
        })?;

        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let latest = dataset_dir.join(LATEST_FILE);
        write_atomic(&latest, &bytes)?;

        write_archive(&archive_dir, snapshot.generated_at, &bytes)?;

        if self.config.archive_keep > 0 {
            let removed = prune_archive(&archive_dir, self.config.archive_keep)?;
            if removed > 0 {
                tracing::debug!(
                    dataset = %snapshot.dataset_name,
                    removed,
                    "Pruned snapshot archive"
                );
            }
        }

        tracing::info!(
            dataset = %snapshot.dataset_name,
            path = %latest.display(),
            "Snapshot exported"
        );
        Ok(latest)
    }

    /// Group records by dataset and publish one snapshot per dataset.
    ///
    /// The payload is the dataset's records as a JSON array of
    /// `{ticker, payload, computed_at}` objects, ordered by ticker.
    pub fn export_records(
        &self,
        records: &[DerivedRecord],
        generated_at: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, AppError> {
        let mut by_dataset: BTreeMap<&str, Vec<&DerivedRecord>> = BTreeMap::new();
        for record in records {
            by_dataset.entry(&record.dataset).or_default().push(record);
        }

        let mut paths = Vec::with_capacity(by_dataset.len());
        for (dataset, mut rows) in by_dataset {
            rows.sort_by(|a, b| a.ticker.cmp(&b.ticker));
            let payload = serde_json::Value::Array(
                rows.into_iter()
                    .map(|r| {
                        serde_json::json!({
                            "ticker": r.ticker,
                            "payload": r.payload,
                            "computed_at": r.computed_at,
                        })
                    })
                    .collect(),
            );
            let snapshot = ExportSnapshot {
                dataset_name: dataset.to_string(),
                generated_at,
                payload,
            };
            paths.push(self.export(&snapshot)?);
        }
        Ok(paths)
    }
}

/// Read-only view of exported snapshots. Never touches the primary store.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    dir: PathBuf,
}

impl SnapshotReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The current snapshot for `dataset`.
    ///
    /// A missing or unparseable document means "no data available" and
    /// yields `Ok(None)`. Only unexpected I/O failures are errors.
    pub fn read_latest(&self, dataset: &str) -> Result<Option<ExportSnapshot>, AppError> {
        let path = dataset_dir(&self.dir, dataset)?.join(LATEST_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::ExportError(format!(
                    "Failed to read snapshot {}: {e}",
                    path.display()
                )));
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable snapshot");
                Ok(None)
            }
        }
    }

    /// The current snapshot only if it was generated after `since`.
    pub fn read_if_newer(
        &self,
        dataset: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ExportSnapshot>, AppError> {
        Ok(self
            .read_latest(dataset)?
            .filter(|snapshot| snapshot.generated_at > since))
    }

    /// Datasets that currently have a published `latest.json`, sorted.
    pub fn datasets(&self) -> Result<Vec<String>, AppError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut datasets = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().join(LATEST_FILE).is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                datasets.push(name.to_string());
            }
        }
        datasets.sort();
        Ok(datasets)
    }

    /// Archived snapshot files for `dataset`, oldest first.
    pub fn archive(&self, dataset: &str) -> Result<Vec<PathBuf>, AppError> {
        let archive_dir = dataset_dir(&self.dir, dataset)?.join(ARCHIVE_DIR);
        match archive_files(&archive_dir) {
            Err(AppError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            other => other,
        }
    }
}

/// Resolve the directory of a dataset, rejecting names that could escape `root`.
fn dataset_dir(root: &Path, dataset: &str) -> Result<PathBuf, AppError> {
    let valid = !dataset.is_empty()
        && dataset != "."
        && dataset != ".."
        && dataset
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(AppError::ExportError(format!(
            "Invalid dataset name '{dataset}'"
        )));
    }
    Ok(root.join(dataset))
}

/// `YYYYMMDDTHHMMSS.fffZ-NNN.json`; lexical order matches export order.
fn archive_file_name(generated_at: DateTime<Utc>, seq: u32) -> String {
    format!("{}-{seq:03}.json", generated_at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Add `bytes` to the archive under the first free sequence number for
/// `generated_at`. Existing archive files are never overwritten.
fn write_archive(
    archive_dir: &Path,
    generated_at: DateTime<Utc>,
    bytes: &[u8],
) -> Result<PathBuf, AppError> {
    let mut tmp = NamedTempFile::new_in(archive_dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    for seq in 0..ARCHIVE_SEQ_LIMIT {
        let path = archive_dir.join(archive_file_name(generated_at, seq));
        match tmp.persist_noclobber(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => tmp = e.file,
            Err(e) => {
                return Err(AppError::ExportError(format!(
                    "Failed to archive snapshot {}: {}",
                    path.display(),
                    e.error
                )));
            }
        }
    }

    Err(AppError::ExportError(format!(
        "No free archive slot for {} in {}",
        generated_at.to_rfc3339(),
        archive_dir.display()
    )))
}

/// Write `bytes` to a temp file next to `path`, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let parent = path.parent().ok_or_else(|| {
        AppError::ExportError(format!("Export path {} has no parent", path.display()))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        AppError::ExportError(format!(
            "Failed to publish snapshot {}: {}",
            path.display(),
            e.error
        ))
    })?;
    Ok(())
}

fn archive_files(archive_dir: &Path) -> Result<Vec<PathBuf>, AppError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(archive_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Delete the oldest archive files beyond `keep`. Returns how many were removed.
fn prune_archive(archive_dir: &Path, keep: usize) -> Result<usize, AppError> {
    let files = archive_files(archive_dir)?;
    let excess = files.len().saturating_sub(keep);
    for path in &files[..excess] {
        std::fs::remove_file(path)?;
    }
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};
    use tempfile::TempDir;

    use super::*;

    fn setup(keep: usize) -> (TempDir, SnapshotExporter, SnapshotReader) {
        let tmp = TempDir::new().unwrap();
        let exporter = SnapshotExporter::new(ExportConfig {
            dir: tmp.path().to_path_buf(),
            archive_keep: keep,
        });
        let reader = SnapshotReader::new(tmp.path());
        (tmp, exporter, reader)
    }

    fn snapshot(dataset: &str, secs: i64, value: i64) -> ExportSnapshot {
        ExportSnapshot {
            dataset_name: dataset.to_string(),
            generated_at: Utc.with_ymd_and_hms(2026, 2, 1, 9, 30, 0).unwrap()
                + TimeDelta::seconds(secs),
            payload: serde_json::json!({"value": value}),
        }
    }

    #[test]
    fn test_export_then_read_latest() {
        let (_tmp, exporter, reader) = setup(10);
        let snap = snapshot("quotes", 0, 1);

        let path = exporter.export(&snap).unwrap();

        assert!(path.ends_with("quotes/latest.json"));
        assert_eq!(reader.read_latest("quotes").unwrap(), Some(snap));
    }

    #[test]
    fn test_export_replaces_previous_snapshot() {
        let (_tmp, exporter, reader) = setup(10);

        exporter.export(&snapshot("quotes", 0, 1)).unwrap();
        exporter.export(&snapshot("quotes", 60, 2)).unwrap();

        let latest = reader.read_latest("quotes").unwrap().unwrap();
        assert_eq!(latest.payload["value"], 2);
        assert_eq!(reader.archive("quotes").unwrap().len(), 2);
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let (_tmp, _exporter, reader) = setup(10);

        assert!(reader.read_latest("quotes").unwrap().is_none());
        assert!(reader.datasets().unwrap().is_empty());
        assert!(reader.archive("quotes").unwrap().is_empty());
    }

    #[test]
    fn test_interrupted_export_leaves_prior_snapshot_intact() {
        let (tmp, exporter, reader) = setup(10);
        let prior = snapshot("quotes", 0, 1);
        exporter.export(&prior).unwrap();

        // A writer killed mid-export leaves a partial temp file behind and
        // never reaches the rename.
        let dataset_dir = tmp.path().join("quotes");
        let mut partial = NamedTempFile::new_in(&dataset_dir).unwrap();
        partial.write_all(br#"{"dataset_name":"quotes","genera"#).unwrap();
        let _kept = partial.into_temp_path().keep().unwrap();

        assert_eq!(reader.read_latest("quotes").unwrap(), Some(prior));
    }

    #[test]
    fn test_corrupt_latest_is_treated_as_no_data() {
        let (tmp, _exporter, reader) = setup(10);
        let dataset_dir = tmp.path().join("quotes");
        std::fs::create_dir_all(&dataset_dir).unwrap();
        std::fs::write(dataset_dir.join("latest.json"), b"{ not json").unwrap();

        assert!(reader.read_latest("quotes").unwrap().is_none());
    }

    #[test]
    fn test_read_if_newer() {
        let (_tmp, exporter, reader) = setup(10);
        let snap = snapshot("quotes", 0, 1);
        exporter.export(&snap).unwrap();

        let before = snap.generated_at - TimeDelta::seconds(1);
        assert!(reader.read_if_newer("quotes", before).unwrap().is_some());
        assert!(
            reader
                .read_if_newer("quotes", snap.generated_at)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_archive_pruned_to_keep_newest() {
        let (_tmp, exporter, reader) = setup(2);

        for i in 0..4 {
            exporter.export(&snapshot("quotes", i * 60, i)).unwrap();
        }

        let archive = reader.archive("quotes").unwrap();
        assert_eq!(archive.len(), 2);
        let newest = std::fs::read(&archive[1]).unwrap();
        let newest: ExportSnapshot = serde_json::from_slice(&newest).unwrap();
        assert_eq!(newest.payload["value"], 3);
    }

    #[test]
    fn test_archive_file_names_sort_chronologically() {
        let t = Utc.with_ymd_and_hms(2026, 2, 1, 9, 30, 0).unwrap();
        assert_eq!(archive_file_name(t, 0), "20260201T093000.000Z-000.json");
        assert!(archive_file_name(t, 0) < archive_file_name(t, 1));
        assert!(archive_file_name(t, 7) < archive_file_name(t + TimeDelta::milliseconds(5), 0));
    }

    #[test]
    fn test_same_millisecond_exports_both_archived() {
        let (_tmp, exporter, reader) = setup(0);

        exporter.export(&snapshot("quotes", 0, 1)).unwrap();
        exporter.export(&snapshot("quotes", 0, 2)).unwrap();

        let archive = reader.archive("quotes").unwrap();
        assert_eq!(archive.len(), 2);
        let values: Vec<i64> = archive
            .iter()
            .map(|path| {
                let snap: ExportSnapshot =
                    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
                snap.payload["value"].as_i64().unwrap()
            })
            .collect();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(
            reader.read_latest("quotes").unwrap().unwrap().payload["value"],
            2
        );
    }

    #[test]
    fn test_rejects_path_like_dataset_names() {
        let (_tmp, exporter, reader) = setup(10);

        assert!(matches!(
            exporter.export(&snapshot("../escape", 0, 1)),
            Err(AppError::ExportError(_))
        ));
        assert!(reader.read_latest("a/b").is_err());
        assert!(reader.read_latest("").is_err());
    }

    #[test]
    fn test_export_records_groups_by_dataset() {
        let (_tmp, exporter, reader) = setup(10);
        let now = Utc::now();
        let record = |dataset: &str, ticker: &str| DerivedRecord {
            dataset: dataset.to_string(),
            ticker: ticker.to_string(),
            payload: serde_json::json!({"ticker": ticker}),
            computed_at: now,
        };
        let records = vec![
            record("quotes", "QQQ"),
            record("chains", "SPY"),
            record("quotes", "IWM"),
        ];

        let paths = exporter.export_records(&records, now).unwrap();

        assert_eq!(paths.len(), 2);
        assert_eq!(
            reader.datasets().unwrap(),
            vec!["chains".to_string(), "quotes".to_string()]
        );
        let quotes = reader.read_latest("quotes").unwrap().unwrap();
        assert_eq!(quotes.payload[0]["ticker"], "IWM");
        assert_eq!(quotes.payload[1]["ticker"], "QQQ");
    }
}
