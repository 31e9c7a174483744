//! Durable job storage for CREW: per-job directories holding the input
//! snapshot, the row ledger, the output snapshot and job metadata.
//!
//! Every artifact rewrite goes through a unique temp file followed by a
//! rename, so readers observe either the previous version or the new one and
//! never a torn write. Job creation stages the whole directory the same way:
//! files land in a hidden stage directory which is published with a single
//! rename, so a job either exists completely or not at all.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crew_core::{JobId, JobMeta, Row, RowStatus, Table};

pub const CRATE_NAME: &str = "crew-store";

const INPUT_FILE: &str = "input.csv";
const LEDGER_FILE: &str = "ledger.csv";
const OUTPUT_FILE: &str = "output.csv";
const META_FILE: &str = "meta.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} already exists")]
    AlreadyExists(JobId),
    #[error("job {id} artifact corrupt: {detail}")]
    Corrupt { id: JobId, detail: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Parses CSV bytes into a [`Table`]. Ragged records are padded or truncated
/// to the header width so downstream code can index cells positionally.
pub fn decode_table(bytes: &[u8]) -> anyhow::Result<Table> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let columns: Vec<String> = reader
        .headers()
        .context("reading csv header")?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for (position, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading csv record {position}"))?;
        let mut values: Vec<String> = record.iter().map(str::to_string).collect();
        values.resize(columns.len(), String::new());
        rows.push(Row::new(values));
    }

    Ok(Table::new(columns, rows))
}

/// Renders a [`Table`] as CSV bytes with a header row.
pub fn encode_table(table: &Table) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&table.columns)
        .context("writing csv header")?;
    for row in &table.rows {
        writer
            .write_record(&row.values)
            .context("writing csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv writer: {err}"))
}

fn encode_ledger(ledger: &[RowStatus]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for entry in ledger {
        writer.serialize(entry).context("writing ledger entry")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing ledger writer: {err}"))
}

fn decode_ledger(bytes: &[u8]) -> anyhow::Result<Vec<RowStatus>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut ledger = Vec::new();
    for (position, entry) in reader.deserialize().enumerate() {
        ledger.push(entry.with_context(|| format!("reading ledger entry {position}"))?);
    }
    Ok(ledger)
}

/// Filesystem-backed job store rooted at a data directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    /// Directory holding all artifacts of one job.
    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.jobs_dir().join(id.to_string())
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Creates the job directory with its input snapshot, seed ledger and
    /// metadata. All files are written into a hidden stage directory which is
    /// published with one rename; a crash mid-create leaves no visible job.
    pub async fn create_job(
        &self,
        id: &JobId,
        input: &Table,
        ledger: &[RowStatus],
    ) -> Result<JobMeta, StoreError> {
        let job_dir = self.job_dir(id);
        if fs::try_exists(&job_dir)
            .await
            .with_context(|| format!("checking job directory {}", job_dir.display()))?
        {
            return Err(StoreError::AlreadyExists(*id));
        }

        let input_bytes = encode_table(input)?;
        let ledger_bytes = encode_ledger(ledger)?;
        let meta = JobMeta {
            job_id: id.to_string(),
            created_at: Utc::now(),
            row_count: input.rows.len(),
            input_sha256: Self::sha256_hex(&input_bytes),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).context("serializing job metadata")?;

        let stage = self.jobs_dir().join(format!(".stage-{}", Uuid::new_v4()));
        fs::create_dir_all(&stage)
            .await
            .with_context(|| format!("creating stage directory {}", stage.display()))?;

        let staged: anyhow::Result<()> = async {
            fs::write(stage.join(INPUT_FILE), &input_bytes)
                .await
                .context("writing staged input snapshot")?;
            fs::write(stage.join(LEDGER_FILE), &ledger_bytes)
                .await
                .context("writing staged ledger")?;
            fs::write(stage.join(META_FILE), &meta_bytes)
                .await
                .context("writing staged metadata")?;
            fs::rename(&stage, &job_dir)
                .await
                .with_context(|| format!("publishing job directory {}", job_dir.display()))?;
            Ok(())
        }
        .await;

        if let Err(err) = staged {
            let _ = fs::remove_dir_all(&stage).await;
            return Err(StoreError::Io(err));
        }

        debug!(job_id = %id, rows = meta.row_count, "job directory published");
        Ok(meta)
    }

    pub async fn job_exists(&self, id: &JobId) -> Result<bool, StoreError> {
        let job_dir = self.job_dir(id);
        Ok(fs::try_exists(&job_dir)
            .await
            .with_context(|| format!("checking job directory {}", job_dir.display()))?)
    }

    pub async fn load_meta(&self, id: &JobId) -> Result<JobMeta, StoreError> {
        let bytes = self.read_artifact(id, META_FILE).await?;
        serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
            id: *id,
            detail: format!("{META_FILE}: {err}"),
        })
    }

    /// Loads the immutable input snapshot, verifying it against the checksum
    /// recorded at creation time.
    pub async fn load_input(&self, id: &JobId) -> Result<Table, StoreError> {
        let meta = self.load_meta(id).await?;
        let bytes = self.read_artifact(id, INPUT_FILE).await?;
        if Self::sha256_hex(&bytes) != meta.input_sha256 {
            return Err(StoreError::Corrupt {
                id: *id,
                detail: format!("{INPUT_FILE}: checksum mismatch"),
            });
        }
        decode_table(&bytes).map_err(|err| StoreError::Corrupt {
            id: *id,
            detail: format!("{INPUT_FILE}: {err:#}"),
        })
    }

    pub async fn load_ledger(&self, id: &JobId) -> Result<Vec<RowStatus>, StoreError> {
        let bytes = self.read_artifact(id, LEDGER_FILE).await?;
        decode_ledger(&bytes).map_err(|err| StoreError::Corrupt {
            id: *id,
            detail: format!("{LEDGER_FILE}: {err:#}"),
        })
    }

    pub async fn save_ledger(&self, id: &JobId, ledger: &[RowStatus]) -> Result<(), StoreError> {
        let bytes = encode_ledger(ledger)?;
        self.write_artifact(id, LEDGER_FILE, &bytes).await
    }

    pub async fn output_exists(&self, id: &JobId) -> Result<bool, StoreError> {
        let path = self.job_dir(id).join(OUTPUT_FILE);
        Ok(fs::try_exists(&path)
            .await
            .with_context(|| format!("checking output snapshot {}", path.display()))?)
    }

    /// Loads the most recent output snapshot. `NotFound` when no checkpoint
    /// has been written yet (or the job itself does not exist).
    pub async fn load_output(&self, id: &JobId) -> Result<Table, StoreError> {
        let bytes = self.read_artifact(id, OUTPUT_FILE).await?;
        decode_table(&bytes).map_err(|err| StoreError::Corrupt {
            id: *id,
            detail: format!("{OUTPUT_FILE}: {err:#}"),
        })
    }

    pub async fn save_output(&self, id: &JobId, table: &Table) -> Result<(), StoreError> {
        let bytes = encode_table(table)?;
        self.write_artifact(id, OUTPUT_FILE, &bytes).await
    }

    async fn read_artifact(&self, id: &JobId, file_name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.job_dir(id).join(file_name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(*id))
            }
            Err(err) => Err(StoreError::Io(
                anyhow::Error::new(err).context(format!("reading {}", path.display())),
            )),
        }
    }

    /// Replaces an artifact atomically: write a unique temp file in the job
    /// directory, flush, then rename over the final name.
    async fn write_artifact(
        &self,
        id: &JobId,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let job_dir = self.job_dir(id);
        if !fs::try_exists(&job_dir)
            .await
            .with_context(|| format!("checking job directory {}", job_dir.display()))?
        {
            return Err(StoreError::NotFound(*id));
        }

        let final_path = job_dir.join(file_name);
        let temp_path = job_dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io(anyhow::Error::new(err).context(format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                final_path.display()
            ))));
        }

        debug!(job_id = %id, artifact = file_name, bytes = bytes.len(), "artifact replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_table() -> Table {
        Table::new(
            vec!["sku".to_string(), "title".to_string(), "memory".to_string()],
            vec![
                Row::new(vec!["A-1".to_string(), "Laptop 14".to_string(), String::new()]),
                Row::new(vec![
                    "A-2".to_string(),
                    "Laptop, 15\" model".to_string(),
                    "16GB".to_string(),
                ]),
            ],
        )
    }

    fn seed_ledger(rows: usize) -> Vec<RowStatus> {
        (0..rows)
            .map(|index| RowStatus {
                index,
                processed: false,
                external_key: Some(format!("A-{}", index + 1)),
            })
            .collect()
    }

    #[test]
    fn checksums_are_stable() {
        let hash = JobStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn csv_round_trip_preserves_quoting_and_empty_cells() {
        let table = sample_table();
        let bytes = encode_table(&table).expect("encode");
        let decoded = decode_table(&bytes).expect("decode");
        assert_eq!(decoded, table);
        assert_eq!(decoded.cell(1, "title"), Some("Laptop, 15\" model"));
        assert_eq!(decoded.cell(0, "memory"), Some(""));
    }

    #[test]
    fn ragged_records_are_padded_to_header_width() {
        let bytes = b"sku,title,memory\nA-1,Laptop 14\nA-2,Desk,32GB,extra\n";
        let table = decode_table(bytes).expect("decode");
        assert_eq!(table.rows[0].values, vec!["A-1", "Laptop 14", ""]);
        assert_eq!(table.rows[1].values, vec!["A-2", "Desk", "32GB"]);
    }

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path());
        let id = JobId::new();
        let table = sample_table();
        let ledger = seed_ledger(table.row_count());

        let meta = store.create_job(&id, &table, &ledger).await.expect("create");
        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.job_id, id.to_string());

        assert!(store.job_exists(&id).await.expect("exists"));
        assert_eq!(store.load_input(&id).await.expect("input"), table);
        assert_eq!(store.load_ledger(&id).await.expect("ledger"), ledger);
        assert_eq!(store.load_meta(&id).await.expect("meta"), meta);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path());
        let id = JobId::new();
        let table = sample_table();
        let ledger = seed_ledger(table.row_count());

        store.create_job(&id, &table, &ledger).await.expect("first create");
        let second = store.create_job(&id, &table, &ledger).await;
        assert!(matches!(second, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn create_leaves_no_stage_directories_behind() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path());
        let id = JobId::new();
        let table = sample_table();
        store
            .create_job(&id, &table, &seed_ledger(table.row_count()))
            .await
            .expect("create");

        let entries: Vec<String> = std::fs::read_dir(dir.path().join("jobs"))
            .expect("read jobs dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec![id.to_string()]);
    }

    #[tokio::test]
    async fn ledger_rewrites_replace_the_previous_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path());
        let id = JobId::new();
        let table = sample_table();
        let mut ledger = seed_ledger(table.row_count());
        store.create_job(&id, &table, &ledger).await.expect("create");

        ledger[0].processed = true;
        store.save_ledger(&id, &ledger).await.expect("first rewrite");
        ledger[1].processed = true;
        store.save_ledger(&id, &ledger).await.expect("second rewrite");

        let loaded = store.load_ledger(&id).await.expect("load");
        assert!(loaded.iter().all(|entry| entry.processed));

        // Temp files must not accumulate in the job directory.
        let leftovers = std::fs::read_dir(store.job_dir(&id))
            .expect("read job dir")
            .filter(|entry| {
                entry
                    .as_ref()
                    .expect("entry")
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn output_snapshot_appears_only_after_first_save() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path());
        let id = JobId::new();
        let table = sample_table();
        store
            .create_job(&id, &table, &seed_ledger(table.row_count()))
            .await
            .expect("create");

        assert!(!store.output_exists(&id).await.expect("exists check"));
        assert!(matches!(
            store.load_output(&id).await,
            Err(StoreError::NotFound(_))
        ));

        store.save_output(&id, &table).await.expect("save output");
        assert!(store.output_exists(&id).await.expect("exists check"));
        assert_eq!(store.load_output(&id).await.expect("load output"), table);
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path());
        let id = JobId::new();

        assert!(!store.job_exists(&id).await.expect("exists check"));
        assert!(matches!(
            store.load_ledger(&id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.save_ledger(&id, &[]).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tampered_input_fails_checksum() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path());
        let id = JobId::new();
        let table = sample_table();
        store
            .create_job(&id, &table, &seed_ledger(table.row_count()))
            .await
            .expect("create");

        let input_path = store.job_dir(&id).join("input.csv");
        std::fs::write(&input_path, b"sku,title,memory\nX-9,Tampered,\n").expect("tamper");

        match store.load_input(&id).await {
            Err(StoreError::Corrupt { detail, .. }) => {
                assert!(detail.contains("checksum mismatch"))
            }
            other => panic!("expected checksum failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_ledger_reports_corrupt() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path());
        let id = JobId::new();
        let table = sample_table();
        store
            .create_job(&id, &table, &seed_ledger(table.row_count()))
            .await
            .expect("create");

        let ledger_path = store.job_dir(&id).join("ledger.csv");
        std::fs::write(&ledger_path, b"index,processed,external_key\nnope,maybe,\n")
            .expect("tamper");

        assert!(matches!(
            store.load_ledger(&id).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
