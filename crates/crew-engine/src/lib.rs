//! Job orchestration for CREW: job lifecycle, per-row processing, the
//! checkpointing coordinator and the status projection.
//!
//! The coordinator is the only writer of job state. Workers call the
//! collaborator and hand their outcome back; every ledger flip and snapshot
//! write happens here, through the store's atomic saves.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crew_core::{
    enriched_columns, EnrichmentResult, FieldMap, JobId, JobStatusView, Row, RowStatus, Table,
    ROW_INDEX_COLUMN,
};
use crew_enrich::{EnrichRequest, Enricher, HttpEnricherConfig, ResolveRequest, RetryPolicy};
use crew_store::{JobStore, StoreError};

pub const CRATE_NAME: &str = "crew-engine";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input table has no rows")]
    EmptyInput,
    #[error("job {id} state inconsistent: {detail}")]
    Inconsistent { id: JobId, detail: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn inconsistent(id: &JobId, detail: impl Into<String>) -> EngineError {
    EngineError::Inconsistent {
        id: *id,
        detail: detail.into(),
    }
}

/// Engine knobs, all overridable from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub worker_cap: usize,
    pub checkpoint_every: usize,
    pub key_column: String,
    pub collaborator_base_url: String,
    pub collaborator_token: Option<String>,
    pub collaborator_timeout_secs: u64,
    pub mapping_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("CREW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            worker_cap: std::env::var("CREW_WORKER_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            checkpoint_every: std::env::var("CREW_CHECKPOINT_EVERY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            key_column: std::env::var("CREW_KEY_COLUMN").unwrap_or_else(|_| "sku".to_string()),
            collaborator_base_url: std::env::var("CREW_COLLABORATOR_URL")
                .unwrap_or_else(|_| "http://localhost:9100".to_string()),
            collaborator_token: std::env::var("CREW_COLLABORATOR_TOKEN").ok(),
            collaborator_timeout_secs: std::env::var("CREW_COLLABORATOR_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            mapping_path: std::env::var("CREW_MAPPING_PATH").map(PathBuf::from).ok(),
        }
    }

    pub fn enricher_config(&self) -> HttpEnricherConfig {
        HttpEnricherConfig {
            base_url: self.collaborator_base_url.clone(),
            token: self.collaborator_token.clone(),
            timeout: Duration::from_secs(self.collaborator_timeout_secs),
        }
    }
}

/// Loads the merge-policy table from a YAML file, falling back to the
/// built-in catalog map when no path is configured.
pub fn load_field_map(path: Option<&Path>) -> anyhow::Result<FieldMap> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(FieldMap::default_catalog()),
    }
}

/// Creates a job from an input table: fresh id, verbatim input snapshot, one
/// unprocessed ledger entry per row. The store publishes the directory with a
/// single rename, so a crash mid-create leaves no visible job.
pub async fn create_job(
    store: &JobStore,
    input: &Table,
    key_column: &str,
) -> Result<JobId, EngineError> {
    if input.rows.is_empty() {
        return Err(EngineError::EmptyInput);
    }

    let key_position = input.column_position(key_column);
    let ledger: Vec<RowStatus> = input
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| RowStatus {
            index,
            processed: false,
            external_key: key_position
                .and_then(|pos| row.get(pos))
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
        })
        .collect();

    let id = JobId::new();
    let meta = store.create_job(&id, input, &ledger).await?;
    info!(job_id = %id, rows = meta.row_count, "job created");
    Ok(id)
}

/// Point-in-time progress for one job. Pure read; safe at any frequency.
pub async fn job_status(store: &JobStore, id: &JobId) -> Result<JobStatusView, EngineError> {
    let ledger = store.load_ledger(id).await?;
    let output_available = store.output_exists(id).await?;
    Ok(JobStatusView::derive(id, &ledger, output_available))
}

/// Result of processing one row: the merged output cells plus what it took
/// to get them.
#[derive(Debug, Clone)]
pub struct RowOutcome {
    pub index: usize,
    pub values: Vec<String>,
    pub attempts: usize,
    pub degraded: bool,
}

/// Processes a single row: builds the collaborator request, runs it through
/// the retry policy, merges the result per the field map, and resolves a
/// flagged inconsistency with at most one extra call. Never fails past its
/// boundary; every path yields a row.
pub struct RowProcessor {
    enricher: Arc<dyn Enricher>,
    retry: RetryPolicy,
    field_map: FieldMap,
}

impl RowProcessor {
    pub fn new(enricher: Arc<dyn Enricher>, retry: RetryPolicy, field_map: FieldMap) -> Self {
        Self {
            enricher,
            retry,
            field_map,
        }
    }

    pub fn field_map(&self) -> &FieldMap {
        &self.field_map
    }

    pub async fn process(&self, index: usize, columns: &[String], row: &Row) -> RowOutcome {
        let mut values = row.values.clone();
        values.resize(columns.len(), String::new());
        let warning_position = columns
            .iter()
            .position(|column| column == &self.field_map.warning_column);

        let mut record = BTreeMap::new();
        let mut missing_columns = Vec::new();
        for (position, column) in columns.iter().enumerate() {
            if Some(position) == warning_position {
                continue;
            }
            let cell = values[position].as_str();
            if Row::is_empty_cell(cell) {
                missing_columns.push(column.clone());
            } else {
                record.insert(column.clone(), cell.to_string());
            }
        }

        let request = EnrichRequest {
            row_index: index,
            record: record.clone(),
            missing_columns,
        };
        let attempted = self.retry.attempt(|| self.enricher.enrich(&request)).await;

        match attempted.outcome {
            Ok(result) => {
                self.merge(columns, &mut values, &result);
                let mut warning = result
                    .warning
                    .as_deref()
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(str::to_string);

                if let Some(conflict) = result
                    .conflict
                    .as_deref()
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                {
                    match self.resolve_once(index, &record, conflict, columns, &mut values).await {
                        Some(resolved) => warning = Some(resolved),
                        None => warning = warning.or_else(|| Some(conflict.to_string())),
                    }
                }

                if let (Some(position), Some(text)) = (warning_position, warning.as_deref()) {
                    values[position] = text.to_string();
                }
                RowOutcome {
                    index,
                    values,
                    attempts: attempted.attempts,
                    degraded: false,
                }
            }
            Err(err) => {
                warn!(row = index, attempts = attempted.attempts, error = %err, "enrichment exhausted, degrading row");
                if let Some(position) = warning_position {
                    values[position] =
                        format!("enrichment failed after {} attempts: {err}", attempted.attempts);
                }
                RowOutcome {
                    index,
                    values,
                    attempts: attempted.attempts,
                    degraded: true,
                }
            }
        }
    }

    /// Asymmetric merge: the primary column always takes the collaborator's
    /// value; derived features overwrite only empty cells unless their rule
    /// is flagged always-refresh; missing-value fills never overwrite.
    fn merge(&self, columns: &[String], values: &mut [String], result: &EnrichmentResult) {
        if let Some(primary) = result
            .primary
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            if let Some(position) = columns
                .iter()
                .position(|column| column == &self.field_map.primary_column)
            {
                values[position] = primary.to_string();
            }
        }

        for (feature, value) in &result.derived {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let Some(rule) = self.field_map.rule_for(feature) else {
                debug!(feature, "no field rule for derived feature, ignoring");
                continue;
            };
            let Some(position) = columns.iter().position(|column| column == &rule.column) else {
                continue;
            };
            if rule.always_refresh || Row::is_empty_cell(&values[position]) {
                values[position] = value.to_string();
            }
        }

        for (column, value) in &result.missing_values {
            let value = value.trim();
            if value.is_empty() || column == &self.field_map.warning_column {
                continue;
            }
            let Some(position) = columns.iter().position(|name| name == column) else {
                continue;
            };
            if Row::is_empty_cell(&values[position]) {
                values[position] = value.to_string();
            }
        }
    }

    /// One resolution call, not retried. Returns the downgraded warning only
    /// when a usable correction landed; any other shape leaves the caller's
    /// warning untouched.
    async fn resolve_once(
        &self,
        index: usize,
        record: &BTreeMap<String, String>,
        conflict: &str,
        columns: &[String],
        values: &mut [String],
    ) -> Option<String> {
        let request = ResolveRequest {
            row_index: index,
            record: record.clone(),
            conflict: conflict.to_string(),
        };
        match self.enricher.resolve_conflict(&request).await {
            Ok(Some(resolution)) => {
                let value = resolution.value.trim();
                if value.is_empty() {
                    return None;
                }
                let column = if let Some(rule) = self.field_map.rule_for(&resolution.feature) {
                    rule.column.clone()
                } else if resolution
                    .feature
                    .eq_ignore_ascii_case(&self.field_map.primary_column)
                {
                    self.field_map.primary_column.clone()
                } else {
                    debug!(row = index, feature = %resolution.feature, "resolution names unmapped feature, keeping warning");
                    return None;
                };
                let position = columns.iter().position(|name| name == &column)?;
                values[position] = value.to_string();
                debug!(row = index, %column, "conflict resolved");
                Some(format!("resolved: {column} = {value}"))
            }
            Ok(None) => None,
            Err(err) => {
                warn!(row = index, error = %err, "conflict resolution call failed, keeping warning");
                None
            }
        }
    }
}

/// What one coordinator invocation did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_rows: usize,
    pub rows_processed: usize,
    pub degraded_rows: usize,
    pub checkpoints_written: usize,
    pub complete: bool,
}

/// Drives one job to completion: scan the ledger for remaining rows, fan
/// them out through a bounded worker pool, flip entries as completions land,
/// checkpoint every N rows and once at the end. Invoking it on an
/// already-complete job is a no-op.
pub struct Coordinator {
    store: JobStore,
    processor: Arc<RowProcessor>,
    worker_cap: usize,
    checkpoint_every: usize,
}

impl Coordinator {
    pub fn new(
        store: JobStore,
        processor: Arc<RowProcessor>,
        worker_cap: usize,
        checkpoint_every: usize,
    ) -> Self {
        Self {
            store,
            processor,
            worker_cap: worker_cap.max(1),
            checkpoint_every: checkpoint_every.max(1),
        }
    }

    pub async fn run(&self, id: &JobId) -> Result<RunSummary, EngineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let input = self.store.load_input(id).await?;
        let mut ledger = self.store.load_ledger(id).await?;
        if ledger.len() != input.row_count() {
            return Err(inconsistent(
                id,
                format!(
                    "ledger has {} entries for {} input rows",
                    ledger.len(),
                    input.row_count()
                ),
            ));
        }
        // Entries are written in input order; a mismatched index means the
        // ledger was tampered with or torn, and rules out duplicates too.
        for (position, entry) in ledger.iter().enumerate() {
            if entry.index != position {
                return Err(inconsistent(
                    id,
                    format!("ledger entry {position} carries index {}", entry.index),
                ));
            }
        }

        let columns = Arc::new(enriched_columns(
            &input.columns,
            &self.processor.field_map().warning_column,
        ));
        let mut results = self.scan(id, &ledger, &columns).await?;
        let remaining: Vec<usize> = ledger
            .iter()
            .filter(|entry| !entry.processed)
            .map(|entry| entry.index)
            .collect();

        info!(job_id = %id, %run_id, total = ledger.len(), remaining = remaining.len(), "coordinator run starting");

        let mut rows_processed = 0usize;
        let mut degraded_rows = 0usize;
        let mut checkpoints_written = 0usize;

        if !remaining.is_empty() {
            let semaphore = Arc::new(Semaphore::new(self.worker_cap));
            let mut tasks: JoinSet<RowOutcome> = JoinSet::new();
            let mut task_rows: HashMap<tokio::task::Id, usize> = HashMap::new();

            for index in remaining {
                let semaphore = semaphore.clone();
                let processor = self.processor.clone();
                let columns = columns.clone();
                let row = input.rows[index].clone();
                let handle = tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore not closed");
                    processor.process(index, &columns, &row).await
                });
                task_rows.insert(handle.id(), index);
            }

            let mut since_checkpoint = 0usize;
            while let Some(joined) = tasks.join_next_with_id().await {
                let outcome = match joined {
                    Ok((_, outcome)) => outcome,
                    Err(join_err) => {
                        // A panicking worker degrades exactly its own row.
                        let index = *task_rows
                            .get(&join_err.id())
                            .expect("every task id is registered");
                        warn!(job_id = %id, row = index, error = %join_err, "row worker failed, degrading row");
                        let mut values = input.rows[index].values.clone();
                        values.resize(columns.len(), String::new());
                        if let Some(position) = columns
                            .iter()
                            .position(|c| c == &self.processor.field_map().warning_column)
                        {
                            values[position] = format!("row worker failed: {join_err}");
                        }
                        RowOutcome {
                            index,
                            values,
                            attempts: 0,
                            degraded: true,
                        }
                    }
                };

                if outcome.degraded {
                    degraded_rows += 1;
                }
                results.insert(outcome.index, outcome.values);
                ledger[outcome.index].processed = true;
                rows_processed += 1;
                since_checkpoint += 1;

                if since_checkpoint >= self.checkpoint_every {
                    self.checkpoint(id, &ledger, &columns, &results).await?;
                    checkpoints_written += 1;
                    since_checkpoint = 0;
                }
            }

            if since_checkpoint > 0 {
                self.checkpoint(id, &ledger, &columns, &results).await?;
                checkpoints_written += 1;
            }
        }

        let complete = ledger.iter().all(|entry| entry.processed);
        let summary = RunSummary {
            run_id,
            job_id: id.to_string(),
            started_at,
            finished_at: Utc::now(),
            total_rows: ledger.len(),
            rows_processed,
            degraded_rows,
            checkpoints_written,
            complete,
        };
        info!(
            job_id = %id,
            %run_id,
            rows = summary.rows_processed,
            degraded = summary.degraded_rows,
            checkpoints = summary.checkpoints_written,
            complete = summary.complete,
            "coordinator run finished"
        );
        Ok(summary)
    }

    /// Rebuilds the in-memory results map from the persisted snapshot. The
    /// ledger is authoritative: output rows not flipped there are dropped
    /// and redone; a flipped entry with no output row means a completed
    /// result was lost, which is corruption.
    async fn scan(
        &self,
        id: &JobId,
        ledger: &[RowStatus],
        columns: &[String],
    ) -> Result<BTreeMap<usize, Vec<String>>, EngineError> {
        let mut results = BTreeMap::new();
        if self.store.output_exists(id).await? {
            let output = self.store.load_output(id).await?;
            let index_position = output
                .column_position(ROW_INDEX_COLUMN)
                .ok_or_else(|| inconsistent(id, "output snapshot missing row_index column"))?;
            for row in &output.rows {
                let index: usize = row
                    .get(index_position)
                    .unwrap_or_default()
                    .parse()
                    .map_err(|_| inconsistent(id, "unparsable row_index in output snapshot"))?;
                if index >= ledger.len() {
                    return Err(inconsistent(
                        id,
                        format!("output row_index {index} out of range"),
                    ));
                }
                let mut values: Vec<String> = row
                    .values
                    .iter()
                    .enumerate()
                    .filter(|(position, _)| *position != index_position)
                    .map(|(_, value)| value.clone())
                    .collect();
                values.resize(columns.len(), String::new());
                results.insert(index, values);
            }
        }

        let dropped = results.len();
        results.retain(|index, _| ledger[*index].processed);
        let dropped = dropped - results.len();
        if dropped > 0 {
            debug!(job_id = %id, rows = dropped, "discarding un-flipped output rows for redo");
        }

        for entry in ledger {
            if entry.processed && !results.contains_key(&entry.index) {
                return Err(inconsistent(
                    id,
                    format!(
                        "row {} is marked processed but missing from the output snapshot",
                        entry.index
                    ),
                ));
            }
        }
        Ok(results)
    }

    /// Paired atomic write: output snapshot first, then the ledger. A crash
    /// between the two renames can only produce redone work, never loss.
    async fn checkpoint(
        &self,
        id: &JobId,
        ledger: &[RowStatus],
        columns: &[String],
        results: &BTreeMap<usize, Vec<String>>,
    ) -> Result<(), EngineError> {
        let snapshot = snapshot_table(columns, results);
        self.store.save_output(id, &snapshot).await?;
        self.store.save_ledger(id, ledger).await?;
        debug!(job_id = %id, rows = snapshot.row_count(), "checkpoint written");
        Ok(())
    }
}

/// Materializes the results map as the output snapshot: a leading row_index
/// column, then the enriched columns, rows in ascending index order.
fn snapshot_table(columns: &[String], results: &BTreeMap<usize, Vec<String>>) -> Table {
    let mut snapshot_columns = Vec::with_capacity(columns.len() + 1);
    snapshot_columns.push(ROW_INDEX_COLUMN.to_string());
    snapshot_columns.extend(columns.iter().cloned());

    let rows = results
        .iter()
        .map(|(index, values)| {
            let mut cells = Vec::with_capacity(values.len() + 1);
            cells.push(index.to_string());
            cells.extend(values.iter().cloned());
            Row::new(cells)
        })
        .collect();
    Table::new(snapshot_columns, rows)
}

/// In-process registry of jobs with an active coordinator run. Replaces any
/// process-wide "busy" flag: at most one run per job id, enforced with an
/// RAII guard.
#[derive(Debug, Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<Mutex<HashSet<JobId>>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the job for a run. `None` when a run is already active.
    pub fn try_begin(&self, id: JobId) -> Option<RunGuard> {
        let mut active = self.inner.lock().expect("active runs lock");
        if !active.insert(id) {
            return None;
        }
        Some(RunGuard {
            id,
            runs: self.inner.clone(),
        })
    }

    pub fn is_active(&self, id: &JobId) -> bool {
        self.inner.lock().expect("active runs lock").contains(id)
    }
}

/// Releases the job's run slot on drop, including on panic.
#[derive(Debug)]
pub struct RunGuard {
    id: JobId,
    runs: Arc<Mutex<HashSet<JobId>>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.lock().expect("active runs lock").remove(&self.id);
    }
}
