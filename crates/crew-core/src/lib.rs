//! Core domain types for CREW (Checkpointed Row Enrichment Workers):
//! tabular snapshots, the per-row ledger, progress views, and the field map
//! that governs how collaborator output merges into a row.
//!
//! Everything here is plain data plus pure helpers. IO lives in `crew-store`,
//! collaborator traffic in `crew-enrich`, and orchestration in `crew-engine`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crew-core";

/// Column appended to enriched output when the input has no warning column.
pub const WARNING_COLUMN: &str = "warning";

/// Leading column of the output snapshot carrying each row's input index.
/// The index is the correlation key between input, ledger and output; the
/// snapshot materializes it so a resumed run can reseed without guessing.
pub const ROW_INDEX_COLUMN: &str = "row_index";

/// Opaque job identifier. Renders as a 32-char lowercase hex string and is
/// the job's directory name on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s).map(Self)
    }
}

/// One row of a table. Cell order follows the owning table's column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<String>,
}

impl Row {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    pub fn get(&self, position: usize) -> Option<&str> {
        self.values.get(position).map(String::as_str)
    }

    /// Blank or whitespace-only cells count as empty for merge purposes.
    pub fn is_empty_cell(value: &str) -> bool {
        value.trim().is_empty()
    }
}

/// An in-memory table: named columns plus rows in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let position = self.column_position(column)?;
        self.rows.get(row)?.get(position)
    }
}

/// Ledger entry for one input row. `index` is the row's position in the
/// input snapshot; `processed` flips to true exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowStatus {
    pub index: usize,
    pub processed: bool,
    /// Value of the configured key column, kept for operator-facing lookups.
    pub external_key: Option<String>,
}

/// Job metadata persisted at creation time and never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
    /// Checksum of the input snapshot bytes, verified on every load.
    pub input_sha256: String,
}

/// Point-in-time progress projection derived from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub total: usize,
    pub processed: usize,
    pub remaining: usize,
    /// Percent complete rounded to one decimal place; 0.0 for an empty ledger.
    pub percentage_complete: f64,
    pub is_complete: bool,
    pub output_available: bool,
}

impl JobStatusView {
    pub fn derive(job_id: &JobId, ledger: &[RowStatus], output_available: bool) -> Self {
        let total = ledger.len();
        let processed = ledger.iter().filter(|entry| entry.processed).count();
        let percentage_complete = if total == 0 {
            0.0
        } else {
            (processed as f64 * 1000.0 / total as f64).round() / 10.0
        };
        Self {
            job_id: job_id.to_string(),
            total,
            processed,
            remaining: total - processed,
            percentage_complete,
            is_complete: total > 0 && processed == total,
            output_available,
        }
    }
}

/// Collaborator output for a single row, already parsed off the wire.
///
/// The struct is transient: the row processor folds it into output columns
/// immediately and nothing downstream ever sees it again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    /// Replacement for the primary column; always wins when present.
    #[serde(default)]
    pub primary: Option<String>,
    /// Derived feature values keyed by canonical feature name.
    #[serde(default)]
    pub derived: BTreeMap<String, String>,
    /// Quality note from the collaborator, surfaced in the warning column.
    #[serde(default)]
    pub warning: Option<String>,
    /// Fill-in values for columns the request reported as empty.
    #[serde(default)]
    pub missing_values: BTreeMap<String, String>,
    /// Description of a cross-field inconsistency the collaborator flagged.
    #[serde(default)]
    pub conflict: Option<String>,
}

impl EnrichmentResult {
    /// True when the payload carries no usable values at all.
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.derived.is_empty() && self.missing_values.is_empty()
    }
}

/// Answer to a conflict-resolution follow-up call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub feature: String,
    pub value: String,
    #[serde(default)]
    pub justification: String,
}

/// How one canonical feature lands in the output table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub feature: String,
    pub column: String,
    /// Refresh-always features overwrite even a populated cell.
    #[serde(default)]
    pub always_refresh: bool,
}

/// Declarative merge policy: which collaborator features map to which
/// columns, and which of them may overwrite existing data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    #[serde(default = "default_map_version")]
    pub version: u32,
    /// Column the collaborator's `primary` value always overwrites.
    pub primary_column: String,
    #[serde(default = "default_warning_column")]
    pub warning_column: String,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

fn default_map_version() -> u32 {
    1
}

fn default_warning_column() -> String {
    WARNING_COLUMN.to_string()
}

impl FieldMap {
    /// Looks up the rule for a feature name, case-insensitively.
    pub fn rule_for(&self, feature: &str) -> Option<&FieldRule> {
        self.fields
            .iter()
            .find(|rule| rule.feature.eq_ignore_ascii_case(feature))
    }

    /// Built-in catalog for product listings. Only the processor is marked
    /// refresh-always; everything else fills empty cells and leaves curated
    /// data alone.
    pub fn default_catalog() -> Self {
        let fill = |feature: &str| FieldRule {
            feature: feature.to_string(),
            column: feature.to_string(),
            always_refresh: false,
        };
        Self {
            version: 1,
            primary_column: "title".to_string(),
            warning_column: WARNING_COLUMN.to_string(),
            fields: vec![
                FieldRule {
                    feature: "processor".to_string(),
                    column: "processor".to_string(),
                    always_refresh: true,
                },
                fill("memory"),
                fill("storage"),
                fill("graphics"),
                fill("operating_system"),
                fill("screen_size"),
                fill("color"),
                fill("capacity"),
                fill("power"),
            ],
        }
    }
}

/// Output column set for a job: the input columns, plus the warning column
/// when the input does not already carry one.
pub fn enriched_columns(input_columns: &[String], warning_column: &str) -> Vec<String> {
    let mut columns = input_columns.to_vec();
    if !columns.iter().any(|column| column == warning_column) {
        columns.push(warning_column.to_string());
    }
    columns
}
