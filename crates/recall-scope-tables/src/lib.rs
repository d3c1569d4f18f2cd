//! NDJSON table export and import for lineage datasets and recall results.
//!
//! A table directory holds one NDJSON file per table plus `manifest.json`, which records the
//! sha256 digest and row count of every file. Imports refuse directories whose manifest does
//! not match the files on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use recall_scope_core::{
    ContaminationEvent, ExperimentReport, ExperimentSummary, LineageGraph, ProductionUnit,
    RecallResultRow,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const TABLE_SCHEMA_VERSION: i64 = 1;

pub const PRODUCTION_UNITS_TABLE: &str = "production_units.ndjson";
pub const CONTAMINATION_EVENTS_TABLE: &str = "contamination_events.ndjson";
pub const RECALL_RESULTS_TABLE: &str = "recall_results.ndjson";
pub const SUMMARY_FILE: &str = "summary.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableManifest {
    pub schema_version: i64,
    pub exported_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub files: Vec<TableFileDigest>,
}

impl TableManifest {
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&TableFileDigest> {
        self.files.iter().find(|file| file.path == path)
    }
}

/// Graph and contamination events rebuilt from a table directory.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub graph: LineageGraph,
    pub events: Vec<ContaminationEvent>,
}

/// Write the production-unit and contamination-event tables, and the recall results and
/// summary when `report` is given, then the manifest covering all of them.
///
/// # Errors
/// Returns an error when the directory or any table cannot be created, written, or
/// serialized.
pub fn export_tables(
    out_dir: &Path,
    graph: &LineageGraph,
    events: &[ContaminationEvent],
    report: Option<&ExperimentReport>,
    run_id: Option<&str>,
) -> Result<TableManifest> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create table directory {}", out_dir.display()))?;

    let mut files = vec![
        write_table(out_dir, PRODUCTION_UNITS_TABLE, graph.units())?,
        write_table(out_dir, CONTAMINATION_EVENTS_TABLE, events)?,
    ];

    if let Some(report) = report {
        files.push(write_table(out_dir, RECALL_RESULTS_TABLE, &report.rows)?);

        let summary_path = out_dir.join(SUMMARY_FILE);
        let summary_json = serde_json::to_vec_pretty(&report.summary)
            .context("failed to serialize experiment summary")?;
        fs::write(&summary_path, &summary_json).with_context(|| {
            format!("failed to write summary file {}", summary_path.display())
        })?;
        files.push(TableFileDigest {
            path: SUMMARY_FILE.to_string(),
            sha256: sha256_hex(&summary_json),
            records: 1,
        });
    }

    let manifest = TableManifest {
        schema_version: TABLE_SCHEMA_VERSION,
        exported_at: now_rfc3339()?,
        run_id: run_id.map(str::to_string),
        files,
    };

    let manifest_path = out_dir.join(MANIFEST_FILE);
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize table manifest")?;
    fs::write(&manifest_path, manifest_json)
        .with_context(|| format!("failed to write table manifest {}", manifest_path.display()))?;

    tracing::info!(
        dir = %out_dir.display(),
        files = manifest.files.len(),
        "exported tables"
    );
    Ok(manifest)
}

/// Read and validate a table directory, then rebuild its lineage graph and events.
///
/// # Errors
/// Returns an error when the manifest is missing, unsupported, or does not match the files,
/// when a row cannot be parsed, or when the units violate lineage invariants.
pub fn import_dataset(in_dir: &Path) -> Result<Dataset> {
    let manifest = read_table_manifest(in_dir)?;
    validate_table_manifest(
        in_dir,
        &manifest,
        &[PRODUCTION_UNITS_TABLE, CONTAMINATION_EVENTS_TABLE],
    )?;

    let units = read_table::<ProductionUnit>(in_dir, PRODUCTION_UNITS_TABLE)?;
    let events = read_table::<ContaminationEvent>(in_dir, CONTAMINATION_EVENTS_TABLE)?;
    let graph = LineageGraph::from_units(units)
        .with_context(|| format!("invalid lineage graph in {}", in_dir.display()))?;

    tracing::info!(
        dir = %in_dir.display(),
        units = graph.len(),
        events = events.len(),
        "imported dataset"
    );
    Ok(Dataset { graph, events })
}

/// Read the recall results and summary of a previously exported experiment.
///
/// # Errors
/// Returns an error when the directory holds no results or fails manifest validation.
pub fn import_report(in_dir: &Path) -> Result<ExperimentReport> {
    let manifest = read_table_manifest(in_dir)?;
    validate_table_manifest(in_dir, &manifest, &[RECALL_RESULTS_TABLE, SUMMARY_FILE])?;

    let rows = read_table::<RecallResultRow>(in_dir, RECALL_RESULTS_TABLE)?;
    let summary_path = in_dir.join(SUMMARY_FILE);
    let bytes = fs::read(&summary_path)
        .with_context(|| format!("failed to read summary file {}", summary_path.display()))?;
    let summary: ExperimentSummary = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse summary JSON {}", summary_path.display()))?;

    Ok(ExperimentReport { rows, summary })
}

/// # Errors
/// Returns an error when the manifest file cannot be read or parsed.
pub fn read_table_manifest(in_dir: &Path) -> Result<TableManifest> {
    let path = in_dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn write_table<T: Serialize>(out_dir: &Path, name: &str, rows: &[T]) -> Result<TableFileDigest> {
    let body = TableBody::render(rows)?;
    let path = out_dir.join(name);
    fs::write(&path, &body.bytes)
        .with_context(|| format!("failed to write table file {}", path.display()))?;
    tracing::debug!(table = name, records = body.records, "wrote table");
    Ok(TableFileDigest { path: name.to_string(), sha256: body.sha256(), records: body.records })
}

fn read_table<T: DeserializeOwned>(in_dir: &Path, name: &str) -> Result<Vec<T>> {
    let path = in_dir.join(name);
    let rows = TableBody::load(&path)?.rows(&path)?;
    tracing::debug!(table = name, records = rows.len(), "read table");
    Ok(rows)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Raw bytes of one NDJSON table; one JSON document per non-blank line.
struct TableBody {
    bytes: Vec<u8>,
    records: usize,
}

impl TableBody {
    fn render<T: Serialize>(rows: &[T]) -> Result<Self> {
        let mut bytes = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut bytes, row).context("failed to serialize table row")?;
            bytes.push(b'\n');
        }
        Ok(Self { bytes, records: rows.len() })
    }

    fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read table file {}", path.display()))?;
        let records = Self::lines(&bytes).count();
        Ok(Self { bytes, records })
    }

    fn lines(bytes: &[u8]) -> impl Iterator<Item = (usize, &[u8])> {
        bytes
            .split(|byte| *byte == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
    }

    fn sha256(&self) -> String {
        sha256_hex(&self.bytes)
    }

    fn rows<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        Self::lines(&self.bytes)
            .map(|(index, line)| {
                serde_json::from_slice(line).with_context(|| {
                    format!("failed to parse row {} of {}", index + 1, path.display())
                })
            })
            .collect()
    }
}

/// Digest and record count of a file named in the manifest. Non-NDJSON files count as one
/// record.
fn file_digest_and_records(path: &Path) -> Result<(String, usize)> {
    if path.extension().is_some_and(|extension| extension == "ndjson") {
        let body = TableBody::load(path)?;
        return Ok((body.sha256(), body.records));
    }
    let bytes =
        fs::read(path).with_context(|| format!("failed to read table file {}", path.display()))?;
    Ok((sha256_hex(&bytes), 1))
}

fn validate_table_manifest(
    in_dir: &Path,
    manifest: &TableManifest,
    required: &[&str],
) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > TABLE_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported table schema version {}; supported range is 1..={}",
            manifest.schema_version,
            TABLE_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &TableFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for name in required {
        if !by_path.contains_key(name) {
            return Err(anyhow!("manifest is missing required file entry: {name}"));
        }
    }

    for (name, expected) in by_path {
        let file_path = in_dir.join(name);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = file_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {name}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {name}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
