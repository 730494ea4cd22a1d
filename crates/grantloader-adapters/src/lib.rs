//! Source connector contracts + file-backed connectors that turn an export into a flat
//! record batch keyed by the canonical field names in `grantloader_core::fields`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use grantloader_core::{fields, parse_timestamp, record_value, Record, SourceProfile};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "grantloader-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("start bound {0:?} is not a recognized timestamp")]
    StartBound(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces the record batch for one run. `start` is the incremental lower bound, if any.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &str;

    async fn retrieve(&self, start: Option<&str>) -> Result<Vec<Record>, AdapterError>;
}

/// Header → canonical field mapping for one source profile.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    columns: HashMap<String, &'static str>,
}

impl ColumnMap {
    fn normalize(header: &str) -> String {
        header.trim().to_ascii_lowercase()
    }

    pub fn with(mut self, header: &str, field: &'static str) -> Self {
        self.columns.insert(Self::normalize(header), field);
        self
    }

    /// Canonical field for `header`; unmapped headers pass through unchanged.
    pub fn field_for(&self, header: &str) -> String {
        self.columns
            .get(&Self::normalize(header))
            .map(|f| f.to_string())
            .unwrap_or_else(|| header.trim().to_string())
    }

    pub fn for_profile(profile: SourceProfile) -> Self {
        match profile {
            SourceProfile::Coeus => Self::default(),
            SourceProfile::Spreadsheet => Self::default()
                .with("Grant Number", fields::GRANT_LOCAL_KEY)
                .with("Award Number", fields::GRANT_AWARD_NUMBER)
                .with("Grant Title", fields::GRANT_PROJECT_NAME)
                .with("Award Date", fields::GRANT_AWARD_DATE)
                .with("Start Date", fields::GRANT_START_DATE)
                .with("End Date", fields::GRANT_END_DATE)
                .with("Funder Code", fields::DIRECT_FUNDER_LOCAL_KEY)
                .with("Funder Name", fields::DIRECT_FUNDER_NAME)
                .with("Primary Funder Code", fields::PRIMARY_FUNDER_LOCAL_KEY)
                .with("Primary Funder Name", fields::PRIMARY_FUNDER_NAME)
                .with("First Name", fields::USER_FIRST_NAME)
                .with("Last Name", fields::USER_LAST_NAME)
                .with("Email", fields::USER_EMAIL)
                .with("Employee ID", fields::USER_EMPLOYEE_ID)
                .with("Institution ID", fields::USER_INSTITUTION_ID)
                .with("Login", fields::USER_LOGIN)
                .with("Role", fields::ABBREVIATED_ROLE),
        }
    }
}

/// Drops rows last updated before `start`. Rows with an unparsable timestamp are kept so
/// the reconciler can reject them.
fn filter_by_start(records: Vec<Record>, start: Option<&str>) -> Result<Vec<Record>, AdapterError> {
    let Some(start) = start.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(records);
    };
    let bound = parse_timestamp(start).map_err(|_| AdapterError::StartBound(start.to_string()))?;
    let before = records.len();
    let kept: Vec<Record> = records
        .into_iter()
        .filter(|record| {
            let stamps = [fields::GRANT_UPDATE_TIMESTAMP, fields::USER_UPDATE_TIMESTAMP]
                .into_iter()
                .filter_map(|f| record_value(record, f))
                .map(parse_timestamp)
                .collect::<Vec<_>>();
            stamps.is_empty()
                || stamps
                    .iter()
                    .any(|parsed| parsed.as_ref().map_or(true, |ts| *ts >= bound))
        })
        .collect();
    debug!(before, after = kept.len(), start, "applied start bound");
    Ok(kept)
}

#[derive(Debug, Clone)]
pub struct CsvConnector {
    source_id: String,
    path: PathBuf,
    columns: ColumnMap,
}

impl CsvConnector {
    pub fn new(path: impl Into<PathBuf>, profile: SourceProfile) -> Self {
        Self {
            source_id: format!("{}-csv", profile.as_str()),
            path: path.into(),
            columns: ColumnMap::for_profile(profile),
        }
    }

    pub fn with_columns(mut self, columns: ColumnMap) -> Self {
        self.columns = columns;
        self
    }

    pub fn read_records(&self) -> Result<Vec<Record>, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| self.columns.field_for(h))
            .collect();

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let record: Record = headers
                .iter()
                .zip(row.iter())
                .filter(|(_, value)| !value.is_empty())
                .map(|(field, value)| (field.clone(), value.to_string()))
                .collect();
            if !record.is_empty() {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SourceConnector for CsvConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn retrieve(&self, start: Option<&str>) -> Result<Vec<Record>, AdapterError> {
        filter_by_start(self.read_records()?, start)
    }
}

/// Reads a JSON array of flat objects. Nulls are treated as absent values.
#[derive(Debug, Clone)]
pub struct JsonBatchConnector {
    path: PathBuf,
}

impl JsonBatchConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn load_json_batch(path: impl AsRef<Path>) -> Result<Vec<Record>, AdapterError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let rows: Vec<serde_json::Map<String, JsonValue>> =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    rows.into_iter()
        .enumerate()
        .map(|(index, row)| {
            row.into_iter()
                .filter_map(|(key, value)| match value {
                    JsonValue::Null => None,
                    JsonValue::String(s) => Some(Ok((key, s))),
                    JsonValue::Number(n) => Some(Ok((key, n.to_string()))),
                    JsonValue::Bool(b) => Some(Ok((key, b.to_string()))),
                    other => Some(Err(AdapterError::Message(format!(
                        "row {index}: field {key} is not a scalar: {other}"
                    )))),
                })
                .collect::<Result<Record, AdapterError>>()
        })
        .collect()
}

#[async_trait]
impl SourceConnector for JsonBatchConnector {
    fn source_id(&self) -> &str {
        "json-batch"
    }

    async fn retrieve(&self, start: Option<&str>) -> Result<Vec<Record>, AdapterError> {
        filter_by_start(load_json_batch(&self.path)?, start)
    }
}

/// Picks a connector for an input file by extension.
pub fn connector_for_file(path: impl Into<PathBuf>, profile: SourceProfile) -> Box<dyn SourceConnector> {
    let path = path.into();
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        Box::new(JsonBatchConnector::new(path))
    } else {
        Box::new(CsvConnector::new(path, profile))
    }
}
