//! Staged documents: the JSON shape the scraper emits and the transformer
//! loads back into the relational store.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::dates;
use crate::store::{Store, StoreError};
use crate::types::{
    DailyEntry, DataSource, ExtractionResult, MonthBucket, ProcessingTimePercentiles, Snapshot,
    SummaryStats,
};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid document in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Metadata {
    pub fn for_url(url: &str) -> Self {
        Self {
            source: Some("web".to_string()),
            url: Some(url.to_string()),
            timestamp: Some(now_timestamp()),
            ..Default::default()
        }
    }

    pub fn for_file(path: &Path) -> Self {
        Self {
            source: Some("file".to_string()),
            filename: Some(path.display().to_string()),
            timestamp: Some(now_timestamp()),
            ..Default::default()
        }
    }

    /// Calendar date of `timestamp`, accepting RFC 3339, naive ISO 8601 and
    /// bare `YYYY-MM-DD`.
    pub fn timestamp_date(&self) -> Option<NaiveDate> {
        let raw = self.timestamp.as_deref()?.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.date_naive())
            .or_else(|_| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.date())
            })
            .or_else(|_| NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d"))
            .inspect_err(|e| log::warn!("Unparseable document timestamp {:?}: {}", raw, e))
            .ok()
    }

    fn timestamp_date_time(&self) -> Option<NaiveDateTime> {
        let raw = self.timestamp.as_deref()?.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.naive_utc())
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
    }
}

fn now_timestamp() -> String {
    Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    #[serde(default)]
    pub total_applications: u64,
    #[serde(default)]
    pub pending_applications: u64,
    #[serde(default)]
    pub pending_percentage: f64,
    #[serde(default)]
    pub changes_today: i64,
    #[serde(default)]
    pub completed_today: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentProcessingTimes {
    #[serde(rename = "30_percentile", default, skip_serializing_if = "Option::is_none")]
    pub p30: Option<u32>,
    #[serde(rename = "50_percentile", default, skip_serializing_if = "Option::is_none")]
    pub p50: Option<u32>,
    #[serde(rename = "80_percentile", default, skip_serializing_if = "Option::is_none")]
    pub p80: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub today_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient_days")]
    pub daily_progress: Vec<DailyEntry>,
    #[serde(default, deserialize_with = "lenient_months")]
    pub submission_months: Vec<MonthBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<DocumentSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_times: Option<DocumentProcessingTimes>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_daily_data: Option<String>,
}

// Invalid records are dropped one at a time instead of failing the document.
fn lenient_days<'de, D>(deserializer: D) -> Result<Vec<DailyEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values.iter().filter_map(DailyEntry::from_value).collect())
}

fn lenient_months<'de, D>(deserializer: D) -> Result<Vec<MonthBucket>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values.iter().filter_map(MonthBucket::from_value).collect())
}

impl StagedDocument {
    pub fn from_extraction(result: &ExtractionResult, metadata: Metadata) -> Self {
        Self {
            today_date: result.today_date.clone(),
            as_of: result.as_of,
            daily_progress: result
                .daily
                .as_ref()
                .map(|d| d.days.clone())
                .unwrap_or_default(),
            submission_months: result.months.clone().unwrap_or_default(),
            summary: result.summary.as_ref().map(|s| DocumentSummary {
                total_applications: s.total_applications,
                pending_applications: s.pending_applications,
                pending_percentage: s.pending_percentage,
                changes_today: s.changes_today,
                completed_today: s.completed_today,
            }),
            processing_times: result.percentiles.map(|p| DocumentProcessingTimes {
                p30: Some(p.p30),
                p50: Some(p.p50),
                p80: Some(p.p80),
            }),
            metadata,
            raw_daily_data: result.raw_daily_chunk.clone(),
        }
    }

    /// Identity used to skip documents that were already loaded.
    pub fn document_key(&self) -> String {
        match &self.metadata.timestamp {
            Some(timestamp) => timestamp.clone(),
            None => format!(
                "undated:{}",
                self.as_of
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        }
    }

    /// Record date: the stored as-of date, else the metadata timestamp's
    /// date, else `fallback`.
    pub fn record_date(&self, fallback: NaiveDate) -> NaiveDate {
        self.as_of
            .or_else(|| self.metadata.timestamp_date())
            .unwrap_or_else(|| {
                log::warn!("Document has no usable date, using {}", fallback);
                fallback
            })
    }

    pub fn to_snapshot(&self, fallback: NaiveDate) -> Snapshot {
        let record_date = self.record_date(fallback);

        let labels: Vec<_> = self
            .daily_progress
            .iter()
            .filter_map(|entry| match parse_document_day(&entry.label) {
                Some(label) => Some((label, entry.total)),
                None => {
                    log::error!("Error processing daily data {:?}", entry);
                    None
                }
            })
            .collect();

        let monthly = self
            .submission_months
            .iter()
            .flat_map(MonthBucket::records)
            .collect();

        let summary = self.summary.as_ref().map(|s| SummaryStats {
            record_date,
            total_applications: s.total_applications,
            pending_applications: s.pending_applications,
            pending_percentage: s.pending_percentage,
            changes_today: s.changes_today,
            completed_today: s.completed_today,
        });

        let processing_times = self.processing_times.and_then(|t| match (t.p30, t.p50, t.p80) {
            (Some(p30), Some(p50), Some(p80)) => Some(ProcessingTimePercentiles {
                as_of_date: record_date,
                p30,
                p50,
                p80,
            }),
            _ => {
                log::warn!("Skipping incomplete processing times: {:?}", t);
                None
            }
        });

        Snapshot {
            as_of: record_date,
            source: DataSource::Document,
            daily: dates::normalize_daily(&labels),
            monthly,
            summary,
            processing_times,
        }
    }

    pub fn write(&self, path: &Path, pretty: bool) -> Result<(), DocumentError> {
        let json = if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
        .map_err(|source| DocumentError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        fs::write(path, json).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Saved results to {}", path.display());
        Ok(())
    }
}

/// Day labels in documents are either page labels (`Mar/08/25 Sat`) or ISO
/// dates.
fn parse_document_day(label: &str) -> Option<dates::DayLabel> {
    dates::parse_day_label(label).ok().or_else(|| {
        let first = label.split_whitespace().next()?;
        let date = NaiveDate::parse_from_str(first, "%Y-%m-%d").ok()?;
        Some(dates::DayLabel {
            date,
            is_today: false,
            day_name: None,
        })
    })
}

/// Loads staged documents from a JSON file (one document or an array),
/// a JSON-lines file, or a directory of `.json` files. Documents are
/// returned oldest first by metadata timestamp. In a directory, files that
/// cannot be read or parsed are logged and skipped.
pub fn load_documents(path: &Path) -> Result<Vec<StagedDocument>, DocumentError> {
    let mut documents = if path.is_dir() {
        let entries = fs::read_dir(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut documents = Vec::new();
        for file in files {
            match load_file(&file) {
                Ok(loaded) => documents.extend(loaded),
                Err(e) => log::error!("Skipping {}: {}", file.display(), e),
            }
        }
        documents
    } else {
        load_file(path)?
    };

    documents.sort_by_key(|d| d.metadata.timestamp_date_time());
    log::info!("Loaded {} document(s) from {}", documents.len(), path.display());
    Ok(documents)
}

fn load_file(path: &Path) -> Result<Vec<StagedDocument>, DocumentError> {
    let text = fs::read_to_string(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_documents(&text).map_err(|source| DocumentError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_documents(text: &str) -> Result<Vec<StagedDocument>, serde_json::Error> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }

    match serde_json::from_str::<StagedDocument>(trimmed) {
        Ok(document) => Ok(vec![document]),
        Err(single) => {
            let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
            // JSON lines only if the first line is a complete value on its own
            let is_json_lines = lines.len() >= 2
                && serde_json::from_str::<Value>(lines[0]).is_ok_and(|v| v.is_object());
            if !is_json_lines {
                return Err(single);
            }
            lines.into_iter().map(serde_json::from_str).collect()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub processed: usize,
    pub skipped: usize,
}

/// Loads documents into the store. Without `all`, only the most recent
/// document is considered. Documents already recorded as processed are
/// skipped; each document is saved in its own transaction.
pub fn transform_documents(
    store: &mut Store,
    documents: &[StagedDocument],
    all: bool,
    fallback: NaiveDate,
) -> Result<TransformReport, DocumentError> {
    let selected: &[StagedDocument] = if all {
        documents
    } else {
        documents.last().map(std::slice::from_ref).unwrap_or_default()
    };

    let mut report = TransformReport::default();
    for document in selected {
        let key = document.document_key();
        if store.is_document_processed(&key)? {
            log::info!("Document from {} already processed, skipping", key);
            report.skipped += 1;
            continue;
        }

        let snapshot = document.to_snapshot(fallback);
        store.save_document(&key, &snapshot)?;
        report.processed += 1;
    }

    log::info!(
        "Processed {} document(s), skipped {}",
        report.processed,
        report.skipped
    );
    Ok(report)
}
