//! The document data model: the persistent record, its status machine, and
//! the tagged value union used for extracted fields.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use strum::{AsRefStr, Display, EnumString};

/// Sentinel the extractor uses for fields it could not read. Required fields
/// missing after the merge are filled with this at confidence zero.
pub const MISSING_FIELD_SENTINEL: &str = "N/A";

const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

/// Lifecycle state of a document. `Pending → Processing → {Completed, Failed}`;
/// an explicit reprocess request returns a terminal document to `Pending`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }
}

/// Extracted value union. Serialized to and from the metadata store as
/// canonical JSON text; dates render as ISO-8601 strings and are re-detected
/// on the way back in.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Bool(bool),
    Array(Vec<FieldValue>),
    Object(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn missing() -> Self {
        FieldValue::Text(MISSING_FIELD_SENTINEL.to_string())
    }

    pub fn is_missing_sentinel(&self) -> bool {
        matches!(self, FieldValue::Text(text) if text == MISSING_FIELD_SENTINEL)
    }

    /// Convert a model-produced JSON value into the union. `null` maps to the
    /// missing sentinel; strings that parse as ISO dates become dates.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => FieldValue::missing(),
            JsonValue::Bool(flag) => FieldValue::Bool(*flag),
            JsonValue::Number(number) => {
                FieldValue::Number(number.as_f64().unwrap_or(f64::NAN))
            }
            JsonValue::String(text) => match NaiveDate::parse_from_str(text, ISO_DATE_FORMAT) {
                Ok(date) => FieldValue::Date(date),
                Err(_) => FieldValue::Text(text.clone()),
            },
            JsonValue::Array(items) => {
                FieldValue::Array(items.iter().map(FieldValue::from_json).collect())
            }
            JsonValue::Object(entries) => FieldValue::Object(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), FieldValue::from_json(item)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Text(text) => JsonValue::String(text.clone()),
            FieldValue::Number(value) => JsonNumber::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Date(date) => {
                JsonValue::String(date.format(ISO_DATE_FORMAT).to_string())
            }
            FieldValue::Bool(flag) => JsonValue::Bool(*flag),
            FieldValue::Array(items) => {
                JsonValue::Array(items.iter().map(FieldValue::to_json).collect())
            }
            FieldValue::Object(entries) => {
                let mut map = JsonMap::new();
                for (key, item) in entries {
                    map.insert(key.clone(), item.to_json());
                }
                JsonValue::Object(map)
            }
        }
    }

    /// Flat textual rendering used by spreadsheet cells for compound values.
    pub fn to_cell_text(&self) -> String {
        match self {
            FieldValue::Text(text) => text.clone(),
            other => other.to_json().to_string(),
        }
    }
}

pub type FieldMap = BTreeMap<String, FieldValue>;
pub type ConfidenceMap = BTreeMap<String, f64>;

/// Encode a field map as canonical JSON text for the metadata store.
pub fn fields_to_json_text(fields: &FieldMap) -> String {
    let mut map = JsonMap::new();
    for (key, value) in fields {
        map.insert(key.clone(), value.to_json());
    }
    JsonValue::Object(map).to_string()
}

/// Decode a canonical JSON text back into a field map. Non-object payloads
/// yield an empty map; the store never writes them.
pub fn fields_from_json_text(text: &str) -> FieldMap {
    match serde_json::from_str::<JsonValue>(text) {
        Ok(JsonValue::Object(entries)) => entries
            .iter()
            .map(|(key, value)| (key.clone(), FieldValue::from_json(value)))
            .collect(),
        _ => FieldMap::new(),
    }
}

/// How the pipeline chooses an extraction schema for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SchemaSelector {
    #[default]
    Auto,
    Named(String),
}

/// Options attached to a processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessOptions {
    pub schema: SchemaSelector,
    #[serde(default)]
    pub template_mode: bool,
}

/// How a single page made it through extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PageStatus {
    Vision,
    OcrFallback,
    Error,
}

/// Transient per-page extraction outcome; aggregated into the document's
/// extracted fields on success, never persisted on its own.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub index: u32,
    pub status: PageStatus,
    pub fields: FieldMap,
    pub confidence: ConfidenceMap,
    pub error: Option<String>,
}

impl PageResult {
    pub fn error(index: u32, message: impl Into<String>) -> Self {
        Self {
            index,
            status: PageStatus::Error,
            fields: FieldMap::new(),
            confidence: ConfidenceMap::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == PageStatus::Error
    }
}

/// Timings and provenance recorded alongside a completed or failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessingMetadata {
    pub duration_seconds: f64,
    pub model: String,
    pub worker: String,
    /// Per-page outcome keyed by 1-based page number.
    pub page_statuses: BTreeMap<u32, PageStatus>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub finished_at_ms: i64,
}

/// The persistent record of one uploaded PDF and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    /// Lowercase BLAKE3 hex of the stored bytes; unique across documents.
    pub content_hash: String,
    pub original_filename: String,
    pub stored_filename: String,
    pub file_size: u64,
    /// Known after rasterization; zero until then.
    #[serde(default)]
    pub page_count: u32,
    pub status: DocumentStatus,
    pub progress: f64,
    /// Bumped by every `StartProcessing`; worker writes are conditional on it.
    #[serde(default)]
    pub attempt: u32,
    /// Canonical JSON text of the extracted field map.
    #[serde(default)]
    pub extracted_fields: Option<String>,
    #[serde(default)]
    pub confidence_scores: Option<ConfidenceMap>,
    #[serde(default)]
    pub schema_used: Option<String>,
    #[serde(default)]
    pub processing: Option<ProcessingMetadata>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub blob_cid: String,
    #[serde(default)]
    pub current_worker: Option<String>,
    #[serde(default)]
    pub worker_heartbeat_ms: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Document {
    pub fn extracted_field_map(&self) -> Option<FieldMap> {
        self.extracted_fields
            .as_deref()
            .map(fields_from_json_text)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            document_id: self.id,
            status: self.status,
            progress: self.progress,
            page_count: self.page_count,
            extracted_data: self
                .extracted_fields
                .as_deref()
                .and_then(|text| serde_json::from_str(text).ok()),
            confidence_scores: self.confidence_scores.clone(),
            error_message: self.error_message.clone(),
            processing_metadata: self.processing.clone(),
        }
    }
}

/// The status shape clients poll or stream. Field names are part of the API
/// contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub document_id: i64,
    pub status: DocumentStatus,
    pub progress: f64,
    pub page_count: u32,
    pub extracted_data: Option<JsonValue>,
    pub confidence_scores: Option<ConfidenceMap>,
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_metadata: Option<ProcessingMetadata>,
}
