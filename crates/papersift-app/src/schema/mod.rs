//! Named extraction schemas and the detection helper. The registry is
//! read-only at runtime; a new schema is a code deployment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::services::enhance::EncodedImage;
use crate::services::vision::{SchemaDetection, VisionError, VisionExtractor};

/// A detection at or above this confidence keeps the detected schema;
/// anything strictly below falls back to `generic`.
pub const DETECTION_CONFIDENCE_FLOOR: f64 = 0.5;

pub const GENERIC_SCHEMA: &str = "generic";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown schema `{0}`")]
    NotFound(String),
    #[error(transparent)]
    Vision(#[from] VisionError),
}

/// Field types a schema can request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    Date,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub description: String,
}

impl FieldSpec {
    fn new(kind: FieldKind, description: &str) -> Self {
        Self {
            kind,
            description: description.to_string(),
        }
    }
}

/// A named, typed description of the fields an extractor should populate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub description: String,
    pub fields: BTreeMap<String, FieldSpec>,
    pub required_fields: BTreeSet<String>,
}

impl Schema {
    pub fn field_kind(&self, name: &str) -> Option<FieldKind> {
        self.fields.get(name).map(|spec| spec.kind)
    }

    /// JSON rendering embedded into the extraction prompt.
    pub fn to_prompt_json(&self) -> String {
        let fields: JsonValue = self
            .fields
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    json!({"type": spec.kind.to_string(), "description": spec.description}),
                )
            })
            .collect::<serde_json::Map<String, JsonValue>>()
            .into();
        json!({
            "name": self.name,
            "description": self.description,
            "fields": fields,
            "required_fields": self.required_fields,
        })
        .to_string()
    }
}

/// Read-mostly catalog of the built-in schemas.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaRegistry;

impl SchemaRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn list(&self) -> &'static [Schema] {
        builtin_schemas()
    }

    pub fn names(&self) -> Vec<&'static str> {
        builtin_schemas()
            .iter()
            .map(|schema| schema.name.as_str())
            .collect()
    }

    /// Case-folded lookup.
    pub fn get(&self, name: &str) -> Result<&'static Schema, SchemaError> {
        let wanted = name.trim().to_ascii_lowercase();
        builtin_schemas()
            .iter()
            .find(|schema| schema.name == wanted)
            .ok_or_else(|| SchemaError::NotFound(name.to_string()))
    }

    pub fn generic(&self) -> &'static Schema {
        builtin_schemas()
            .iter()
            .find(|schema| schema.name == GENERIC_SCHEMA)
            .expect("generic schema is always registered")
    }

    /// Run schema identification against a sample page.
    pub async fn detect(
        &self,
        vision: &dyn VisionExtractor,
        image: &EncodedImage,
        hint: Option<&str>,
    ) -> Result<SchemaDetection, SchemaError> {
        let names = self.names();
        Ok(vision.identify(image, &names, hint).await?)
    }

    /// Turn a detection into a concrete schema: confident hits on a known
    /// name win, everything else is `generic`.
    pub fn resolve_detection(&self, detection: &SchemaDetection) -> &'static Schema {
        if detection.confidence >= DETECTION_CONFIDENCE_FLOOR {
            if let Ok(schema) = self.get(&detection.schema_name) {
                return schema;
            }
        }
        self.generic()
    }
}

fn builtin_schemas() -> &'static [Schema] {
    static SCHEMAS: OnceLock<Vec<Schema>> = OnceLock::new();
    SCHEMAS.get_or_init(|| vec![invoice_schema(), receipt_schema(), generic_schema()])
}

fn invoice_schema() -> Schema {
    let mut fields = BTreeMap::new();
    fields.insert(
        "invoice_number".to_string(),
        FieldSpec::new(FieldKind::Text, "Invoice identifier as printed"),
    );
    fields.insert(
        "invoice_date".to_string(),
        FieldSpec::new(FieldKind::Date, "Issue date"),
    );
    fields.insert(
        "due_date".to_string(),
        FieldSpec::new(FieldKind::Date, "Payment due date"),
    );
    fields.insert(
        "vendor_name".to_string(),
        FieldSpec::new(FieldKind::Text, "Issuing party"),
    );
    fields.insert(
        "customer_name".to_string(),
        FieldSpec::new(FieldKind::Text, "Billed party"),
    );
    fields.insert(
        "currency".to_string(),
        FieldSpec::new(FieldKind::Text, "Currency code or symbol"),
    );
    fields.insert(
        "subtotal".to_string(),
        FieldSpec::new(FieldKind::Number, "Total before tax"),
    );
    fields.insert(
        "tax".to_string(),
        FieldSpec::new(FieldKind::Number, "Tax amount"),
    );
    fields.insert(
        "total".to_string(),
        FieldSpec::new(FieldKind::Number, "Grand total"),
    );
    fields.insert(
        "line_items".to_string(),
        FieldSpec::new(
            FieldKind::Array,
            "Line items with description, quantity, unit price, and amount",
        ),
    );
    Schema {
        name: "invoice".to_string(),
        description: "Commercial invoice".to_string(),
        fields,
        required_fields: ["invoice_number", "invoice_date", "total"]
            .into_iter()
            .map(str::to_string)
            .collect(),
    }
}

fn receipt_schema() -> Schema {
    let mut fields = BTreeMap::new();
    fields.insert(
        "merchant_name".to_string(),
        FieldSpec::new(FieldKind::Text, "Merchant or store name"),
    );
    fields.insert(
        "transaction_date".to_string(),
        FieldSpec::new(FieldKind::Date, "Purchase date"),
    );
    fields.insert(
        "payment_method".to_string(),
        FieldSpec::new(FieldKind::Text, "Cash, card, or other method"),
    );
    fields.insert(
        "total".to_string(),
        FieldSpec::new(FieldKind::Number, "Amount paid"),
    );
    fields.insert(
        "tax".to_string(),
        FieldSpec::new(FieldKind::Number, "Tax amount"),
    );
    fields.insert(
        "items".to_string(),
        FieldSpec::new(FieldKind::Array, "Purchased items with prices"),
    );
    Schema {
        name: "receipt".to_string(),
        description: "Point-of-sale receipt".to_string(),
        fields,
        required_fields: ["merchant_name", "total"]
            .into_iter()
            .map(str::to_string)
            .collect(),
    }
}

fn generic_schema() -> Schema {
    let mut fields = BTreeMap::new();
    fields.insert(
        "document_type".to_string(),
        FieldSpec::new(FieldKind::Text, "Best guess at the document kind"),
    );
    fields.insert(
        "title".to_string(),
        FieldSpec::new(FieldKind::Text, "Document title or heading"),
    );
    fields.insert(
        "date".to_string(),
        FieldSpec::new(FieldKind::Date, "Primary document date"),
    );
    fields.insert(
        "text_content".to_string(),
        FieldSpec::new(FieldKind::Text, "Full visible text"),
    );
    Schema {
        name: GENERIC_SCHEMA.to_string(),
        description: "Fallback schema for unrecognized documents".to_string(),
        fields,
        required_fields: BTreeSet::new(),
    }
}
