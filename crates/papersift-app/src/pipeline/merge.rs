//! Merge policy: combining per-page extraction results into one document
//! record. Pure, fully deterministic, and ordered by page index.

use crate::document::{ConfidenceMap, FieldMap, FieldValue, PageResult};
use crate::schema::{FieldKind, Schema};

/// Merge page results according to the schema's field kinds:
/// - scalars keep the highest-confidence value, earliest page winning ties;
/// - arrays concatenate preserving page order;
/// - objects merge recursively under the same rules;
/// - required fields that never showed up are filled with the `"N/A"`
///   sentinel at confidence zero.
pub fn merge_pages(schema: &Schema, pages: &[PageResult]) -> (FieldMap, ConfidenceMap) {
    let mut fields = FieldMap::new();
    let mut confidence = ConfidenceMap::new();

    let mut ordered: Vec<&PageResult> = pages.iter().filter(|page| !page.is_error()).collect();
    ordered.sort_by_key(|page| page.index);

    for page in ordered {
        for (name, value) in &page.fields {
            let page_conf = effective_confidence(value, page.confidence.get(name).copied());
            let kind = schema
                .field_kind(name)
                .unwrap_or_else(|| infer_kind(value));

            match fields.get_mut(name) {
                None => {
                    fields.insert(name.clone(), value.clone());
                    confidence.insert(name.clone(), page_conf);
                }
                Some(existing) => match kind {
                    FieldKind::Array => {
                        concat_arrays(existing, value);
                        let prior = confidence.get(name).copied().unwrap_or(0.0);
                        confidence.insert(name.clone(), average(prior, page_conf));
                    }
                    FieldKind::Object => {
                        merge_objects(existing, value);
                        let prior = confidence.get(name).copied().unwrap_or(0.0);
                        confidence.insert(name.clone(), prior.max(page_conf));
                    }
                    _ => {
                        let prior = confidence.get(name).copied().unwrap_or(0.0);
                        // Strict comparison: on ties the earliest page wins.
                        if page_conf > prior {
                            *existing = value.clone();
                            confidence.insert(name.clone(), page_conf);
                        }
                    }
                },
            }
        }
    }

    for required in &schema.required_fields {
        let missing = match fields.get(required) {
            None => true,
            Some(value) => value.is_missing_sentinel(),
        };
        if missing {
            fields.insert(required.clone(), FieldValue::missing());
            confidence.insert(required.clone(), 0.0);
        }
    }

    (fields, confidence)
}

/// The `"N/A"` sentinel never outranks a real value, whatever the model
/// claimed for it.
fn effective_confidence(value: &FieldValue, reported: Option<f64>) -> f64 {
    if value.is_missing_sentinel() {
        return 0.0;
    }
    reported.unwrap_or(0.0).clamp(0.0, 1.0)
}

fn infer_kind(value: &FieldValue) -> FieldKind {
    match value {
        FieldValue::Text(_) => FieldKind::Text,
        FieldValue::Number(_) => FieldKind::Number,
        FieldValue::Date(_) => FieldKind::Date,
        FieldValue::Bool(_) => FieldKind::Boolean,
        FieldValue::Array(_) => FieldKind::Array,
        FieldValue::Object(_) => FieldKind::Object,
    }
}

fn concat_arrays(existing: &mut FieldValue, incoming: &FieldValue) {
    let incoming_items = match incoming {
        FieldValue::Array(items) => items.clone(),
        other if other.is_missing_sentinel() => Vec::new(),
        other => vec![other.clone()],
    };
    match existing {
        FieldValue::Array(items) => items.extend(incoming_items),
        other if other.is_missing_sentinel() => {
            *other = FieldValue::Array(incoming_items);
        }
        other => {
            let mut items = vec![other.clone()];
            items.extend(incoming_items);
            *other = FieldValue::Array(items);
        }
    }
}

fn merge_objects(existing: &mut FieldValue, incoming: &FieldValue) {
    let FieldValue::Object(incoming_entries) = incoming else {
        if existing.is_missing_sentinel() && !incoming.is_missing_sentinel() {
            *existing = incoming.clone();
        }
        return;
    };
    if !matches!(existing, FieldValue::Object(_)) {
        if existing.is_missing_sentinel() {
            *existing = incoming.clone();
        }
        return;
    }
    let FieldValue::Object(existing_entries) = existing else {
        return;
    };
    for (key, value) in incoming_entries {
        match existing_entries.get_mut(key) {
            None => {
                existing_entries.insert(key.clone(), value.clone());
            }
            Some(current) => match (&mut *current, value) {
                (FieldValue::Object(_), FieldValue::Object(_)) => merge_objects(current, value),
                (FieldValue::Array(_), _) | (_, FieldValue::Array(_)) => {
                    concat_arrays(current, value)
                }
                _ => {
                    if current.is_missing_sentinel() && !value.is_missing_sentinel() {
                        *current = value.clone();
                    }
                }
            },
        }
    }
}

fn average(a: f64, b: f64) -> f64 {
    (a + b) / 2.0
}
