//! Workbook synthesis: single-document, batch, and template-mode exports.

pub mod template;

use rust_xlsxwriter::{ExcelDateTime, Format, Workbook, Worksheet, XlsxError};
use thiserror::Error;

use crate::document::{Document, FieldMap, FieldValue};

pub use template::template_columns;

const MAX_COLUMN_WIDTH: f64 = 60.0;
const MIN_COLUMN_WIDTH: f64 = 10.0;
const DATE_NUM_FORMAT: &str = "yyyy-mm-dd";

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error(transparent)]
    Xlsx(#[from] XlsxError),
    #[error("document {0} has no extracted data")]
    NoData(i64),
}

/// Stateless workbook builder over completed documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkbookWriter;

impl WorkbookWriter {
    pub fn new() -> Self {
        Self
    }

    /// Single-document workbook: `Data` (key/value), optional `Metadata`
    /// (timings, model, fill statistics), `Summary` (per-field confidence).
    pub fn single(
        &self,
        document: &Document,
        include_metadata: bool,
    ) -> Result<Vec<u8>, WorkbookError> {
        let fields = document
            .extracted_field_map()
            .ok_or(WorkbookError::NoData(document.id))?;

        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();
        let date_format = Format::new().set_num_format(DATE_NUM_FORMAT);

        let data = workbook.add_worksheet();
        data.set_name("Data")?;
        write_key_value_sheet(data, &fields, &bold, &date_format)?;

        if include_metadata {
            let metadata = workbook.add_worksheet();
            metadata.set_name("Metadata")?;
            write_metadata_sheet(metadata, document, &fields, &bold)?;
        }

        let summary = workbook.add_worksheet();
        summary.set_name("Summary")?;
        write_summary_sheet(summary, document, &fields, &bold)?;

        Ok(workbook.save_to_buffer()?)
    }

    /// Batch workbook: a `Data_<id>` sheet per document plus a `Combined`
    /// union sheet carrying per-row provenance.
    pub fn batch(&self, documents: &[Document]) -> Result<Vec<u8>, WorkbookError> {
        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();
        let date_format = Format::new().set_num_format(DATE_NUM_FORMAT);

        let extracted: Vec<(&Document, FieldMap)> = documents
            .iter()
            .filter_map(|document| {
                document
                    .extracted_field_map()
                    .map(|fields| (document, fields))
            })
            .collect();

        // Combined first so it opens as the leading sheet.
        let combined = workbook.add_worksheet();
        combined.set_name("Combined")?;
        write_combined_sheet(combined, &extracted, &bold, &date_format)?;

        for (document, fields) in &extracted {
            let sheet = workbook.add_worksheet();
            sheet.set_name(format!("Data_{}", document.id))?;
            write_key_value_sheet(sheet, fields, &bold, &date_format)?;
        }

        Ok(workbook.save_to_buffer()?)
    }

    /// Template workbook: one wide `Template` sheet whose columns are the
    /// deterministic projection, plus a `Template Info` sheet naming the
    /// sources and the ordering rule.
    pub fn template(&self, documents: &[Document]) -> Result<Vec<u8>, WorkbookError> {
        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();
        let date_format = Format::new().set_num_format(DATE_NUM_FORMAT);

        let extracted: Vec<(&Document, FieldMap)> = documents
            .iter()
            .filter_map(|document| {
                document
                    .extracted_field_map()
                    .map(|fields| (document, fields))
            })
            .collect();
        let columns =
            template_columns(extracted.iter().map(|(_, fields)| fields.keys().cloned()));

        let sheet = workbook.add_worksheet();
        sheet.set_name("Template")?;

        let mut widths = WidthTracker::default();
        sheet.write_string_with_format(0, 0, "Source Document", &bold)?;
        widths.observe(0, "Source Document");
        for (idx, column) in columns.iter().enumerate() {
            let col = (idx + 1) as u16;
            sheet.write_string_with_format(0, col, column, &bold)?;
            widths.observe(col, column);
        }

        for (row_idx, (document, fields)) in extracted.iter().enumerate() {
            let row = (row_idx + 1) as u32;
            sheet.write_string(row, 0, &document.original_filename)?;
            widths.observe(0, &document.original_filename);
            for (idx, column) in columns.iter().enumerate() {
                let col = (idx + 1) as u16;
                // A document without this column leaves the cell empty; only
                // the model's own "N/A" answers are written out.
                if let Some(value) = fields.get(column) {
                    write_value(sheet, row, col, value, &date_format)?;
                    widths.observe(col, &value.to_cell_text());
                }
            }
        }
        widths.apply(sheet)?;
        sheet.set_freeze_panes(1, 0)?;

        let info = workbook.add_worksheet();
        info.set_name("Template Info")?;
        write_template_info_sheet(info, &extracted, &columns, &bold)?;

        Ok(workbook.save_to_buffer()?)
    }
}

/// Tracks the widest content per column and applies bounded widths.
#[derive(Debug, Default)]
struct WidthTracker {
    widths: std::collections::BTreeMap<u16, usize>,
}

impl WidthTracker {
    fn observe(&mut self, col: u16, content: &str) {
        let len = content.chars().count();
        let entry = self.widths.entry(col).or_insert(0);
        if len > *entry {
            *entry = len;
        }
    }

    fn apply(&self, sheet: &mut Worksheet) -> Result<(), XlsxError> {
        for (&col, &len) in &self.widths {
            let width = ((len + 2) as f64).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH);
            sheet.set_column_width(col, width)?;
        }
        Ok(())
    }
}

fn write_value(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: &FieldValue,
    date_format: &Format,
) -> Result<(), XlsxError> {
    match value {
        FieldValue::Number(number) if number.is_finite() => {
            sheet.write_number(row, col, *number)?;
        }
        FieldValue::Bool(flag) => {
            sheet.write_boolean(row, col, *flag)?;
        }
        FieldValue::Date(date) => {
            use chrono::Datelike;
            let excel_date = ExcelDateTime::from_ymd(
                date.year().clamp(1900, 9999) as u16,
                date.month() as u8,
                date.day() as u8,
            )?;
            sheet.write_datetime_with_format(row, col, &excel_date, date_format)?;
        }
        other => {
            sheet.write_string(row, col, other.to_cell_text())?;
        }
    }
    Ok(())
}

fn write_key_value_sheet(
    sheet: &mut Worksheet,
    fields: &FieldMap,
    bold: &Format,
    date_format: &Format,
) -> Result<(), XlsxError> {
    let mut widths = WidthTracker::default();
    sheet.write_string_with_format(0, 0, "Field", bold)?;
    sheet.write_string_with_format(0, 1, "Value", bold)?;
    widths.observe(0, "Field");
    widths.observe(1, "Value");

    for (row_idx, (name, value)) in fields.iter().enumerate() {
        let row = (row_idx + 1) as u32;
        sheet.write_string(row, 0, name)?;
        write_value(sheet, row, 1, value, date_format)?;
        widths.observe(0, name);
        widths.observe(1, &value.to_cell_text());
    }
    widths.apply(sheet)?;
    sheet.set_freeze_panes(1, 0)?;
    Ok(())
}

fn write_metadata_sheet(
    sheet: &mut Worksheet,
    document: &Document,
    fields: &FieldMap,
    bold: &Format,
) -> Result<(), XlsxError> {
    sheet.write_string_with_format(0, 0, "Extraction Metadata", bold)?;

    let mut row = 2_u32;
    let mut write_pair = |sheet: &mut Worksheet, row: u32, key: &str, value: String| {
        sheet
            .write_string(row, 0, key)
            .and_then(|sheet| sheet.write_string(row, 1, value))
            .map(|_| ())
    };
    write_pair(sheet, row, "Document ID", document.id.to_string())?;
    row += 1;
    write_pair(
        sheet,
        row,
        "Original Filename",
        document.original_filename.clone(),
    )?;
    row += 1;
    write_pair(sheet, row, "Pages", document.page_count.to_string())?;
    row += 1;
    write_pair(
        sheet,
        row,
        "Schema",
        document.schema_used.clone().unwrap_or_default(),
    )?;
    row += 1;
    if let Some(processing) = &document.processing {
        write_pair(sheet, row, "Model", processing.model.clone())?;
        row += 1;
        write_pair(
            sheet,
            row,
            "Processing Time (s)",
            format!("{:.2}", processing.duration_seconds),
        )?;
        row += 1;
        write_pair(sheet, row, "Worker", processing.worker.clone())?;
        row += 1;
    }
    if let Some(scores) = &document.confidence_scores {
        let average = if scores.is_empty() {
            0.0
        } else {
            scores.values().sum::<f64>() / scores.len() as f64
        };
        write_pair(sheet, row, "Average Confidence", format!("{average:.2}"))?;
        row += 1;
    }
    row += 1;

    sheet.write_string_with_format(row, 0, "Field Statistics", bold)?;
    row += 1;
    for (col, header) in ["Field Name", "Filled", "N/A", "Fill Rate %"]
        .into_iter()
        .enumerate()
    {
        sheet.write_string_with_format(row, col as u16, header, bold)?;
    }
    row += 1;
    for (name, value) in fields {
        let filled = !value.is_missing_sentinel();
        sheet.write_string(row, 0, name)?;
        sheet.write_number(row, 1, if filled { 1.0 } else { 0.0 })?;
        sheet.write_number(row, 2, if filled { 0.0 } else { 1.0 })?;
        sheet.write_number(row, 3, if filled { 100.0 } else { 0.0 })?;
        row += 1;
    }
    sheet.set_column_width(0, 28.0)?;
    sheet.set_column_width(1, 18.0)?;
    Ok(())
}

fn write_summary_sheet(
    sheet: &mut Worksheet,
    document: &Document,
    fields: &FieldMap,
    bold: &Format,
) -> Result<(), XlsxError> {
    sheet.write_string_with_format(0, 0, "Document Processing Summary", bold)?;

    let filled = fields
        .values()
        .filter(|value| !value.is_missing_sentinel())
        .count();
    let completeness = if fields.is_empty() {
        0.0
    } else {
        filled as f64 * 100.0 / fields.len() as f64
    };

    sheet.write_string(2, 0, "Total Fields")?;
    sheet.write_number(2, 1, fields.len() as f64)?;
    sheet.write_string(3, 0, "Data Completeness %")?;
    sheet.write_number(3, 1, completeness)?;

    sheet.write_string_with_format(5, 0, "Field", bold)?;
    sheet.write_string_with_format(5, 1, "Confidence", bold)?;
    sheet.write_string_with_format(5, 2, "", bold)?;

    let empty = Default::default();
    let scores = document.confidence_scores.as_ref().unwrap_or(&empty);
    let mut row = 6_u32;
    for name in fields.keys() {
        let confidence = scores.get(name).copied().unwrap_or(0.0);
        sheet.write_string(row, 0, name)?;
        sheet.write_number(row, 1, confidence)?;
        let bar = "█".repeat((confidence * 10.0).round() as usize);
        sheet.write_string(row, 2, bar)?;
        row += 1;
    }
    sheet.set_column_width(0, 28.0)?;
    sheet.set_column_width(2, 14.0)?;
    sheet.set_freeze_panes(6, 0)?;
    Ok(())
}

fn write_combined_sheet(
    sheet: &mut Worksheet,
    extracted: &[(&Document, FieldMap)],
    bold: &Format,
    date_format: &Format,
) -> Result<(), XlsxError> {
    let mut all_fields: Vec<String> = extracted
        .iter()
        .flat_map(|(_, fields)| fields.keys().cloned())
        .collect();
    all_fields.sort();
    all_fields.dedup();

    let mut widths = WidthTracker::default();
    sheet.write_string_with_format(0, 0, "Document ID", bold)?;
    sheet.write_string_with_format(0, 1, "Source Document", bold)?;
    widths.observe(1, "Source Document");
    for (idx, name) in all_fields.iter().enumerate() {
        let col = (idx + 2) as u16;
        sheet.write_string_with_format(0, col, name, bold)?;
        widths.observe(col, name);
    }

    for (row_idx, (document, fields)) in extracted.iter().enumerate() {
        let row = (row_idx + 1) as u32;
        sheet.write_number(row, 0, document.id as f64)?;
        sheet.write_string(row, 1, &document.original_filename)?;
        widths.observe(1, &document.original_filename);
        for (idx, name) in all_fields.iter().enumerate() {
            let col = (idx + 2) as u16;
            if let Some(value) = fields.get(name) {
                write_value(sheet, row, col, value, date_format)?;
                widths.observe(col, &value.to_cell_text());
            }
        }
    }
    widths.apply(sheet)?;
    sheet.set_freeze_panes(1, 0)?;
    Ok(())
}

fn write_template_info_sheet(
    sheet: &mut Worksheet,
    extracted: &[(&Document, FieldMap)],
    columns: &[String],
    bold: &Format,
) -> Result<(), XlsxError> {
    sheet.write_string_with_format(0, 0, "Document Template Information", bold)?;

    sheet.write_string(2, 0, "Total Documents")?;
    sheet.write_number(2, 1, extracted.len() as f64)?;
    sheet.write_string(3, 0, "Total Fields")?;
    sheet.write_number(3, 1, columns.len() as f64)?;
    sheet.write_string(4, 0, "Column Ordering")?;
    sheet.write_string(
        4,
        1,
        "first seen (ascending), then frequency (descending), then name",
    )?;

    sheet.write_string_with_format(6, 0, "Source Documents", bold)?;
    let mut row = 7_u32;
    for (document, _) in extracted {
        sheet.write_number(row, 0, document.id as f64)?;
        sheet.write_string(row, 1, &document.original_filename)?;
        row += 1;
    }

    row += 1;
    sheet.write_string_with_format(row, 0, "Columns", bold)?;
    row += 1;
    for (idx, column) in columns.iter().enumerate() {
        sheet.write_number(row, 0, (idx + 1) as f64)?;
        sheet.write_string(row, 1, column)?;
        row += 1;
    }
    sheet.set_column_width(0, 18.0)?;
    sheet.set_column_width(1, 42.0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ConfidenceMap, DocumentStatus};

    fn completed_document(id: i64, name: &str, fields_json: &str) -> Document {
        Document {
            id,
            content_hash: format!("hash{id}"),
            original_filename: name.to_string(),
            stored_filename: format!("stored_{id}.pdf"),
            file_size: 1_000,
            page_count: 1,
            status: DocumentStatus::Completed,
            progress: 1.0,
            attempt: 1,
            extracted_fields: Some(fields_json.to_string()),
            confidence_scores: Some(ConfidenceMap::from([
                ("total".to_string(), 0.9),
                ("invoice_number".to_string(), 0.95),
            ])),
            schema_used: Some("invoice".to_string()),
            processing: None,
            error_message: None,
            blob_cid: format!("cid{id}"),
            current_worker: None,
            worker_heartbeat_ms: 0,
            created_at_ms: 1,
            updated_at_ms: 1,
        }
    }

    #[test]
    fn single_produces_all_three_sheets() {
        let document = completed_document(
            1,
            "invoice.pdf",
            r#"{"invoice_number":"INV-1","invoice_date":"2024-03-01","total":99.5,"paid":true}"#,
        );
        let bytes = WorkbookWriter::new()
            .single(&document, true)
            .expect("workbook");
        // XLSX is a zip container.
        assert_eq!(&bytes[..2], b"PK");
        assert!(bytes.len() > 1_000);
    }

    #[test]
    fn single_without_metadata_still_builds() {
        let document = completed_document(1, "invoice.pdf", r#"{"total":1.0}"#);
        let bytes = WorkbookWriter::new()
            .single(&document, false)
            .expect("workbook");
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn single_requires_extracted_data() {
        let mut document = completed_document(1, "invoice.pdf", "{}");
        document.extracted_fields = None;
        let err = WorkbookWriter::new()
            .single(&document, true)
            .expect_err("no data");
        assert!(matches!(err, WorkbookError::NoData(1)));
    }

    #[test]
    fn identical_input_yields_identical_bytes() {
        let document = completed_document(
            7,
            "stable.pdf",
            r#"{"invoice_number":"INV-7","total":10.0}"#,
        );
        let writer = WorkbookWriter::new();
        let first = writer.single(&document, true).expect("workbook");
        let second = writer.single(&document, true).expect("workbook");
        assert_eq!(first, second);
    }

    #[test]
    fn batch_builds_per_document_sheets() {
        let documents = vec![
            completed_document(1, "a.pdf", r#"{"total":1.0}"#),
            completed_document(2, "b.pdf", r#"{"total":2.0,"date":"2024-01-02"}"#),
        ];
        let bytes = WorkbookWriter::new().batch(&documents).expect("workbook");
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn template_handles_disjoint_field_sets() {
        let documents = vec![
            completed_document(1, "a.pdf", r#"{"invoice_number":"A","total":1.0}"#),
            completed_document(
                2,
                "b.pdf",
                r#"{"invoice_number":"B","date":"2024-05-05","total":2.0}"#,
            ),
            completed_document(3, "c.pdf", r#"{"name":"C","total":3.0}"#),
        ];
        let bytes = WorkbookWriter::new()
            .template(&documents)
            .expect("workbook");
        assert_eq!(&bytes[..2], b"PK");
    }
}
