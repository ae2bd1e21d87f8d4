//! The request-driven facade over the engine: uploads, job submission,
//! status queries, deletion, and spreadsheet downloads. The HTTP adapter maps
//! routes onto these operations and knows nothing about the stores.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use crate::document::{
    Document, DocumentStatus, ProcessOptions, SchemaSelector, StatusSnapshot,
};
use crate::excel::{WorkbookError, WorkbookWriter};
use crate::schema::{Schema, SchemaError};
use crate::services::blob_store::{BlobError, BlobStore, blake3_cid};
use crate::services::enhance::EncodedImage;
use crate::services::vision::{SchemaDetection, VisionError};
use crate::services::Services;
use crate::store::{InsertOutcome, MetaStoreError, NewDocument, StartOutcome};

const PDF_MAGIC: &[u8] = b"%PDF-";
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(750);
pub const LIST_LIMIT_MAX: usize = 100;
pub const LIST_LIMIT_DEFAULT: usize = 20;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid file: {0}")]
    InvalidFile(String),
    #[error("upload of {size} bytes exceeds the {limit} byte ceiling")]
    UploadTooLarge { size: u64, limit: u64 },
    #[error("document `{0}` not found")]
    NotFound(i64),
    #[error("document `{id}` is {status}: {reason}")]
    InvalidState {
        id: i64,
        status: DocumentStatus,
        reason: String,
    },
    #[error("unknown schema `{0}`")]
    UnknownSchema(String),
    #[error("none of the requested documents are completed")]
    NoCompletedDocuments,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] MetaStoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Workbook(#[from] WorkbookError),
    #[error(transparent)]
    Vision(#[from] VisionError),
}

impl From<SchemaError> for ControllerError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::NotFound(name) => ControllerError::UnknownSchema(name),
            SchemaError::Vision(err) => ControllerError::Vision(err),
        }
    }
}

/// Acknowledgement returned by `start_processing`.
#[derive(Debug, Clone)]
pub struct StartReceipt {
    pub document_id: i64,
    pub job_id: String,
    pub enqueued_at_ms: i64,
    /// True when an earlier request already queued the work.
    pub already_queued: bool,
}

/// One page of the document listing.
#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub total: usize,
    pub skip: usize,
    pub limit: usize,
    pub documents: Vec<Document>,
}

/// Outcome of a batch submission.
#[derive(Debug, Clone, Default)]
pub struct BatchReceipt {
    pub job_ids: Vec<String>,
    pub accepted: Vec<i64>,
    pub skipped: Vec<i64>,
}

/// A generated workbook plus its suggested download filename.
#[derive(Debug, Clone)]
pub struct WorkbookDownload {
    pub bytes: Vec<u8>,
    pub filename: String,
}

/// Detection result enriched with the schema it resolves to.
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub detection: SchemaDetection,
    pub resolved: &'static Schema,
}

#[derive(Clone)]
pub struct Controller {
    services: Arc<Services>,
    workbooks: WorkbookWriter,
}

impl Controller {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            workbooks: WorkbookWriter::new(),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Accept an upload: size ceiling, magic-byte sniff, content-hash dedupe,
    /// blob write, Pending insert. Does not enqueue anything.
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        original_name: &str,
    ) -> Result<Document, ControllerError> {
        let limit = self.services.config.upload.max_upload_bytes;
        let size = bytes.len() as u64;
        if size > limit {
            return Err(ControllerError::UploadTooLarge { size, limit });
        }
        if bytes.is_empty() {
            return Err(ControllerError::InvalidFile("file is empty".to_string()));
        }
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(ControllerError::InvalidFile(
                "not a PDF (missing %PDF- signature)".to_string(),
            ));
        }

        let hash = blake3_cid(&bytes);
        if let Some(existing) = self.services.meta.find_by_hash(&hash)? {
            tracing::info!(
                document_id = existing.id,
                hash = %hash,
                "duplicate upload, returning existing document"
            );
            return Ok(existing);
        }

        let put = self.services.blobs.put(&bytes).await?;
        let stored_filename = format!(
            "{}_{}.pdf",
            crate::store::current_timestamp_ms(),
            &hash[..16]
        );
        let outcome = self.services.meta.insert_document(NewDocument {
            content_hash: hash,
            original_filename: sanitize_filename(original_name),
            stored_filename,
            file_size: size,
            blob_cid: put.cid,
        })?;

        let document = match outcome {
            InsertOutcome::Created(document) => {
                tracing::info!(
                    document_id = document.id,
                    size,
                    file = %document.original_filename,
                    "document uploaded"
                );
                document
            }
            // A concurrent identical upload won the insert; theirs is ours.
            InsertOutcome::Duplicate(document) => document,
        };
        Ok(document)
    }

    /// Queue (or re-queue) a document for processing.
    pub fn start_processing(
        &self,
        id: i64,
        schema: Option<String>,
        template_mode: bool,
    ) -> Result<StartReceipt, ControllerError> {
        let selector = match schema {
            None => SchemaSelector::Auto,
            Some(name) => {
                let schema = self.services.schemas.get(&name)?;
                SchemaSelector::Named(schema.name.clone())
            }
        };
        let options = ProcessOptions {
            schema: selector,
            template_mode,
        };

        let outcome = match self.services.meta.start_processing(id, options) {
            Ok(outcome) => outcome,
            Err(MetaStoreError::DocumentNotFound(id)) => {
                return Err(ControllerError::NotFound(id));
            }
            Err(err) => return Err(err.into()),
        };

        match outcome {
            StartOutcome::Enqueued { document, job } => {
                tracing::info!(
                    document_id = document.id,
                    job_id = %job.job_id,
                    attempt = document.attempt,
                    "processing queued"
                );
                Ok(StartReceipt {
                    document_id: document.id,
                    job_id: job.job_id,
                    enqueued_at_ms: job.enqueued_at_ms,
                    already_queued: false,
                })
            }
            StartOutcome::AlreadyQueued { document, job } => Ok(StartReceipt {
                document_id: document.id,
                job_id: job.job_id,
                enqueued_at_ms: job.enqueued_at_ms,
                already_queued: true,
            }),
            StartOutcome::AlreadyProcessing { document } => Err(ControllerError::InvalidState {
                id: document.id,
                status: document.status,
                reason: "a worker is processing it right now".to_string(),
            }),
        }
    }

    pub fn batch_process(
        &self,
        ids: &[i64],
        schema: Option<String>,
    ) -> Result<BatchReceipt, ControllerError> {
        if ids.is_empty() {
            return Err(ControllerError::Validation(
                "document_ids must not be empty".to_string(),
            ));
        }
        // Validate existence up front so the batch fails fast on typos.
        for &id in ids {
            if self.services.meta.get_document(id)?.is_none() {
                return Err(ControllerError::NotFound(id));
            }
        }

        let mut receipt = BatchReceipt::default();
        for &id in ids {
            match self.start_processing(id, schema.clone(), false) {
                Ok(start) => {
                    receipt.job_ids.push(start.job_id);
                    receipt.accepted.push(id);
                }
                Err(ControllerError::InvalidState { .. }) => receipt.skipped.push(id),
                Err(other) => return Err(other),
            }
        }
        Ok(receipt)
    }

    pub fn get_status(&self, id: i64) -> Result<StatusSnapshot, ControllerError> {
        let document = self
            .services
            .meta
            .get_document(id)?
            .ok_or(ControllerError::NotFound(id))?;
        Ok(document.snapshot())
    }

    /// Finite stream of snapshots: the current state, every observed change,
    /// and a terminal event. Bus events drive it; a slow poll of the store
    /// backstops deliveries from other processes.
    pub fn stream_status(
        &self,
        id: i64,
    ) -> Result<BoxStream<'static, StatusSnapshot>, ControllerError> {
        let initial = self.get_status(id)?;
        let services = self.services.clone();

        let stream = async_stream::stream! {
            let mut last = initial.clone();
            yield initial;
            if last.status.is_terminal() {
                return;
            }

            let (replay, mut events) = services.progress.subscribe(id);
            if let Some(snapshot) = replay {
                if snapshot_changed(&last, &snapshot) {
                    last = snapshot.clone();
                    yield snapshot;
                    if last.status.is_terminal() {
                        services.progress.release(id);
                        return;
                    }
                }
            }

            let mut poll = tokio::time::interval(STREAM_POLL_INTERVAL);
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let snapshot = tokio::select! {
                    event = events.recv() => match event {
                        Ok(snapshot) => Some(snapshot),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => None,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => None,
                    },
                    _ = poll.tick() => {
                        match services.meta.get_document(id) {
                            Ok(Some(document)) => Some(document.snapshot()),
                            // Deleted mid-stream; the sequence just ends.
                            Ok(None) => break,
                            Err(err) => {
                                tracing::warn!(document_id = id, error = %err, "status poll failed");
                                None
                            }
                        }
                    }
                };
                let Some(snapshot) = snapshot else { continue };
                if !snapshot_changed(&last, &snapshot) {
                    continue;
                }
                last = snapshot.clone();
                let terminal = snapshot.status.is_terminal();
                yield snapshot;
                if terminal {
                    break;
                }
            }
            services.progress.release(id);
        };
        Ok(Box::pin(stream))
    }

    pub fn list(
        &self,
        skip: usize,
        limit: usize,
        status: Option<DocumentStatus>,
    ) -> Result<DocumentPage, ControllerError> {
        if !(1..=LIST_LIMIT_MAX).contains(&limit) {
            return Err(ControllerError::Validation(format!(
                "limit must be between 1 and {LIST_LIMIT_MAX}"
            )));
        }
        let (total, documents) = self.services.meta.list_documents(skip, limit, status)?;
        Ok(DocumentPage {
            total,
            skip,
            limit,
            documents,
        })
    }

    /// Remove the document, its blob, and any in-flight work (via tombstone).
    pub async fn delete(&self, id: i64) -> Result<(), ControllerError> {
        let Some(document) = self.services.meta.delete_document(id)? else {
            return Err(ControllerError::NotFound(id));
        };
        match self.services.blobs.delete(&document.blob_cid).await {
            Ok(_) => {}
            Err(err) => {
                // The row is gone either way; an orphaned blob is only disk.
                tracing::warn!(document_id = id, error = %err, "blob delete failed");
            }
        }
        tracing::info!(document_id = id, "document deleted");
        Ok(())
    }

    pub fn download_single(
        &self,
        id: i64,
        include_metadata: bool,
    ) -> Result<WorkbookDownload, ControllerError> {
        let document = self
            .services
            .meta
            .get_document(id)?
            .ok_or(ControllerError::NotFound(id))?;
        if document.status != DocumentStatus::Completed {
            return Err(ControllerError::InvalidState {
                id,
                status: document.status,
                reason: "only completed documents can be exported".to_string(),
            });
        }
        let bytes = self.workbooks.single(&document, include_metadata)?;
        let stem = document
            .original_filename
            .strip_suffix(".pdf")
            .unwrap_or(&document.original_filename);
        Ok(WorkbookDownload {
            bytes,
            filename: format!("{stem}_extracted.xlsx"),
        })
    }

    pub fn download_batch(&self, ids: &[i64]) -> Result<WorkbookDownload, ControllerError> {
        let documents = self.completed_documents(ids)?;
        let bytes = self.workbooks.batch(&documents)?;
        Ok(WorkbookDownload {
            bytes,
            filename: format!("batch_export_{}.xlsx", timestamp_slug()),
        })
    }

    pub fn download_template(&self, ids: &[i64]) -> Result<WorkbookDownload, ControllerError> {
        let documents = self.completed_documents(ids)?;
        let field_count: usize = {
            let mut names: Vec<String> = documents
                .iter()
                .filter_map(Document::extracted_field_map)
                .flat_map(|fields| fields.into_keys())
                .collect();
            names.sort();
            names.dedup();
            names.len()
        };
        let bytes = self.workbooks.template(&documents)?;
        Ok(WorkbookDownload {
            bytes,
            filename: format!(
                "template_export_{}_{}docs_{}fields.xlsx",
                timestamp_slug(),
                documents.len(),
                field_count
            ),
        })
    }

    pub fn list_schemas(&self) -> &'static [Schema] {
        self.services.schemas.list()
    }

    pub fn get_schema(&self, name: &str) -> Result<&'static Schema, ControllerError> {
        Ok(self.services.schemas.get(name)?)
    }

    /// Run schema detection against a caller-supplied sample image.
    pub async fn detect_schema(
        &self,
        image_bytes: Vec<u8>,
        hint: Option<&str>,
    ) -> Result<DetectionOutcome, ControllerError> {
        if image_bytes.is_empty() {
            return Err(ControllerError::Validation(
                "sample image must not be empty".to_string(),
            ));
        }
        let image = EncodedImage::png(image_bytes, 0, 0);
        let detection = self
            .services
            .schemas
            .detect(self.services.vision.as_ref(), &image, hint)
            .await?;
        let resolved = self.services.schemas.resolve_detection(&detection);
        Ok(DetectionOutcome {
            detection,
            resolved,
        })
    }

    fn completed_documents(&self, ids: &[i64]) -> Result<Vec<Document>, ControllerError> {
        if ids.is_empty() {
            return Err(ControllerError::Validation(
                "document_ids must not be empty".to_string(),
            ));
        }
        let mut documents = Vec::new();
        for &id in ids {
            if let Some(document) = self.services.meta.get_document(id)? {
                if document.status == DocumentStatus::Completed
                    && document.extracted_fields.is_some()
                {
                    documents.push(document);
                }
            }
        }
        if documents.is_empty() {
            return Err(ControllerError::NoCompletedDocuments);
        }
        Ok(documents)
    }
}

fn snapshot_changed(last: &StatusSnapshot, next: &StatusSnapshot) -> bool {
    next.status != last.status || next.progress != last.progress
}

fn timestamp_slug() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn sanitize_filename(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "upload.pdf".to_string();
    }
    // Path separators in client-supplied names are not ours to honor.
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_stripped_of_paths() {
        assert_eq!(sanitize_filename("../../etc/passwd.pdf"), "passwd.pdf");
        assert_eq!(sanitize_filename("C:\\docs\\scan.pdf"), "scan.pdf");
        assert_eq!(sanitize_filename("  invoice.pdf  "), "invoice.pdf");
        assert_eq!(sanitize_filename(""), "upload.pdf");
    }

    #[test]
    fn snapshot_change_detection_tracks_status_and_progress() {
        let base = StatusSnapshot {
            document_id: 1,
            status: DocumentStatus::Processing,
            progress: 0.5,
            page_count: 2,
            extracted_data: None,
            confidence_scores: None,
            error_message: None,
            processing_metadata: None,
        };
        let same = base.clone();
        assert!(!snapshot_changed(&base, &same));

        let mut moved = base.clone();
        moved.progress = 0.55;
        assert!(snapshot_changed(&base, &moved));

        let mut finished = base.clone();
        finished.status = DocumentStatus::Completed;
        assert!(snapshot_changed(&base, &finished));
    }
}
