//! The pipeline engine: advances one claimed job through load, rasterize,
//! enhance, schema resolution, extraction, merge, and persistence. The engine
//! classifies every failure instead of propagating it; the worker pool maps
//! the resulting outcome onto queue acknowledgements.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use strum::AsRefStr;
use tokio::time::Instant;

use crate::document::{
    Document, DocumentStatus, FieldValue, PageResult, PageStatus, ProcessingMetadata,
    SchemaSelector, StatusSnapshot, fields_to_json_text,
};
use crate::schema::Schema;
use crate::services::Services;
use crate::services::blob_store::BlobStore;
use crate::services::enhance::{EncodedImage, enhance_page};
use crate::services::ocr::OcrFallback;
use crate::services::raster::{RasterError, Rasterizer};
use crate::services::vision::{VisionError, VisionExtractor};
use crate::store::{ClaimedJob, JobRecord, MetaStoreError};

use super::merge::merge_pages;

/// How long a fresh lease lasts and when it gets topped up. Generous enough
/// that a slow model call does not lose the claim mid-page; crash recovery is
/// the janitor's job, not lease expiry's.
pub const LEASE_DURATION: Duration = Duration::from_secs(300);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Base delay for job-level (queue) retries; doubles per delivery attempt.
const JOB_RETRY_BASE: Duration = Duration::from_secs(5);
const JOB_RETRY_CAP: Duration = Duration::from_secs(300);
/// Re-delivery delay when the document is still mid-flight in another
/// attempt; long enough for that attempt (or the janitor) to resolve it.
const SPURIOUS_RETRY_DELAY: Duration = Duration::from_secs(30);

// Stage weights; per-page stages advance proportionally inside their band.
const W_LOAD: f64 = 0.05;
const W_RASTER: f64 = 0.10;
const W_ENHANCE: f64 = 0.15;
const W_RESOLVE: f64 = 0.05;
const W_EXTRACT: f64 = 0.55;
const W_MERGE: f64 = 0.05;

const P_AFTER_LOAD: f64 = W_LOAD;
const P_AFTER_RASTER: f64 = P_AFTER_LOAD + W_RASTER;
const P_AFTER_ENHANCE: f64 = P_AFTER_RASTER + W_ENHANCE;
const P_AFTER_RESOLVE: f64 = P_AFTER_ENHANCE + W_RESOLVE;
const P_AFTER_EXTRACT: f64 = P_AFTER_RESOLVE + W_EXTRACT;
const P_AFTER_MERGE: f64 = P_AFTER_EXTRACT + W_MERGE;

/// Document-level terminal failures. The variant name is the user-visible
/// error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum TerminalKind {
    DocumentTooLarge,
    Unreadable,
    AllPagesFailedExtraction,
    Timeout,
    Cancelled,
}

/// Transient faults that send the job back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum RetryableKind {
    StoreUnavailable,
    BlobUnavailable,
    /// The document is held by another in-flight attempt; the job must
    /// survive until that attempt settles.
    SpuriousDelivery,
}

/// What the worker should do with the job after a run.
#[derive(Debug)]
pub enum EngineOutcome {
    /// Results persisted; ack.
    Completed { document_id: i64 },
    /// Document marked failed; ack.
    Failed {
        document_id: i64,
        kind: TerminalKind,
    },
    /// Transient fault; nack with the given delay.
    Retry {
        document_id: i64,
        kind: RetryableKind,
        delay: Duration,
        message: String,
    },
    /// The document was deleted mid-flight; ack and clear the tombstone.
    Cancelled { document_id: i64 },
    /// Stale delivery (lost claim race or outdated generation); ack quietly.
    Skipped { document_id: i64 },
}

enum StageFailure {
    Terminal(TerminalKind),
    Retryable(RetryableKind, String),
    Cancelled,
    Skipped,
    /// Delivered while another attempt holds the document; nack, never ack.
    Spurious,
}

impl From<MetaStoreError> for StageFailure {
    fn from(err: MetaStoreError) -> Self {
        StageFailure::Retryable(RetryableKind::StoreUnavailable, err.to_string())
    }
}

pub struct PipelineEngine {
    services: Arc<Services>,
    worker_id: String,
}

impl PipelineEngine {
    pub fn new(services: Arc<Services>, worker_id: impl Into<String>) -> Self {
        Self {
            services,
            worker_id: worker_id.into(),
        }
    }

    pub async fn run(&self, claimed: &ClaimedJob) -> EngineOutcome {
        let document_id = claimed.job.document_id;
        match self.run_inner(claimed).await {
            Ok(outcome) => outcome,
            Err(StageFailure::Cancelled) => {
                tracing::info!(document_id, "job cancelled by tombstone");
                EngineOutcome::Cancelled { document_id }
            }
            Err(StageFailure::Skipped) => EngineOutcome::Skipped { document_id },
            Err(StageFailure::Terminal(kind)) => {
                self.finalize_failure(document_id, claimed, kind).await
            }
            Err(StageFailure::Retryable(kind, message)) => {
                // The document must go back to Pending before the job becomes
                // visible again, or the re-delivery can never claim it.
                self.release_document(document_id, claimed.job.doc_generation);
                let delay = job_retry_delay(claimed.job.attempt);
                tracing::warn!(
                    document_id,
                    kind = kind.as_ref(),
                    %message,
                    delay_ms = delay.as_millis() as u64,
                    "transient pipeline failure, returning job to queue"
                );
                EngineOutcome::Retry {
                    document_id,
                    kind,
                    delay,
                    message,
                }
            }
            Err(StageFailure::Spurious) => {
                tracing::debug!(
                    document_id,
                    "spurious delivery; another attempt holds the document"
                );
                EngineOutcome::Retry {
                    document_id,
                    kind: RetryableKind::SpuriousDelivery,
                    delay: SPURIOUS_RETRY_DELAY,
                    message: "document is mid-flight in another delivery".to_string(),
                }
            }
        }
    }

    async fn run_inner(&self, claimed: &ClaimedJob) -> Result<EngineOutcome, StageFailure> {
        let services = &self.services;
        let job = &claimed.job;
        let document_id = job.document_id;
        let started = Instant::now();
        let deadline = Duration::from_secs(services.config.processing.timeout_seconds);

        // Load: claim the Pending -> Processing transition.
        self.checkpoint(document_id, claimed, started, deadline)?;
        let Some(document) = services.meta.begin_processing(document_id, &self.worker_id)? else {
            return Err(self.lost_claim_failure(document_id, job));
        };
        if document.attempt != job.doc_generation {
            tracing::debug!(
                document_id,
                doc_attempt = document.attempt,
                job_generation = job.doc_generation,
                "dropping stale job"
            );
            // Hand the row back; it belongs to a newer generation's job.
            self.release_document(document_id, document.attempt);
            return Err(StageFailure::Skipped);
        }
        let attempt = document.attempt;
        tracing::info!(
            document_id,
            attempt,
            worker = %self.worker_id,
            file = %document.original_filename,
            "processing started"
        );

        let pdf_bytes = services
            .blobs
            .get(&document.blob_cid)
            .await
            .map_err(|err| {
                StageFailure::Retryable(RetryableKind::BlobUnavailable, err.to_string())
            })?;
        self.publish(&document, attempt, P_AFTER_LOAD);

        // Rasterize.
        self.checkpoint(document_id, claimed, started, deadline)?;
        let pages = match services.rasterizer.rasterize(
            &pdf_bytes,
            services.config.processing.render_width,
            services.config.processing.max_pages,
        ) {
            Ok(pages) => pages,
            Err(RasterError::TooManyPages { pages, limit }) => {
                tracing::warn!(document_id, pages, limit, "document exceeds page budget");
                return Err(StageFailure::Terminal(TerminalKind::DocumentTooLarge));
            }
            Err(err) if err.is_document_fault() => {
                tracing::warn!(document_id, error = %err, "document is unreadable");
                return Err(StageFailure::Terminal(TerminalKind::Unreadable));
            }
            Err(err) => {
                // Library loading problems are environment faults, not
                // document faults; another worker may fare better.
                return Err(StageFailure::Retryable(
                    RetryableKind::StoreUnavailable,
                    err.to_string(),
                ));
            }
        };
        let page_count = pages.len() as u32;
        if page_count == 0 {
            tracing::warn!(document_id, "document has no pages");
            return Err(StageFailure::Terminal(TerminalKind::Unreadable));
        }
        services.meta.record_page_count(document_id, attempt, page_count)?;
        let mut document = document;
        document.page_count = page_count;
        self.publish(&document, attempt, P_AFTER_RASTER);

        // Enhance.
        let mut warnings = Vec::new();
        let mut enhanced: Vec<EncodedImage> = Vec::with_capacity(pages.len());
        for (idx, page) in pages.iter().enumerate() {
            self.checkpoint(document_id, claimed, started, deadline)?;
            match enhance_page(&page.png_data) {
                Ok(image) => enhanced.push(image),
                Err(err) => {
                    tracing::warn!(
                        document_id,
                        page = idx + 1,
                        error = %err,
                        "enhancement failed, passing raw page through"
                    );
                    warnings.push(format!("page {}: enhancement skipped ({err})", idx + 1));
                    enhanced.push(EncodedImage::png(
                        page.png_data.clone(),
                        page.width,
                        page.height,
                    ));
                }
            }
            let fraction = (idx + 1) as f64 / pages.len() as f64;
            self.publish(&document, attempt, P_AFTER_RASTER + W_ENHANCE * fraction);
        }

        // Resolve schema.
        self.checkpoint(document_id, claimed, started, deadline)?;
        let schema = self.resolve_schema(&job.options.schema, &enhanced[0]).await;
        tracing::info!(document_id, schema = %schema.name, "schema resolved");
        self.publish(&document, attempt, P_AFTER_RESOLVE);

        // Extract, page by page.
        let mut page_results: Vec<PageResult> = Vec::with_capacity(enhanced.len());
        for (idx, image) in enhanced.iter().enumerate() {
            self.checkpoint(document_id, claimed, started, deadline)?;
            let result = self.extract_page(document_id, idx as u32, image, schema).await;
            page_results.push(result);
            let fraction = (idx + 1) as f64 / enhanced.len() as f64;
            self.publish(&document, attempt, P_AFTER_RESOLVE + W_EXTRACT * fraction);
        }

        if page_results.iter().all(PageResult::is_error) {
            tracing::warn!(document_id, pages = page_results.len(), "every page failed");
            return Err(StageFailure::Terminal(TerminalKind::AllPagesFailedExtraction));
        }

        // Merge.
        self.checkpoint(document_id, claimed, started, deadline)?;
        let (fields, confidence) = merge_pages(schema, &page_results);
        self.publish(&document, attempt, P_AFTER_MERGE);

        // Persist results.
        self.checkpoint(document_id, claimed, started, deadline)?;
        let metadata = ProcessingMetadata {
            duration_seconds: started.elapsed().as_secs_f64(),
            model: services.vision.model_id(),
            worker: self.worker_id.clone(),
            page_statuses: page_statuses(&page_results),
            warnings,
            finished_at_ms: crate::store::current_timestamp_ms(),
        };
        let persisted = services.meta.complete_document(
            document_id,
            attempt,
            fields_to_json_text(&fields),
            confidence,
            schema.name.clone(),
            metadata,
        )?;
        if !persisted {
            // A newer attempt superseded this run while it was extracting.
            return Err(StageFailure::Skipped);
        }

        if let Ok(Some(fresh)) = services.meta.get_document(document_id) {
            services.progress.publish(fresh.snapshot());
        }
        tracing::info!(
            document_id,
            attempt,
            pages = page_count,
            elapsed_s = format!("{:.2}", started.elapsed().as_secs_f64()),
            "processing completed"
        );
        Ok(EngineOutcome::Completed { document_id })
    }

    /// One page through the vision extractor with bounded retries, then the
    /// OCR fallback. A page that fails both is an error page, not a document
    /// failure.
    async fn extract_page(
        &self,
        document_id: i64,
        index: u32,
        image: &EncodedImage,
        schema: &Schema,
    ) -> PageResult {
        let services = &self.services;
        let vision = services.vision.clone();

        let attempt = || async { vision.extract(image, schema).await };
        let extraction = attempt
            .retry(services.backoff)
            .when(VisionError::is_retryable)
            .notify(|err: &VisionError, delay: Duration| {
                tracing::warn!(
                    document_id,
                    page = index + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying vision extraction"
                );
            })
            .await;

        match extraction {
            Ok(extraction) => PageResult {
                index,
                status: PageStatus::Vision,
                fields: extraction.fields,
                confidence: extraction.confidence,
                error: None,
            },
            Err(vision_err) => {
                tracing::warn!(
                    document_id,
                    page = index + 1,
                    error = %vision_err,
                    "vision extraction exhausted, falling back to OCR"
                );
                match services.ocr.transcribe(image).await {
                    Ok(text) => {
                        let mut fields = BTreeMap::new();
                        fields.insert("raw_text".to_string(), FieldValue::Text(text));
                        let mut confidence = BTreeMap::new();
                        confidence.insert("raw_text".to_string(), 0.5);
                        PageResult {
                            index,
                            status: PageStatus::OcrFallback,
                            fields,
                            confidence,
                            error: None,
                        }
                    }
                    Err(ocr_err) => {
                        tracing::warn!(
                            document_id,
                            page = index + 1,
                            error = %ocr_err,
                            "ocr fallback failed too"
                        );
                        PageResult::error(
                            index,
                            format!("vision: {vision_err}; ocr: {ocr_err}"),
                        )
                    }
                }
            }
        }
    }

    async fn resolve_schema(
        &self,
        selector: &SchemaSelector,
        first_page: &EncodedImage,
    ) -> &'static Schema {
        let registry = &self.services.schemas;
        match selector {
            SchemaSelector::Named(name) => match registry.get(name) {
                Ok(schema) => schema,
                Err(_) => {
                    // The controller validates names on enqueue; a miss here
                    // means the registry changed between deployments.
                    tracing::warn!(schema = %name, "named schema unknown, using generic");
                    registry.generic()
                }
            },
            SchemaSelector::Auto => {
                match registry
                    .detect(self.services.vision.as_ref(), first_page, None)
                    .await
                {
                    Ok(detection) => {
                        let resolved = registry.resolve_detection(&detection);
                        tracing::debug!(
                            detected = %detection.schema_name,
                            confidence = detection.confidence,
                            resolved = %resolved.name,
                            "schema detection"
                        );
                        resolved
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "schema detection failed, using generic");
                        registry.generic()
                    }
                }
            }
        }
    }

    /// The begin-processing guard said no. Decide whether the delivery is
    /// moot (terminal, deleted, or outdated generation: safe to ack) or
    /// spurious (another attempt is mid-flight: the job must be nacked so it
    /// outlives the race).
    fn lost_claim_failure(&self, document_id: i64, job: &JobRecord) -> StageFailure {
        match self.services.meta.get_document(document_id) {
            Ok(Some(document)) => {
                if document.attempt != job.doc_generation || document.status.is_terminal() {
                    StageFailure::Skipped
                } else {
                    StageFailure::Spurious
                }
            }
            Ok(None) => StageFailure::Skipped,
            Err(err) => StageFailure::Retryable(RetryableKind::StoreUnavailable, err.to_string()),
        }
    }

    /// Undo the `Pending -> Processing` transition ahead of a job requeue.
    fn release_document(&self, document_id: i64, attempt: u32) {
        match self.services.meta.release_processing(document_id, attempt) {
            // False means the transition never happened, or a newer attempt
            // owns the row; both are fine as-is.
            Ok(_) => {}
            Err(err) => {
                tracing::error!(
                    document_id,
                    error = %err,
                    "failed to release document for retry"
                );
            }
        }
    }

    /// Stage-boundary duties: cancellation tombstone, wall-clock budget, and
    /// lease upkeep.
    fn checkpoint(
        &self,
        document_id: i64,
        claimed: &ClaimedJob,
        started: Instant,
        deadline: Duration,
    ) -> Result<(), StageFailure> {
        if self.services.meta.is_tombstoned(document_id)? {
            return Err(StageFailure::Cancelled);
        }
        if started.elapsed() > deadline {
            return Err(StageFailure::Terminal(TerminalKind::Timeout));
        }
        let remaining = self.services.meta.lease_remaining(&claimed.lease_token)?;
        if let Some(remaining) = remaining {
            if remaining < HEARTBEAT_INTERVAL {
                self.services
                    .meta
                    .extend_lease(&claimed.lease_token, LEASE_DURATION)?;
            }
        }
        Ok(())
    }

    /// Report progress to the store (conditionally) and the bus. Two-decimal
    /// resolution; the store enforces monotonicity within an attempt.
    fn publish(&self, document: &Document, attempt: u32, progress: f64) {
        let rounded = (progress.clamp(0.0, 1.0) * 100.0).round() / 100.0;
        if let Err(err) = self
            .services
            .meta
            .update_progress(document.id, attempt, rounded)
        {
            tracing::warn!(document_id = document.id, error = %err, "progress write failed");
        }
        self.services.progress.publish(StatusSnapshot {
            document_id: document.id,
            status: DocumentStatus::Processing,
            progress: rounded,
            page_count: document.page_count,
            extracted_data: None,
            confidence_scores: None,
            error_message: None,
            processing_metadata: None,
        });
    }

    async fn finalize_failure(
        &self,
        document_id: i64,
        claimed: &ClaimedJob,
        kind: TerminalKind,
    ) -> EngineOutcome {
        let attempt = claimed.job.doc_generation;
        let marked = self
            .services
            .meta
            .fail_document(document_id, Some(attempt), kind.as_ref(), None);
        match marked {
            Ok(true) => {
                if let Ok(Some(fresh)) = self.services.meta.get_document(document_id) {
                    self.services.progress.publish(fresh.snapshot());
                }
            }
            Ok(false) => {
                tracing::debug!(document_id, "failure superseded by a newer attempt");
            }
            Err(err) => {
                tracing::error!(document_id, error = %err, "failed to mark document failed");
            }
        }
        tracing::warn!(document_id, kind = kind.as_ref(), "processing failed");
        EngineOutcome::Failed { document_id, kind }
    }
}

fn page_statuses(results: &[PageResult]) -> BTreeMap<u32, PageStatus> {
    results
        .iter()
        .map(|result| (result.index + 1, result.status))
        .collect()
}

fn job_retry_delay(delivery_attempt: u32) -> Duration {
    let shift = delivery_attempt.saturating_sub(1).min(6);
    let delay = JOB_RETRY_BASE.saturating_mul(1 << shift);
    delay.min(JOB_RETRY_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_retry_delay_doubles_and_caps() {
        assert_eq!(job_retry_delay(1), Duration::from_secs(5));
        assert_eq!(job_retry_delay(2), Duration::from_secs(10));
        assert_eq!(job_retry_delay(3), Duration::from_secs(20));
        assert_eq!(job_retry_delay(30), JOB_RETRY_CAP);
    }

    #[test]
    fn terminal_kind_names_are_the_error_codes() {
        assert_eq!(
            TerminalKind::AllPagesFailedExtraction.as_ref(),
            "AllPagesFailedExtraction"
        );
        assert_eq!(TerminalKind::DocumentTooLarge.as_ref(), "DocumentTooLarge");
        assert_eq!(TerminalKind::Cancelled.as_ref(), "Cancelled");
    }

    #[test]
    fn stage_weights_cover_the_unit_interval() {
        let total = W_LOAD + W_RASTER + W_ENHANCE + W_RESOLVE + W_EXTRACT + W_MERGE + 0.05;
        assert!((total - 1.0).abs() < 1e-9);
        assert!(P_AFTER_MERGE < 1.0);
    }
}
