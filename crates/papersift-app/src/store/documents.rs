//! Document table operations: inserts with hash dedupe, conditional state
//! transitions, listing, deletion with tombstones, and the janitor reset.

use serde::{Deserialize, Serialize};

use crate::document::{
    ConfidenceMap, Document, DocumentStatus, ProcessOptions, ProcessingMetadata,
};
use crate::store::queue::JobRecord;
use crate::store::{MetaStore, MetaStoreError, SEQ_DOCUMENT_ID, current_timestamp_ms, decode,
    doc_key, encode};

/// Fields the controller supplies when inserting a freshly uploaded document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub content_hash: String,
    pub original_filename: String,
    pub stored_filename: String,
    pub file_size: u64,
    pub blob_cid: String,
}

/// Outcome of an insert attempt keyed by content hash.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(Document),
    /// Identical bytes were uploaded before; the existing record is returned
    /// unchanged.
    Duplicate(Document),
}

impl InsertOutcome {
    pub fn into_document(self) -> Document {
        match self {
            InsertOutcome::Created(doc) | InsertOutcome::Duplicate(doc) => doc,
        }
    }
}

/// Outcome of a `StartProcessing` request.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The document was reset to Pending and a job enqueued atomically.
    Enqueued { document: Document, job: JobRecord },
    /// A job is already queued for this document; nothing was duplicated.
    AlreadyQueued { document: Document, job: JobRecord },
    /// A worker currently holds the document.
    AlreadyProcessing { document: Document },
}

#[derive(Debug, Serialize, Deserialize)]
struct TombstoneRecord {
    deleted_at_ms: i64,
}

impl MetaStore {
    pub fn insert_document(&self, new: NewDocument) -> Result<InsertOutcome, MetaStoreError> {
        debug_assert!(!new.content_hash.is_empty());
        let mut wtxn = self.env().write_txn()?;

        if let Some(raw) = self.doc_by_hash.get(&wtxn, new.content_hash.as_str())? {
            let existing_id = decode::<i64>(raw)?;
            let existing = self
                .documents
                .get(&wtxn, doc_key(existing_id).as_str())?
                .map(decode::<Document>)
                .transpose()?
                .ok_or(MetaStoreError::DocumentNotFound(existing_id))?;
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let id = self.next_seq(&mut wtxn, SEQ_DOCUMENT_ID)? as i64;
        let now_ms = current_timestamp_ms();
        let document = Document {
            id,
            content_hash: new.content_hash,
            original_filename: new.original_filename,
            stored_filename: new.stored_filename,
            file_size: new.file_size,
            page_count: 0,
            status: DocumentStatus::Pending,
            progress: 0.0,
            attempt: 0,
            extracted_fields: None,
            confidence_scores: None,
            schema_used: None,
            processing: None,
            error_message: None,
            blob_cid: new.blob_cid,
            current_worker: None,
            worker_heartbeat_ms: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };

        self.documents
            .put(&mut wtxn, doc_key(id).as_str(), &encode(&document)?)?;
        self.doc_by_hash
            .put(&mut wtxn, document.content_hash.as_str(), &encode(&id)?)?;
        wtxn.commit()?;
        Ok(InsertOutcome::Created(document))
    }

    pub fn get_document(&self, id: i64) -> Result<Option<Document>, MetaStoreError> {
        let rtxn = self.env().read_txn()?;
        let value = self.documents.get(&rtxn, doc_key(id).as_str())?;
        value.map(decode::<Document>).transpose()
    }

    pub fn find_by_hash(&self, hash: &str) -> Result<Option<Document>, MetaStoreError> {
        let rtxn = self.env().read_txn()?;
        let Some(raw) = self.doc_by_hash.get(&rtxn, hash)? else {
            return Ok(None);
        };
        let id = decode::<i64>(raw)?;
        self.documents
            .get(&rtxn, doc_key(id).as_str())?
            .map(decode::<Document>)
            .transpose()
    }

    /// List documents ordered by creation, newest first (ids are assigned
    /// monotonically, so reverse id order is creation order with the id as
    /// the stable tiebreaker).
    pub fn list_documents(
        &self,
        skip: usize,
        limit: usize,
        status: Option<DocumentStatus>,
    ) -> Result<(usize, Vec<Document>), MetaStoreError> {
        debug_assert!(limit >= 1);
        let rtxn = self.env().read_txn()?;
        let mut total = 0_usize;
        let mut out = Vec::new();
        for entry in self.documents.rev_iter(&rtxn)? {
            let (_, raw) = entry?;
            let document = decode::<Document>(raw)?;
            if let Some(wanted) = status {
                if document.status != wanted {
                    continue;
                }
            }
            if total >= skip && out.len() < limit {
                out.push(document);
            }
            total += 1;
        }
        Ok((total, out))
    }

    /// Claim the `Pending → Processing` transition for one worker. Returns
    /// `None` when another worker won the race or the document is gone.
    pub fn begin_processing(
        &self,
        id: i64,
        worker: &str,
    ) -> Result<Option<Document>, MetaStoreError> {
        let mut wtxn = self.env().write_txn()?;
        let Some(raw) = self.documents.get(&wtxn, doc_key(id).as_str())? else {
            return Ok(None);
        };
        let mut document = decode::<Document>(raw)?;
        if document.status != DocumentStatus::Pending || document.current_worker.is_some() {
            return Ok(None);
        }
        let now_ms = current_timestamp_ms();
        document.status = DocumentStatus::Processing;
        document.progress = 0.0;
        document.error_message = None;
        document.current_worker = Some(worker.to_string());
        document.worker_heartbeat_ms = now_ms;
        document.updated_at_ms = now_ms;
        self.documents
            .put(&mut wtxn, doc_key(id).as_str(), &encode(&document)?)?;
        wtxn.commit()?;
        Ok(Some(document))
    }

    /// Conditional progress write; a stale worker (older attempt) is a no-op.
    /// Progress never moves backwards within an attempt.
    pub fn update_progress(
        &self,
        id: i64,
        attempt: u32,
        progress: f64,
    ) -> Result<bool, MetaStoreError> {
        self.mutate_processing(id, attempt, |document, now_ms| {
            document.progress = document.progress.max(progress.clamp(0.0, 1.0));
            document.worker_heartbeat_ms = now_ms;
        })
    }

    pub fn record_page_count(
        &self,
        id: i64,
        attempt: u32,
        page_count: u32,
    ) -> Result<bool, MetaStoreError> {
        self.mutate_processing(id, attempt, |document, now_ms| {
            document.page_count = page_count;
            document.worker_heartbeat_ms = now_ms;
        })
    }

    pub fn heartbeat(&self, id: i64, attempt: u32) -> Result<bool, MetaStoreError> {
        self.mutate_processing(id, attempt, |document, now_ms| {
            document.worker_heartbeat_ms = now_ms;
        })
    }

    /// Return a Processing document to Pending so its requeued job can claim
    /// it again after a transient fault. Conditional on the attempt, so a
    /// newer generation is never disturbed.
    pub fn release_processing(&self, id: i64, attempt: u32) -> Result<bool, MetaStoreError> {
        self.mutate_processing(id, attempt, |document, _| {
            document.status = DocumentStatus::Pending;
            document.progress = 0.0;
            document.current_worker = None;
        })
    }

    pub fn complete_document(
        &self,
        id: i64,
        attempt: u32,
        fields_json: String,
        confidence: ConfidenceMap,
        schema_used: String,
        metadata: ProcessingMetadata,
    ) -> Result<bool, MetaStoreError> {
        self.mutate_processing(id, attempt, move |document, _| {
            document.status = DocumentStatus::Completed;
            document.progress = 1.0;
            document.extracted_fields = Some(fields_json.clone());
            document.confidence_scores = Some(confidence.clone());
            document.schema_used = Some(schema_used.clone());
            document.processing = Some(metadata.clone());
            document.error_message = None;
            document.current_worker = None;
        })
    }

    pub fn fail_document(
        &self,
        id: i64,
        attempt: Option<u32>,
        error: &str,
        metadata: Option<ProcessingMetadata>,
    ) -> Result<bool, MetaStoreError> {
        debug_assert!(!error.is_empty());
        let mut wtxn = self.env().write_txn()?;
        let Some(raw) = self.documents.get(&wtxn, doc_key(id).as_str())? else {
            return Ok(false);
        };
        let mut document = decode::<Document>(raw)?;
        if let Some(expected) = attempt {
            if document.attempt != expected {
                return Ok(false);
            }
        }
        // An attempt-less failure comes from queue exhaustion; it must not
        // clobber results that another delivery already persisted.
        if attempt.is_none() && document.status == DocumentStatus::Completed {
            return Ok(false);
        }
        document.status = DocumentStatus::Failed;
        document.error_message = Some(error.to_string());
        if let Some(meta) = metadata {
            document.processing = Some(meta);
        }
        document.current_worker = None;
        document.updated_at_ms = current_timestamp_ms();
        self.documents
            .put(&mut wtxn, doc_key(id).as_str(), &encode(&document)?)?;
        wtxn.commit()?;
        Ok(true)
    }

    /// Reset the document and enqueue a job in one transaction. The worker can
    /// therefore never observe a Pending document without a matching queue
    /// entry.
    pub fn start_processing(
        &self,
        id: i64,
        options: ProcessOptions,
    ) -> Result<StartOutcome, MetaStoreError> {
        let mut wtxn = self.env().write_txn()?;
        let Some(raw) = self.documents.get(&wtxn, doc_key(id).as_str())? else {
            return Err(MetaStoreError::DocumentNotFound(id));
        };
        let mut document = decode::<Document>(raw)?;

        if let Some(job) = self.active_job_in(&wtxn, id)? {
            return Ok(StartOutcome::AlreadyQueued { document, job });
        }
        if document.status == DocumentStatus::Processing {
            return Ok(StartOutcome::AlreadyProcessing { document });
        }

        let now_ms = current_timestamp_ms();
        document.status = DocumentStatus::Pending;
        document.progress = 0.0;
        document.error_message = None;
        document.current_worker = None;
        document.attempt += 1;
        document.updated_at_ms = now_ms;
        self.documents
            .put(&mut wtxn, doc_key(id).as_str(), &encode(&document)?)?;

        let job = self.enqueue_in(&mut wtxn, &document, options, now_ms)?;
        wtxn.commit()?;
        Ok(StartOutcome::Enqueued { document, job })
    }

    /// Remove the document row and hash index. A job still leased by a live
    /// worker is left in place behind a tombstone; an unclaimed job is
    /// deleted outright. Returns the removed record so the caller can
    /// tombstone the blob.
    pub fn delete_document(&self, id: i64) -> Result<Option<Document>, MetaStoreError> {
        let mut wtxn = self.env().write_txn()?;
        let Some(raw) = self.documents.get(&wtxn, doc_key(id).as_str())? else {
            return Ok(None);
        };
        let document = decode::<Document>(raw)?;
        self.documents.delete(&mut wtxn, doc_key(id).as_str())?;
        self.doc_by_hash
            .delete(&mut wtxn, document.content_hash.as_str())?;

        let now_ms = current_timestamp_ms();
        let mut needs_tombstone = document.status == DocumentStatus::Processing;
        if let Some(job) = self.active_job_in(&wtxn, id)? {
            let leased = job
                .lease
                .as_ref()
                .is_some_and(|lease| lease.expires_at_ms > now_ms);
            if leased {
                needs_tombstone = true;
            } else {
                self.jobs.delete(&mut wtxn, job.key.as_str())?;
                self.job_by_doc.delete(&mut wtxn, doc_key(id).as_str())?;
            }
        }
        if needs_tombstone {
            let record = TombstoneRecord {
                deleted_at_ms: now_ms,
            };
            self.tombstones
                .put(&mut wtxn, doc_key(id).as_str(), &encode(&record)?)?;
        }
        wtxn.commit()?;
        Ok(Some(document))
    }

    pub fn is_tombstoned(&self, id: i64) -> Result<bool, MetaStoreError> {
        let rtxn = self.env().read_txn()?;
        Ok(self.tombstones.get(&rtxn, doc_key(id).as_str())?.is_some())
    }

    pub fn clear_tombstone(&self, id: i64) -> Result<(), MetaStoreError> {
        let mut wtxn = self.env().write_txn()?;
        self.tombstones.delete(&mut wtxn, doc_key(id).as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    /// Janitor sweep: documents stuck in Processing with a stale heartbeat go
    /// back to Pending and their jobs become claimable again.
    pub fn reset_stale_processing(
        &self,
        heartbeat_timeout_ms: i64,
    ) -> Result<Vec<i64>, MetaStoreError> {
        debug_assert!(heartbeat_timeout_ms > 0);
        let now_ms = current_timestamp_ms();
        let cutoff_ms = now_ms.saturating_sub(heartbeat_timeout_ms);
        let mut wtxn = self.env().write_txn()?;
        let mut reset = Vec::new();

        let stale: Vec<Document> = {
            let mut found = Vec::new();
            for entry in self.documents.iter(&wtxn)? {
                let (_, raw) = entry?;
                let document = decode::<Document>(raw)?;
                if document.status == DocumentStatus::Processing
                    && document.worker_heartbeat_ms <= cutoff_ms
                {
                    found.push(document);
                }
            }
            found
        };

        for mut document in stale {
            let id = document.id;
            document.status = DocumentStatus::Pending;
            document.progress = 0.0;
            document.current_worker = None;
            document.updated_at_ms = now_ms;
            self.documents
                .put(&mut wtxn, doc_key(id).as_str(), &encode(&document)?)?;

            if let Some(mut job) = self.active_job_in(&wtxn, id)? {
                job.lease = None;
                job.visible_at_ms = now_ms;
                let encoded = encode(&job)?;
                self.jobs.put(&mut wtxn, job.key.as_str(), &encoded)?;
            }
            reset.push(id);
        }
        wtxn.commit()?;
        Ok(reset)
    }

    fn mutate_processing<F>(&self, id: i64, attempt: u32, apply: F) -> Result<bool, MetaStoreError>
    where
        F: FnOnce(&mut Document, i64),
    {
        let mut wtxn = self.env().write_txn()?;
        let Some(raw) = self.documents.get(&wtxn, doc_key(id).as_str())? else {
            return Ok(false);
        };
        let mut document = decode::<Document>(raw)?;
        if document.status != DocumentStatus::Processing || document.attempt != attempt {
            return Ok(false);
        }
        let now_ms = current_timestamp_ms();
        apply(&mut document, now_ms);
        document.updated_at_ms = now_ms;
        self.documents
            .put(&mut wtxn, doc_key(id).as_str(), &encode(&document)?)?;
        wtxn.commit()?;
        Ok(true)
    }
}
