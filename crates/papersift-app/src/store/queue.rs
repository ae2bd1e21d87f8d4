//! Durable job queue stored beside the documents it schedules.
//!
//! FIFO per enqueue order, at-least-once delivery through time-bounded
//! leases, a per-job attempt counter with a hard ceiling, and visibility
//! delays for backoff. The queue piggybacks on the document environment so
//! enqueues commit atomically with document state resets.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use uuid::Uuid;

use crate::document::{Document, ProcessOptions};
use crate::store::{MetaStore, MetaStoreError, SEQ_JOB_KEY, current_timestamp_ms, decode,
    doc_key, encode, numeric_key};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE: Duration = Duration::from_secs(120);
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// The exclusive, time-bounded right for one worker to process one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseState {
    pub token: String,
    pub worker: String,
    pub expires_at_ms: i64,
}

/// One queue entry requesting that a document be advanced through the
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// FIFO ordering key (zero-padded sequence number).
    pub key: String,
    pub job_id: String,
    pub document_id: i64,
    /// The document generation this job was enqueued for; a mismatch means
    /// the job is stale and must be dropped.
    pub doc_generation: u32,
    /// Queue delivery attempts consumed so far.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub enqueued_at_ms: i64,
    pub visible_at_ms: i64,
    #[serde(default)]
    pub lease: Option<LeaseState>,
    pub options: ProcessOptions,
}

/// A job handed to a worker together with its lease token.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JobRecord,
    pub lease_token: String,
}

/// What a negative acknowledgement did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job went back to the queue, visible after the given delay.
    Requeued { attempt: u32 },
    /// The retry budget is spent; the job was removed and the caller must
    /// mark the document failed.
    Exhausted { document_id: i64 },
    UnknownToken,
}

impl MetaStore {
    /// Insert a job inside an already-open write transaction (the
    /// `StartProcessing` path).
    pub(crate) fn enqueue_in(
        &self,
        wtxn: &mut heed::RwTxn,
        document: &Document,
        options: ProcessOptions,
        now_ms: i64,
    ) -> Result<JobRecord, MetaStoreError> {
        let key = numeric_key(self.next_seq(wtxn, SEQ_JOB_KEY)?);
        let job = JobRecord {
            key: key.clone(),
            job_id: Uuid::new_v4().to_string(),
            document_id: document.id,
            doc_generation: document.attempt,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at_ms: now_ms,
            visible_at_ms: now_ms,
            lease: None,
            options,
        };
        self.jobs.put(wtxn, key.as_str(), &encode(&job)?)?;
        self.job_by_doc
            .put(wtxn, doc_key(document.id).as_str(), &encode(&key)?)?;
        Ok(job)
    }

    pub(crate) fn active_job_in(
        &self,
        txn: &heed::RoTxn,
        document_id: i64,
    ) -> Result<Option<JobRecord>, MetaStoreError> {
        let Some(raw) = self.job_by_doc.get(txn, doc_key(document_id).as_str())? else {
            return Ok(None);
        };
        let key = decode::<String>(raw)?;
        self.jobs
            .get(txn, key.as_str())?
            .map(decode::<JobRecord>)
            .transpose()
    }

    pub fn active_job_for(&self, document_id: i64) -> Result<Option<JobRecord>, MetaStoreError> {
        let rtxn = self.env().read_txn()?;
        self.active_job_in(&rtxn, document_id)
    }

    /// Take the first visible, unleased job in FIFO order, attaching a fresh
    /// lease. Expired leases are treated as free.
    pub fn claim_job(
        &self,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, MetaStoreError> {
        debug_assert!(!worker.is_empty());
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.env().write_txn()?;

        let candidate: Option<JobRecord> = {
            let mut found = None;
            for entry in self.jobs.iter(&wtxn)? {
                let (_, raw) = entry?;
                let job = decode::<JobRecord>(raw)?;
                if job.visible_at_ms > now_ms {
                    continue;
                }
                if job
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.expires_at_ms > now_ms)
                {
                    continue;
                }
                found = Some(job);
                break;
            }
            found
        };

        let Some(mut job) = candidate else {
            return Ok(None);
        };

        let token = Uuid::new_v4().to_string();
        job.attempt += 1;
        job.lease = Some(LeaseState {
            token: token.clone(),
            worker: worker.to_string(),
            expires_at_ms: now_ms + lease.as_millis() as i64,
        });
        self.jobs.put(&mut wtxn, job.key.as_str(), &encode(&job)?)?;
        wtxn.commit()?;
        Ok(Some(ClaimedJob {
            job,
            lease_token: token,
        }))
    }

    /// Blocking claim with a deadline; polls because LMDB has no wakeups.
    pub async fn claim_job_blocking(
        &self,
        worker: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<Option<ClaimedJob>, MetaStoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(claimed) = self.claim_job(worker, lease)? {
                return Ok(Some(claimed));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(CLAIM_POLL_INTERVAL).await;
        }
    }

    /// Remove a job delivered under the given lease token.
    pub fn ack_job(&self, token: &str) -> Result<bool, MetaStoreError> {
        let mut wtxn = self.env().write_txn()?;
        let Some(job) = self.job_by_token_in(&wtxn, token)? else {
            return Ok(false);
        };
        self.jobs.delete(&mut wtxn, job.key.as_str())?;
        self.job_by_doc
            .delete(&mut wtxn, doc_key(job.document_id).as_str())?;
        wtxn.commit()?;
        Ok(true)
    }

    /// Return a job to the queue, or retire it once the attempt budget is
    /// spent.
    pub fn nack_job(
        &self,
        token: &str,
        delay: Option<Duration>,
    ) -> Result<NackOutcome, MetaStoreError> {
        let mut wtxn = self.env().write_txn()?;
        let Some(mut job) = self.job_by_token_in(&wtxn, token)? else {
            return Ok(NackOutcome::UnknownToken);
        };

        if job.attempt >= job.max_attempts {
            self.jobs.delete(&mut wtxn, job.key.as_str())?;
            self.job_by_doc
                .delete(&mut wtxn, doc_key(job.document_id).as_str())?;
            wtxn.commit()?;
            return Ok(NackOutcome::Exhausted {
                document_id: job.document_id,
            });
        }

        let now_ms = current_timestamp_ms();
        job.lease = None;
        job.visible_at_ms = now_ms + delay.unwrap_or_default().as_millis() as i64;
        let attempt = job.attempt;
        self.jobs.put(&mut wtxn, job.key.as_str(), &encode(&job)?)?;
        wtxn.commit()?;
        Ok(NackOutcome::Requeued { attempt })
    }

    pub fn extend_lease(
        &self,
        token: &str,
        extension: Duration,
    ) -> Result<bool, MetaStoreError> {
        let mut wtxn = self.env().write_txn()?;
        let Some(mut job) = self.job_by_token_in(&wtxn, token)? else {
            return Ok(false);
        };
        let now_ms = current_timestamp_ms();
        if let Some(lease) = job.lease.as_mut() {
            lease.expires_at_ms = now_ms + extension.as_millis() as i64;
        } else {
            return Ok(false);
        }
        self.jobs.put(&mut wtxn, job.key.as_str(), &encode(&job)?)?;
        wtxn.commit()?;
        Ok(true)
    }

    pub fn lease_remaining(&self, token: &str) -> Result<Option<Duration>, MetaStoreError> {
        let rtxn = self.env().read_txn()?;
        let mut remaining = None;
        for entry in self.jobs.iter(&rtxn)? {
            let (_, raw) = entry?;
            let job = decode::<JobRecord>(raw)?;
            if let Some(lease) = &job.lease {
                if lease.token == token {
                    let now_ms = current_timestamp_ms();
                    let left = (lease.expires_at_ms - now_ms).max(0);
                    remaining = Some(Duration::from_millis(left as u64));
                    break;
                }
            }
        }
        Ok(remaining)
    }

    pub fn queued_job_count(&self) -> Result<usize, MetaStoreError> {
        let rtxn = self.env().read_txn()?;
        let mut count = 0_usize;
        for entry in self.jobs.iter(&rtxn)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn job_by_token_in(
        &self,
        txn: &heed::RoTxn,
        token: &str,
    ) -> Result<Option<JobRecord>, MetaStoreError> {
        for entry in self.jobs.iter(txn)? {
            let (_, raw) = entry?;
            let job = decode::<JobRecord>(raw)?;
            if job
                .lease
                .as_ref()
                .is_some_and(|lease| lease.token == token)
            {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SchemaSelector;
    use crate::paths::AppPaths;
    use crate::store::NewDocument;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> MetaStore {
        let paths = AppPaths::new(temp.path()).expect("paths");
        MetaStore::open(&paths).expect("open store")
    }

    fn insert_and_queue(store: &MetaStore, hash: &str) -> i64 {
        let doc = store
            .insert_document(NewDocument {
                content_hash: hash.to_string(),
                original_filename: "doc.pdf".to_string(),
                stored_filename: format!("ts_{hash}.pdf"),
                file_size: 100,
                blob_cid: hash.to_string(),
            })
            .expect("insert")
            .into_document();
        store
            .start_processing(doc.id, ProcessOptions::default())
            .expect("start");
        doc.id
    }

    #[test]
    fn claims_come_back_in_fifo_order() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        let first = insert_and_queue(&store, "f1f1");
        let second = insert_and_queue(&store, "f2f2");

        let a = store
            .claim_job("w", DEFAULT_LEASE)
            .expect("claim")
            .expect("job available");
        let b = store
            .claim_job("w", DEFAULT_LEASE)
            .expect("claim")
            .expect("job available");
        assert_eq!(a.job.document_id, first);
        assert_eq!(b.job.document_id, second);
        assert!(store.claim_job("w", DEFAULT_LEASE).expect("claim").is_none());
    }

    #[test]
    fn leased_jobs_are_invisible_until_expiry() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        insert_and_queue(&store, "abcd");

        let claimed = store
            .claim_job("w1", Duration::from_millis(20))
            .expect("claim")
            .expect("job");
        assert!(
            store
                .claim_job("w2", DEFAULT_LEASE)
                .expect("claim")
                .is_none(),
            "lease hides the job"
        );

        std::thread::sleep(Duration::from_millis(40));
        let reclaimed = store
            .claim_job("w2", DEFAULT_LEASE)
            .expect("claim")
            .expect("expired lease is claimable");
        assert_eq!(reclaimed.job.job_id, claimed.job.job_id);
        assert_eq!(reclaimed.job.attempt, 2, "re-delivery counts an attempt");
    }

    #[test]
    fn ack_removes_job_and_doc_binding() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        let id = insert_and_queue(&store, "e0e0");

        let claimed = store
            .claim_job("w", DEFAULT_LEASE)
            .expect("claim")
            .expect("job");
        assert!(store.ack_job(&claimed.lease_token).expect("ack"));
        assert_eq!(store.queued_job_count().expect("count"), 0);
        assert!(store.active_job_for(id).expect("lookup").is_none());
    }

    #[test]
    fn nack_requeues_with_delay_then_exhausts() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        let id = insert_and_queue(&store, "d0d0");

        for expected_attempt in 1..=DEFAULT_MAX_ATTEMPTS {
            let claimed = store
                .claim_job("w", DEFAULT_LEASE)
                .expect("claim")
                .expect("job");
            assert_eq!(claimed.job.attempt, expected_attempt);
            let outcome = store
                .nack_job(&claimed.lease_token, None)
                .expect("nack");
            if expected_attempt < DEFAULT_MAX_ATTEMPTS {
                assert_eq!(
                    outcome,
                    NackOutcome::Requeued {
                        attempt: expected_attempt
                    }
                );
            } else {
                assert_eq!(outcome, NackOutcome::Exhausted { document_id: id });
            }
        }
        assert_eq!(store.queued_job_count().expect("count"), 0);
    }

    #[test]
    fn nack_delay_defers_visibility() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        insert_and_queue(&store, "c0c0");

        let claimed = store
            .claim_job("w", DEFAULT_LEASE)
            .expect("claim")
            .expect("job");
        store
            .nack_job(&claimed.lease_token, Some(Duration::from_millis(60)))
            .expect("nack");
        assert!(
            store.claim_job("w", DEFAULT_LEASE).expect("claim").is_none(),
            "delayed job is not yet visible"
        );
        std::thread::sleep(Duration::from_millis(80));
        assert!(store.claim_job("w", DEFAULT_LEASE).expect("claim").is_some());
    }

    #[test]
    fn extend_lease_pushes_expiry() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        insert_and_queue(&store, "b0b0");

        let claimed = store
            .claim_job("w", Duration::from_millis(30))
            .expect("claim")
            .expect("job");
        assert!(store
            .extend_lease(&claimed.lease_token, Duration::from_secs(60))
            .expect("extend"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(
            store.claim_job("x", DEFAULT_LEASE).expect("claim").is_none(),
            "extended lease still hides the job"
        );
        let remaining = store
            .lease_remaining(&claimed.lease_token)
            .expect("remaining")
            .expect("lease exists");
        assert!(remaining > Duration::from_secs(30));
    }

    #[test]
    fn second_start_is_not_duplicated() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        let id = insert_and_queue(&store, "a0a0");

        match store
            .start_processing(id, ProcessOptions {
                schema: SchemaSelector::Named("invoice".to_string()),
                template_mode: false,
            })
            .expect("start")
        {
            crate::store::StartOutcome::AlreadyQueued { job, .. } => {
                assert_eq!(job.document_id, id);
            }
            other => panic!("expected AlreadyQueued, got {other:?}"),
        }
        assert_eq!(store.queued_job_count().expect("count"), 1);
    }
}
