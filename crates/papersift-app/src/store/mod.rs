//! LMDB-backed metadata store shared by the API and worker processes.
//!
//! One environment, several named databases: `documents` (zero-padded id
//! keys, so iteration order is id order), `doc_by_hash` (content hash →
//! document id), `jobs` (zero-padded FIFO sequence keys), `job_by_doc`
//! (document id → job key, enforcing one active job per document),
//! `tombstones` (document id → deletion timestamp), and `seq` (counters).
//!
//! Multi-record operations run inside a single write transaction; that is
//! what makes "reset the document to Pending and enqueue its job" atomic.

mod documents;
mod queue;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::paths::{AppPaths, PathError};

pub use documents::{InsertOutcome, NewDocument, StartOutcome};
pub use queue::{ClaimedJob, JobRecord, LeaseState, NackOutcome};

const META_ENV_MAP_SIZE_BYTES: usize = 1 << 30; // 1 GiB
const MAX_DBS: u32 = 8;

pub(crate) const SEQ_DOCUMENT_ID: &str = "document_id";
pub(crate) const SEQ_JOB_KEY: &str = "job_key";

/// Errors emitted by the metadata store.
#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("document `{0}` not found")]
    DocumentNotFound(i64),
}

/// Shared LMDB environment for documents, jobs, and tombstones.
#[derive(Debug)]
pub struct MetaStore {
    env: Env,
    pub(crate) documents: Database<Str, Bytes>,
    pub(crate) doc_by_hash: Database<Str, Bytes>,
    pub(crate) jobs: Database<Str, Bytes>,
    pub(crate) job_by_doc: Database<Str, Bytes>,
    pub(crate) tombstones: Database<Str, Bytes>,
    pub(crate) seq: Database<Str, Bytes>,
}

impl MetaStore {
    pub fn open(paths: &AppPaths) -> Result<Self, MetaStoreError> {
        let path = paths.meta_lmdb_dir()?;
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self, MetaStoreError> {
        let mut options = EnvOpenOptions::new();
        options.max_dbs(MAX_DBS);
        options.map_size(META_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let documents = env.create_database::<Str, Bytes>(&mut wtxn, Some("documents"))?;
        let doc_by_hash = env.create_database::<Str, Bytes>(&mut wtxn, Some("doc_by_hash"))?;
        let jobs = env.create_database::<Str, Bytes>(&mut wtxn, Some("jobs"))?;
        let job_by_doc = env.create_database::<Str, Bytes>(&mut wtxn, Some("job_by_doc"))?;
        let tombstones = env.create_database::<Str, Bytes>(&mut wtxn, Some("tombstones"))?;
        let seq = env.create_database::<Str, Bytes>(&mut wtxn, Some("seq"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            documents,
            doc_by_hash,
            jobs,
            job_by_doc,
            tombstones,
            seq,
        })
    }

    pub(crate) fn env(&self) -> &Env {
        &self.env
    }

    /// Allocate the next value of a named sequence inside an open write
    /// transaction. Sequences start at 1.
    pub(crate) fn next_seq(
        &self,
        wtxn: &mut heed::RwTxn,
        name: &str,
    ) -> Result<u64, MetaStoreError> {
        let current = match self.seq.get(wtxn, name)? {
            Some(raw) => decode::<u64>(raw)?,
            None => 0,
        };
        let next = current + 1;
        self.seq.put(wtxn, name, &encode(&next)?)?;
        Ok(next)
    }
}

/// Zero-padded decimal key so lexicographic LMDB order matches numeric order.
pub(crate) fn numeric_key(value: u64) -> String {
    format!("{value:020}")
}

pub(crate) fn doc_key(id: i64) -> String {
    debug_assert!(id > 0);
    numeric_key(id as u64)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MetaStoreError> {
    Ok(encode_to_vec(value, config::standard())?)
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, MetaStoreError> {
    let (value, _) = decode_from_slice::<T, _>(raw, config::standard())?;
    Ok(value)
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}
