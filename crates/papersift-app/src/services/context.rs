//! The explicitly-constructed service aggregate threaded through the
//! controller, pipeline, and worker pool. No global mutable state: everything
//! a component touches arrives through this struct.

use std::sync::Arc;
use std::time::Duration;

use backon::ExponentialBuilder;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use thiserror::Error;

use crate::config::{AppConfig, BlobBackend};
use crate::paths::{AppPaths, PathError};
use crate::schema::SchemaRegistry;
use crate::services::blob_store::{BlobStore, FsBlobStore};
use crate::services::ocr::{OcrFallback, VisionOcr};
use crate::services::progress::ProgressBus;
use crate::services::raster::{PdfiumRasterizer, Rasterizer};
use crate::services::vision::{ChatClient, OpenAiVision, VisionError, VisionExtractor};
use crate::store::{MetaStore, MetaStoreError};

pub type GenericRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-page retry budget on top of the first call.
pub const MAX_PER_PAGE_RETRIES: usize = 2;
const RETRY_MIN_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] MetaStoreError),
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error("storage backend `s3` is not available in this build; use `local`")]
    S3Unavailable,
}

/// Everything the engine and controller need, built once at startup.
pub struct Services {
    pub config: AppConfig,
    pub meta: Arc<MetaStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub vision: Arc<dyn VisionExtractor>,
    pub ocr: Arc<dyn OcrFallback>,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub schemas: SchemaRegistry,
    pub progress: Arc<ProgressBus>,
    pub backoff: ExponentialBuilder,
}

impl Services {
    /// Backoff builder for per-page model retries: 1s, 2s, ... capped at 30s,
    /// at most [`MAX_PER_PAGE_RETRIES`] retries after the initial call.
    pub fn page_retry_backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(RETRY_MIN_DELAY)
            .with_factor(2.0)
            .with_max_delay(RETRY_MAX_DELAY)
            .with_max_times(MAX_PER_PAGE_RETRIES)
    }
}

/// Wire the production service graph from configuration.
pub fn build_services(config: AppConfig, paths: &AppPaths) -> Result<Arc<Services>, BuildError> {
    let meta = Arc::new(MetaStore::open(paths)?);

    let blobs: Arc<dyn BlobStore> = match config.storage.backend {
        BlobBackend::Local => {
            let root = match &config.storage.path {
                Some(path) => path.clone(),
                None => paths.blobs_dir()?,
            };
            Arc::new(FsBlobStore::new(root))
        }
        BlobBackend::S3 => return Err(BuildError::S3Unavailable),
    };

    let quota = Quota::per_minute(config.vision.rate_limit_per_minute);
    let limiter = Arc::new(RateLimiter::direct(quota));

    let api_key = config.vision.api_key.clone().unwrap_or_default();
    let call_timeout = Duration::from_secs(config.processing.page_call_timeout_seconds);
    let chat = ChatClient::new(
        &config.vision.base_url,
        api_key,
        call_timeout,
        Some(limiter.clone()),
    )?;
    let vision = Arc::new(OpenAiVision::new(chat.clone(), config.vision.model.clone()));
    let ocr = Arc::new(VisionOcr::new(chat, config.vision.ocr_model().to_string()));

    Ok(Arc::new(Services {
        config,
        meta,
        blobs,
        vision,
        ocr,
        rasterizer: Arc::new(PdfiumRasterizer),
        schemas: SchemaRegistry::new(),
        progress: Arc::new(ProgressBus::new()),
        backoff: Services::page_retry_backoff(),
    }))
}
