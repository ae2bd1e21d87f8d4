//! Application-level error type shared across binaries and services.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::controller::ControllerError;
use crate::excel::WorkbookError;
use crate::paths::PathError;
use crate::services::blob_store::BlobError;
use crate::services::context::BuildError;
use crate::services::ocr::OcrError;
use crate::services::raster::RasterError;
use crate::services::vision::VisionError;
use crate::store::MetaStoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Store(#[from] MetaStoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Workbook(#[from] WorkbookError),
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
