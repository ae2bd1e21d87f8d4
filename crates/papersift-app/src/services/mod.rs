//! IO-bound capability services. Modules here coordinate external systems
//! (storage, the vision endpoint, rasterization); pure transforms live in
//! dedicated modules like `pipeline::merge` so concurrency and resource
//! accounting stay localized.

pub mod blob_store;
pub mod context;
pub mod enhance;
pub mod ocr;
pub mod progress;
pub mod raster;
pub mod vision;

pub use blob_store::{BlobError, BlobMeta, BlobStore, Cid, FsBlobStore, PutResult, blake3_cid,
    validate_cid};
pub use context::{BuildError, GenericRateLimiter, MAX_PER_PAGE_RETRIES, Services, build_services};
pub use enhance::{EncodedImage, EnhanceError, MAX_EDGE, enhance_page};
pub use ocr::{OcrError, OcrFallback, VisionOcr};
pub use progress::ProgressBus;
pub use raster::{PageImage, PdfiumRasterizer, RasterError, Rasterizer};
pub use vision::{ChatClient, DEFAULT_FIELD_CONFIDENCE, OpenAiVision, PageExtraction,
    SchemaDetection, VisionError, VisionExtractor};
