//! Controller flows against the real stores: upload boundaries, deduplication,
//! deletion semantics, and spreadsheet downloads.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use tempfile::TempDir;

use papersift_app::config::{
    AppConfig, BlobBackend, CorsConfig, ProcessingConfig, RateLimitConfig, ServerConfig,
    StorageConfig, UploadConfig, VisionConfig,
};
use papersift_app::controller::{Controller, ControllerError};
use papersift_app::document::{ConfidenceMap, DocumentStatus, ProcessingMetadata};
use papersift_app::paths::AppPaths;
use papersift_app::schema::{Schema, SchemaRegistry};
use papersift_app::services::{
    BlobStore, EncodedImage, FsBlobStore, OcrError, OcrFallback, PageExtraction, PageImage,
    ProgressBus, RasterError, Rasterizer, SchemaDetection, Services, VisionError,
    VisionExtractor,
};
use papersift_app::store::MetaStore;

const UPLOAD_LIMIT: u64 = 4_096;

struct IdleVision;

#[async_trait]
impl VisionExtractor for IdleVision {
    async fn extract(
        &self,
        _image: &EncodedImage,
        _schema: &Schema,
    ) -> Result<PageExtraction, VisionError> {
        Err(VisionError::Unavailable { status: 503 })
    }

    async fn identify(
        &self,
        _image: &EncodedImage,
        _known_types: &[&str],
        _hint: Option<&str>,
    ) -> Result<SchemaDetection, VisionError> {
        Ok(SchemaDetection {
            schema_name: "receipt".to_string(),
            confidence: 0.5,
            suggested_fields: vec!["total".to_string()],
        })
    }

    fn model_id(&self) -> String {
        "idle-model".to_string()
    }
}

struct IdleOcr;

#[async_trait]
impl OcrFallback for IdleOcr {
    async fn transcribe(&self, _image: &EncodedImage) -> Result<String, OcrError> {
        Err(OcrError::EmptyTranscription)
    }
}

struct IdleRasterizer;

impl Rasterizer for IdleRasterizer {
    fn page_count(&self, _bytes: &[u8]) -> Result<u32, RasterError> {
        Ok(1)
    }

    fn rasterize(
        &self,
        _bytes: &[u8],
        _target_width: u32,
        _max_pages: u32,
    ) -> Result<Vec<PageImage>, RasterError> {
        Ok(Vec::new())
    }
}

struct Harness {
    _temp: TempDir,
    services: Arc<Services>,
    controller: Controller,
}

fn harness() -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("paths");
    let meta = Arc::new(MetaStore::open(&paths).expect("store opens"));
    let blobs = Arc::new(FsBlobStore::new(paths.blobs_dir().expect("blob dir")));

    let services = Arc::new(Services {
        config: AppConfig {
            server: ServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                cors: CorsConfig::default(),
                rate_limit: RateLimitConfig::default(),
            },
            storage: StorageConfig {
                backend: BlobBackend::Local,
                path: None,
                s3: None,
            },
            upload: UploadConfig {
                max_upload_bytes: UPLOAD_LIMIT,
            },
            processing: ProcessingConfig {
                max_pages: 100,
                worker_concurrency: 1,
                timeout_seconds: 3_600,
                page_call_timeout_seconds: 5,
                render_width: 512,
            },
            vision: VisionConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                model: "idle-model".to_string(),
                api_key: Some("unused".to_string()),
                ocr_model: None,
                rate_limit_per_minute: NonZeroU32::new(600).expect("non-zero"),
            },
        },
        meta,
        blobs,
        vision: Arc::new(IdleVision),
        ocr: Arc::new(IdleOcr),
        rasterizer: Arc::new(IdleRasterizer),
        schemas: SchemaRegistry::new(),
        progress: Arc::new(ProgressBus::new()),
        backoff: ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_times(1),
    });
    let controller = Controller::new(services.clone());
    Harness {
        _temp: temp,
        services,
        controller,
    }
}

fn pdf_of_size(size: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.7 ".to_vec();
    bytes.resize(size, b'x');
    bytes
}

/// Simulate a worker completing a document so download paths can run.
fn mark_completed(harness: &Harness, id: i64, fields_json: &str) {
    let document = harness
        .services
        .meta
        .start_processing(id, Default::default())
        .expect("start");
    let document = match document {
        papersift_app::store::StartOutcome::Enqueued { document, .. } => document,
        other => panic!("expected enqueue, got {other:?}"),
    };
    harness
        .services
        .meta
        .begin_processing(id, "test-worker")
        .expect("begin")
        .expect("claimed");
    let claimed = harness
        .services
        .meta
        .claim_job("test-worker", Duration::from_secs(60))
        .expect("claim")
        .expect("job");
    assert!(
        harness
            .services
            .meta
            .complete_document(
                id,
                document.attempt,
                fields_json.to_string(),
                ConfidenceMap::from([("total".to_string(), 0.9)]),
                "invoice".to_string(),
                ProcessingMetadata::default(),
            )
            .expect("complete")
    );
    harness
        .services
        .meta
        .ack_job(&claimed.lease_token)
        .expect("ack");
}

#[tokio::test]
async fn upload_boundary_is_exact() {
    let harness = harness();

    let at_limit = harness
        .controller
        .upload(pdf_of_size(UPLOAD_LIMIT as usize), "limit.pdf")
        .await;
    assert!(at_limit.is_ok(), "exactly the ceiling is accepted");

    let over = harness
        .controller
        .upload(pdf_of_size(UPLOAD_LIMIT as usize + 1), "over.pdf")
        .await;
    assert!(matches!(
        over,
        Err(ControllerError::UploadTooLarge { size, limit })
            if size == UPLOAD_LIMIT + 1 && limit == UPLOAD_LIMIT
    ));
}

#[tokio::test]
async fn non_pdf_bytes_are_rejected() {
    let harness = harness();
    let result = harness
        .controller
        .upload(b"GIF89a not a pdf".to_vec(), "image.pdf")
        .await;
    assert!(matches!(result, Err(ControllerError::InvalidFile(_))));

    let empty = harness.controller.upload(Vec::new(), "empty.pdf").await;
    assert!(matches!(empty, Err(ControllerError::InvalidFile(_))));
}

#[tokio::test]
async fn duplicate_upload_returns_the_same_document() {
    let harness = harness();
    let bytes = pdf_of_size(512);

    let first = harness
        .controller
        .upload(bytes.clone(), "one.pdf")
        .await
        .expect("upload");
    let second = harness
        .controller
        .upload(bytes, "two.pdf")
        .await
        .expect("upload");
    assert_eq!(first.id, second.id);
    assert_eq!(second.original_filename, "one.pdf", "record is unchanged");

    let page = harness
        .controller
        .list(0, 20, None)
        .expect("list");
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn delete_then_reupload_yields_a_fresh_document() {
    let harness = harness();
    let bytes = pdf_of_size(600);

    let first = harness
        .controller
        .upload(bytes.clone(), "doc.pdf")
        .await
        .expect("upload");
    mark_completed(&harness, first.id, r#"{"total": 5.0}"#);

    harness.controller.delete(first.id).await.expect("delete");
    assert!(
        harness
            .services
            .blobs
            .head(&first.blob_cid)
            .await
            .expect("head")
            .is_none(),
        "blob is removed with the document"
    );

    let again = harness
        .controller
        .upload(bytes, "doc.pdf")
        .await
        .expect("re-upload");
    assert_ne!(again.id, first.id);
    assert_eq!(again.status, DocumentStatus::Pending);
    assert!(again.extracted_fields.is_none(), "no carryover of extraction");
}

#[tokio::test]
async fn start_processing_conflicts_while_a_worker_holds_it() {
    let harness = harness();
    let document = harness
        .controller
        .upload(pdf_of_size(300), "busy.pdf")
        .await
        .expect("upload");
    harness
        .controller
        .start_processing(document.id, None, false)
        .expect("queued");
    harness
        .services
        .meta
        .claim_job("w", Duration::from_secs(60))
        .expect("claim")
        .expect("job");
    harness
        .services
        .meta
        .begin_processing(document.id, "w")
        .expect("begin")
        .expect("claimed");

    let conflict = harness
        .controller
        .start_processing(document.id, None, false);
    assert!(matches!(
        conflict,
        Err(ControllerError::InvalidState { status: DocumentStatus::Processing, .. })
    ));
}

#[tokio::test]
async fn downloads_cover_single_batch_and_template() {
    let harness = harness();
    let mut ids = Vec::new();
    let fixtures = [
        r#"{"invoice_number":"A","total":1.0}"#,
        r#"{"invoice_number":"B","date":"2024-05-05","total":2.0}"#,
        r#"{"name":"C","total":3.0}"#,
    ];
    for (idx, fields) in fixtures.iter().enumerate() {
        let document = harness
            .controller
            .upload(pdf_of_size(700 + idx), &format!("doc{idx}.pdf"))
            .await
            .expect("upload");
        mark_completed(&harness, document.id, fields);
        ids.push(document.id);
    }

    let single = harness
        .controller
        .download_single(ids[0], true)
        .expect("single download");
    assert_eq!(&single.bytes[..2], b"PK");
    assert!(single.filename.ends_with("_extracted.xlsx"));

    let batch = harness.controller.download_batch(&ids).expect("batch");
    assert_eq!(&batch.bytes[..2], b"PK");

    let template = harness
        .controller
        .download_template(&ids)
        .expect("template");
    assert_eq!(&template.bytes[..2], b"PK");
    assert!(template.filename.contains("3docs"));
    assert!(template.filename.contains("4fields"));
}

#[tokio::test]
async fn download_of_pending_document_is_an_invalid_state() {
    let harness = harness();
    let document = harness
        .controller
        .upload(pdf_of_size(256), "pending.pdf")
        .await
        .expect("upload");

    let result = harness.controller.download_single(document.id, true);
    assert!(matches!(
        result,
        Err(ControllerError::InvalidState { .. })
    ));

    let batch = harness.controller.download_batch(&[document.id]);
    assert!(matches!(batch, Err(ControllerError::NoCompletedDocuments)));
}

#[tokio::test]
async fn stream_ends_immediately_for_terminal_documents() {
    use futures_util::StreamExt;

    let harness = harness();
    let document = harness
        .controller
        .upload(pdf_of_size(444), "done.pdf")
        .await
        .expect("upload");
    mark_completed(&harness, document.id, r#"{"total": 9.0}"#);

    let mut stream = harness
        .controller
        .stream_status(document.id)
        .expect("stream");
    let first = stream.next().await.expect("initial snapshot");
    assert_eq!(first.status, DocumentStatus::Completed);
    assert_eq!(first.progress, 1.0);
    assert!(stream.next().await.is_none(), "terminal stream is finite");
}

#[tokio::test]
async fn batch_process_skips_busy_documents() {
    let harness = harness();
    let first = harness
        .controller
        .upload(pdf_of_size(810), "a.pdf")
        .await
        .expect("upload");
    let second = harness
        .controller
        .upload(pdf_of_size(820), "b.pdf")
        .await
        .expect("upload");

    // Make the first document actively processing.
    harness
        .controller
        .start_processing(first.id, None, false)
        .expect("queued");
    harness
        .services
        .meta
        .claim_job("w", Duration::from_secs(60))
        .expect("claim")
        .expect("job");
    harness
        .services
        .meta
        .begin_processing(first.id, "w")
        .expect("begin")
        .expect("claimed");

    let receipt = harness
        .controller
        .batch_process(&[first.id, second.id], None)
        .expect("batch");
    assert_eq!(receipt.accepted, vec![second.id]);
    assert_eq!(receipt.skipped, vec![first.id]);
    assert_eq!(receipt.job_ids.len(), 1);

    let missing = harness.controller.batch_process(&[9_999], None);
    assert!(matches!(missing, Err(ControllerError::NotFound(9_999))));
}
