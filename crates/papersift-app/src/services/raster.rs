//! PDF rasterization: page counting and page-image rendering through Pdfium.

use std::env;
use std::path::{Path, PathBuf};

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use pdfium_render::prelude::{PdfRenderConfig, Pdfium, PdfiumError};
use thiserror::Error;

/// Errors emitted while rendering PDF pages into PNG images.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("failed to load Pdfium runtime: {0}")]
    Library(#[from] PdfiumError),

    #[error("failed to load PDF document: {0}")]
    Unreadable(#[source] PdfiumError),

    #[error("document has {pages} pages, limit is {limit}")]
    TooManyPages { pages: u32, limit: u32 },

    #[error("failed to render page {page_index}: {source}")]
    PageRender {
        page_index: usize,
        #[source]
        source: PdfiumError,
    },

    #[error("failed to encode page {page_index} as PNG: {source}")]
    Encode {
        page_index: usize,
        #[source]
        source: image::ImageError,
    },
}

impl RasterError {
    /// Document-terminal errors (as opposed to environment problems).
    pub fn is_document_fault(&self) -> bool {
        matches!(
            self,
            RasterError::Unreadable(_) | RasterError::TooManyPages { .. }
        )
    }
}

/// In-memory representation of a rendered PDF page.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub png_data: Vec<u8>,
}

/// Capability seam over the PDF renderer so pipeline tests can run without a
/// native Pdfium library.
pub trait Rasterizer: Send + Sync {
    /// Number of pages, without rendering anything.
    fn page_count(&self, bytes: &[u8]) -> Result<u32, RasterError>;

    /// Render every page at the target width. Fails with `TooManyPages`
    /// before rendering when the count exceeds `max_pages`.
    fn rasterize(
        &self,
        bytes: &[u8],
        target_width: u32,
        max_pages: u32,
    ) -> Result<Vec<PageImage>, RasterError>;
}

/// Production rasterizer backed by Pdfium.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumRasterizer;

impl Rasterizer for PdfiumRasterizer {
    fn page_count(&self, bytes: &[u8]) -> Result<u32, RasterError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(RasterError::Unreadable)?;
        Ok(document.pages().len() as u32)
    }

    fn rasterize(
        &self,
        bytes: &[u8],
        target_width: u32,
        max_pages: u32,
    ) -> Result<Vec<PageImage>, RasterError> {
        debug_assert!(target_width > 0);
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(RasterError::Unreadable)?;

        let pages = document.pages().len() as u32;
        if pages > max_pages {
            return Err(RasterError::TooManyPages {
                pages,
                limit: max_pages,
            });
        }

        let mut images = Vec::with_capacity(pages as usize);
        for (page_index, page) in document.pages().iter().enumerate() {
            let render_config = PdfRenderConfig::new().set_target_width(target_width as i32);
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|source| RasterError::PageRender { page_index, source })?;

            let width = bitmap.width() as u32;
            let height = bitmap.height() as u32;
            let rgba = bitmap.as_rgba_bytes();

            let mut encoded = Vec::new();
            let encoder = PngEncoder::new(&mut encoded);
            encoder
                .write_image(&rgba, width, height, ColorType::Rgba8.into())
                .map_err(|source| RasterError::Encode { page_index, source })?;

            images.push(PageImage {
                page_index,
                width,
                height,
                png_data: encoded,
            });
        }

        Ok(images)
    }
}

fn load_pdfium() -> Result<Pdfium, PdfiumError> {
    if let Some(result) = try_bind_from_env("PDFIUM_LIBRARY_PATH") {
        return result;
    }
    for var in ["PDFIUM_LIB_DIR", "PDFIUM_DYNAMIC_LIB_PATH"] {
        if let Some(result) = try_bind_from_env(var)
            && result.is_ok()
        {
            return result;
        }
    }

    match Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./")) {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(primary_err) => match Pdfium::bind_to_system_library() {
            Ok(bindings) => Ok(Pdfium::new(bindings)),
            Err(_) => Err(primary_err),
        },
    }
}

fn try_bind_from_env(var: &str) -> Option<Result<Pdfium, PdfiumError>> {
    let value = env::var_os(var)?;
    let path = PathBuf::from(&value);
    try_bind_from_path(path)
}

fn try_bind_from_path(path: impl AsRef<Path>) -> Option<Result<Pdfium, PdfiumError>> {
    let path = path.as_ref();
    if path.is_dir() {
        let lib_path = Pdfium::pdfium_platform_library_name_at_path(path);
        Some(Pdfium::bind_to_library(lib_path).map(Pdfium::new))
    } else if path.exists() {
        Some(Pdfium::bind_to_library(path).map(Pdfium::new))
    } else {
        None
    }
}
