//! OCR fallback: when the vision extractor gives up on a page, a plain
//! transcription pass salvages the text so the page contributes something.

use async_trait::async_trait;
use thiserror::Error;

use crate::services::enhance::EncodedImage;
use crate::services::vision::{ChatClient, VisionError};

const OCR_PROMPT: &str = "Transcribe every piece of visible text in this document image. \
     Preserve reading order and line breaks. Return plain text only, with no commentary \
     and no markdown.";

/// Errors produced by the OCR fallback.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error("transcription came back empty")]
    EmptyTranscription,
}

/// Capability seam for page-level text recovery.
#[async_trait]
pub trait OcrFallback: Send + Sync {
    /// Transcribe a page image into plain text.
    async fn transcribe(&self, image: &EncodedImage) -> Result<String, OcrError>;
}

/// OCR through the same chat-completions protocol, usually with a cheaper
/// model than the structured extractor.
pub struct VisionOcr {
    client: ChatClient,
    model: String,
}

impl VisionOcr {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl OcrFallback for VisionOcr {
    async fn transcribe(&self, image: &EncodedImage) -> Result<String, OcrError> {
        let content = self
            .client
            .complete_with_image(&self.model, OCR_PROMPT, image)
            .await?;
        let text = content.trim();
        if text.is_empty() {
            return Err(OcrError::EmptyTranscription);
        }
        Ok(text.to_string())
    }
}
