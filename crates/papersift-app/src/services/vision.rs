//! Vision-model extraction over the OpenAI-compatible chat completions
//! protocol: page images go up as base64 data URLs, structured JSON comes
//! back. The trait seam keeps the pipeline testable with scripted doubles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

use crate::document::{ConfidenceMap, FieldMap, FieldValue};
use crate::schema::Schema;
use crate::services::context::GenericRateLimiter;
use crate::services::enhance::EncodedImage;

/// Confidence assumed for fields the model returned without scoring.
pub const DEFAULT_FIELD_CONFIDENCE: f64 = 0.5;
const MAX_COMPLETION_TOKENS: u32 = 4_096;
const MODEL_TEMPERATURE: f32 = 0.1;

/// One page's worth of extracted fields with per-field confidence.
#[derive(Debug, Clone, Default)]
pub struct PageExtraction {
    pub fields: FieldMap,
    pub confidence: ConfidenceMap,
}

/// Result of the schema-identification call.
#[derive(Debug, Clone)]
pub struct SchemaDetection {
    pub schema_name: String,
    pub confidence: f64,
    pub suggested_fields: Vec<String>,
}

/// Errors produced by the vision service.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision api key is not configured")]
    MissingApiKey,
    #[error("vision endpoint rate limited the request")]
    RateLimited,
    #[error("vision endpoint unavailable (status {status})")]
    Unavailable { status: u16 },
    #[error("vision request rejected (status {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("vision call timed out")]
    Timeout,
    #[error("vision transport error: {0}")]
    Transport(String),
    #[error("model returned malformed payload: {0}")]
    Malformed(String),
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error("invalid vision base url `{0}`")]
    InvalidBaseUrl(String),
}

impl VisionError {
    /// Transient infrastructure faults that deserve the retry/backoff path.
    /// Malformed payloads are retried too: a re-prompt often straightens the
    /// model out, and the OCR fallback catches the rest.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VisionError::RateLimited
                | VisionError::Unavailable { .. }
                | VisionError::Timeout
                | VisionError::Transport(_)
                | VisionError::Malformed(_)
                | VisionError::EmptyResponse
        )
    }
}

/// Capability seam for the vision model.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    /// Extract schema fields from one page image.
    async fn extract(
        &self,
        image: &EncodedImage,
        schema: &Schema,
    ) -> Result<PageExtraction, VisionError>;

    /// Classify a sample page against the known schema names.
    async fn identify(
        &self,
        image: &EncodedImage,
        known_types: &[&str],
        hint: Option<&str>,
    ) -> Result<SchemaDetection, VisionError>;

    fn model_id(&self) -> String;
}

/// Shared chat-completions plumbing used by the extractor and the OCR
/// fallback.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    completions_url: Url,
    api_key: String,
    limiter: Option<Arc<GenericRateLimiter>>,
}

impl ChatClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        call_timeout: Duration,
        limiter: Option<Arc<GenericRateLimiter>>,
    ) -> Result<Self, VisionError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(VisionError::MissingApiKey);
        }
        let base = Url::parse(base_url)
            .map_err(|_| VisionError::InvalidBaseUrl(base_url.to_string()))?;
        let completions_url = join_completions(&base)
            .ok_or_else(|| VisionError::InvalidBaseUrl(base_url.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|err| VisionError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            completions_url,
            api_key,
            limiter,
        })
    }

    /// Send one prompt + image pair, returning the assistant's text content.
    pub async fn complete_with_image(
        &self,
        model: &str,
        prompt: &str,
        image: &EncodedImage,
    ) -> Result<String, VisionError> {
        debug_assert!(!model.is_empty());
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let data_url = format!(
            "data:{};base64,{}",
            image.mime_type,
            BASE64_STANDARD.encode(&image.data)
        );
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: prompt.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: MAX_COMPLETION_TOKENS,
            temperature: MODEL_TEMPERATURE,
        };

        let response = self
            .http
            .post(self.completions_url.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(VisionError::RateLimited);
        }
        if status.is_server_error() {
            return Err(VisionError::Unavailable {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| VisionError::Malformed(err.to_string()))?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(VisionError::EmptyResponse);
        }
        Ok(content)
    }
}

fn classify_transport(err: reqwest::Error) -> VisionError {
    if err.is_timeout() {
        VisionError::Timeout
    } else {
        VisionError::Transport(err.to_string())
    }
}

fn join_completions(base: &Url) -> Option<Url> {
    let mut path = base.path().trim_end_matches('/').to_string();
    path.push_str("/chat/completions");
    let mut url = base.clone();
    url.set_path(&path);
    Some(url)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

/// Production extractor over the chat protocol.
pub struct OpenAiVision {
    client: ChatClient,
    model: String,
}

impl OpenAiVision {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl VisionExtractor for OpenAiVision {
    async fn extract(
        &self,
        image: &EncodedImage,
        schema: &Schema,
    ) -> Result<PageExtraction, VisionError> {
        let prompt = extraction_prompt(schema);
        let content = self
            .client
            .complete_with_image(&self.model, &prompt, image)
            .await?;
        parse_extraction(&content)
    }

    async fn identify(
        &self,
        image: &EncodedImage,
        known_types: &[&str],
        hint: Option<&str>,
    ) -> Result<SchemaDetection, VisionError> {
        let prompt = detection_prompt(known_types, hint);
        let content = self
            .client
            .complete_with_image(&self.model, &prompt, image)
            .await?;
        parse_detection(&content)
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}

fn extraction_prompt(schema: &Schema) -> String {
    let schema_json = schema.to_prompt_json();
    format!(
        "Analyze this document image and extract all data according to this schema:\n\
         {schema_json}\n\n\
         Rules:\n\
         1. Extract all visible text and data from the document\n\
         2. Match extracted data to the schema fields\n\
         3. For any missing or unreadable fields, use \"N/A\"\n\
         4. Dates must be ISO-8601 (YYYY-MM-DD)\n\
         5. Include a confidence score between 0 and 1 for each field\n\n\
         Return only JSON shaped as\n\
         {{\"fields\": {{\"field_name\": value, ...}}, \"confidence\": {{\"field_name\": 0.95, ...}}}}\n\
         with no explanations."
    )
}

fn detection_prompt(known_types: &[&str], hint: Option<&str>) -> String {
    let mut prompt = format!(
        "Analyze this document image and identify its type. Known types: {}. \
         If none fits, invent a short lowercase name.\n\
         List all visible fields and which of them look required.\n\n\
         Return only JSON shaped as\n\
         {{\"detected_type\": \"...\", \"confidence\": 0.95, \
         \"fields\": {{\"field_name\": {{\"type\": \"text|number|date|boolean|array|object\", \
         \"description\": \"...\"}}}}, \"required_fields\": [\"...\"]}}",
        known_types.join(", ")
    );
    if let Some(hint) = hint {
        prompt.push_str("\n\nAdditional context: ");
        prompt.push_str(hint);
    }
    prompt
}

/// Strip optional markdown fences and parse the model's JSON object.
fn parse_model_json(content: &str) -> Result<JsonValue, VisionError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_start())
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed);
    serde_json::from_str::<JsonValue>(unfenced.trim())
        .map_err(|err| VisionError::Malformed(err.to_string()))
}

fn parse_extraction(content: &str) -> Result<PageExtraction, VisionError> {
    let value = parse_model_json(content)?;
    let JsonValue::Object(root) = value else {
        return Err(VisionError::Malformed(
            "expected a JSON object".to_string(),
        ));
    };

    // Either the requested {"fields": ..., "confidence": ...} envelope or a
    // flat field map; models produce both.
    let (raw_fields, raw_confidence) = match root.get("fields") {
        Some(JsonValue::Object(fields)) => (fields.clone(), root.get("confidence").cloned()),
        _ => {
            let mut flat = root.clone();
            let confidence = flat.remove("confidence");
            (flat, confidence)
        }
    };

    let mut fields = FieldMap::new();
    for (name, value) in &raw_fields {
        fields.insert(name.clone(), FieldValue::from_json(value));
    }

    let mut confidence = ConfidenceMap::new();
    if let Some(JsonValue::Object(scores)) = raw_confidence {
        for (name, score) in scores {
            if let Some(score) = score.as_f64() {
                confidence.insert(name, score.clamp(0.0, 1.0));
            }
        }
    }
    for name in fields.keys() {
        confidence
            .entry(name.clone())
            .or_insert(DEFAULT_FIELD_CONFIDENCE);
    }

    Ok(PageExtraction { fields, confidence })
}

fn parse_detection(content: &str) -> Result<SchemaDetection, VisionError> {
    let value = parse_model_json(content)?;
    let JsonValue::Object(root) = value else {
        return Err(VisionError::Malformed(
            "expected a JSON object".to_string(),
        ));
    };

    let schema_name = root
        .get("detected_type")
        .and_then(JsonValue::as_str)
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| VisionError::Malformed("missing detected_type".to_string()))?;
    let confidence = root
        .get("confidence")
        .and_then(JsonValue::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let suggested_fields = match root.get("fields") {
        Some(JsonValue::Object(fields)) => fields.keys().cloned().collect(),
        _ => Vec::new(),
    };

    Ok(SchemaDetection {
        schema_name,
        confidence,
        suggested_fields,
    })
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tiny_image() -> EncodedImage {
        EncodedImage::png(vec![0x89, 0x50, 0x4e, 0x47], 1, 1)
    }

    fn chat_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
    }

    async fn client_for(server: &MockServer) -> OpenAiVision {
        let chat = ChatClient::new(
            &server.uri(),
            "test-key",
            Duration::from_secs(5),
            None,
        )
        .expect("client builds");
        OpenAiVision::new(chat, "test-model")
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let result = ChatClient::new("https://api.openai.com/v1", " ", Duration::from_secs(5), None);
        assert!(matches!(result, Err(VisionError::MissingApiKey)));
    }

    #[test]
    fn completions_url_joins_base_path() {
        let base = Url::parse("https://api.openai.com/v1").expect("url");
        let joined = join_completions(&base).expect("join");
        assert_eq!(joined.as_str(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn parse_extraction_accepts_envelope_and_flat() {
        let enveloped = parse_extraction(
            r#"{"fields": {"total": 12.5}, "confidence": {"total": 0.9}}"#,
        )
        .expect("parses");
        assert_eq!(enveloped.confidence["total"], 0.9);

        let flat = parse_extraction(r#"{"total": 12.5, "vendor": "ACME"}"#).expect("parses");
        assert_eq!(flat.fields.len(), 2);
        assert_eq!(flat.confidence["vendor"], DEFAULT_FIELD_CONFIDENCE);
    }

    #[test]
    fn parse_extraction_strips_markdown_fences() {
        let fenced = "```json\n{\"fields\": {\"total\": 1}}\n```";
        let parsed = parse_extraction(fenced).expect("parses");
        assert!(parsed.fields.contains_key("total"));
    }

    #[test]
    fn parse_extraction_rejects_non_json() {
        let result = parse_extraction("the total is 12.50, have a nice day");
        assert!(matches!(result, Err(VisionError::Malformed(_))));
    }

    #[test]
    fn parse_detection_lowercases_type() {
        let detection = parse_detection(
            r#"{"detected_type": "Invoice", "confidence": 0.9, "fields": {"total": {"type": "number"}}}"#,
        )
        .expect("parses");
        assert_eq!(detection.schema_name, "invoice");
        assert_eq!(detection.suggested_fields, vec!["total".to_string()]);
    }

    #[tokio::test]
    async fn extract_round_trips_through_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(
                r#"{"fields": {"invoice_number": "INV-7", "total": 41.5}, "confidence": {"invoice_number": 0.97, "total": 0.88}}"#,
            )))
            .mount(&server)
            .await;

        let vision = client_for(&server).await;
        let registry = SchemaRegistry::new();
        let schema = registry.get("invoice").expect("builtin schema");
        let extraction = vision
            .extract(&tiny_image(), schema)
            .await
            .expect("extraction succeeds");
        assert_eq!(
            extraction.fields["invoice_number"],
            FieldValue::Text("INV-7".to_string())
        );
        assert_eq!(extraction.confidence["total"], 0.88);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_retryable_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let vision = client_for(&server).await;
        let registry = SchemaRegistry::new();
        let schema = registry.get("generic").expect("builtin schema");
        let err = vision
            .extract(&tiny_image(), schema)
            .await
            .expect_err("rate limited");
        assert!(matches!(err, VisionError::RateLimited));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn client_error_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let vision = client_for(&server).await;
        let registry = SchemaRegistry::new();
        let schema = registry.get("generic").expect("builtin schema");
        let err = vision
            .extract(&tiny_image(), schema)
            .await
            .expect_err("rejected");
        assert!(matches!(err, VisionError::Rejected { status: 400, .. }));
        assert!(!err.is_retryable());
    }
}
