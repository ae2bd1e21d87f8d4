//! Configuration loading: layered defaults, TOML files, and environment.
//!
//! Precedence, lowest to highest: built-in defaults, `/etc/xdg` TOML, the XDG
//! config dir TOML, `config/settings.toml`, the `PAPERSIFT_CONFIG_FILE`
//! override, `PAPERSIFT__`-prefixed environment, and finally the flat
//! documented names (`MAX_UPLOAD_BYTES`, `VISION_API_KEY`, ...) which match
//! the deployment contract of the original service.

use std::{env, num::NonZeroU32, path::PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::paths::project_dirs;

const LOCAL_CONFIG_PATH: &str = "config/settings.toml";
const ETC_CONFIG_ENV: &str = "PAPERSIFT_ETC_CONFIG_DIR";
const CONFIG_OVERRIDE_ENV: &str = "PAPERSIFT_CONFIG_FILE";
const ETC_CONFIG_DEFAULT: &str = "/etc/xdg";
const CORS_MAX_LIST_SIZE: usize = 64;
const CORS_MAX_AGE_LIMIT: u64 = 86_400;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("invalid value for {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub processing: ProcessingConfig,
    pub vision: VisionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_headers")]
    pub allow_headers: Vec<String>,
    #[serde(default = "CorsConfig::default_max_age_secs")]
    pub max_age_secs: u64,
}

impl CorsConfig {
    fn default_allow_methods() -> Vec<String> {
        ["GET", "POST", "DELETE", "OPTIONS"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn default_allow_headers() -> Vec<String> {
        vec!["authorization".to_string(), "content-type".to_string()]
    }

    fn default_max_age_secs() -> u64 {
        600
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origins: Vec::new(),
            allow_methods: Self::default_allow_methods(),
            allow_headers: Self::default_allow_headers(),
            max_age_secs: Self::default_max_age_secs(),
        }
    }
}

/// Keyed request limiting for the HTTP adapter. Distinct from the vision-call
/// token bucket, which lives under [`VisionConfig`].
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "RateLimitConfig::default_per_second")]
    pub per_second: NonZeroU32,
    #[serde(default = "RateLimitConfig::default_burst")]
    pub burst: NonZeroU32,
}

impl RateLimitConfig {
    fn default_per_second() -> NonZeroU32 {
        NonZeroU32::new(20).expect("default per_second must be non-zero")
    }

    fn default_burst() -> NonZeroU32 {
        NonZeroU32::new(40).expect("default burst must be non-zero")
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_second: Self::default_per_second(),
            burst: Self::default_burst(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Backend type: "local" (default; "fs" is accepted as an alias) or "s3".
    #[serde(default)]
    pub backend: BlobBackend,
    /// Root path for filesystem storage; defaults to the XDG data dir.
    pub path: Option<PathBuf>,
    /// S3 configuration (used when backend = "s3").
    #[serde(default)]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    #[default]
    #[serde(alias = "fs")]
    Local,
    S3,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub root_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Upload ceiling in bytes; uploads of exactly this size are accepted.
    pub max_upload_bytes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    /// Documents with more pages than this fail with `DocumentTooLarge`.
    pub max_pages: u32,
    /// Parallel pipeline workers per process.
    pub worker_concurrency: usize,
    /// Wall-clock budget for one document attempt, in seconds.
    pub timeout_seconds: u64,
    /// Budget for a single model call, in seconds.
    pub page_call_timeout_seconds: u64,
    /// Target raster width for page rendering, in pixels.
    pub render_width: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisionConfig {
    /// OpenAI-compatible chat completions endpoint base, e.g.
    /// `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Model used for the OCR fallback transcription; defaults to `model`.
    pub ocr_model: Option<String>,
    /// Shared token bucket across the worker pool, requests per minute.
    pub rate_limit_per_minute: NonZeroU32,
}

impl VisionConfig {
    pub fn ocr_model(&self) -> &str {
        self.ocr_model.as_deref().unwrap_or(&self.model)
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs().map_err(|_| AppConfigError::MissingProjectDirs)?;
    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8000")?
        .set_default("storage.backend", "local")?
        .set_default("upload.max_upload_bytes", 104_857_600_i64)?
        .set_default("processing.max_pages", 100)?
        .set_default("processing.worker_concurrency", 2)?
        .set_default("processing.timeout_seconds", 3_600)?
        .set_default("processing.page_call_timeout_seconds", 120)?
        .set_default("processing.render_width", 2_048)?
        .set_default("vision.base_url", "https://api.openai.com/v1")?
        .set_default("vision.model", "gpt-4o")?
        .set_default("vision.rate_limit_per_minute", 20)?;

    for path in base_config_paths(&dirs) {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    if let Some(override_path) = config_override_path()? {
        builder = builder.add_source(
            File::from(override_path)
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("PAPERSIFT").separator("__"));

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_env_overrides(&mut cfg)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// The flat environment names documented for deployments. They beat every
/// other source so container manifests written against the original service
/// keep working unchanged.
fn apply_env_overrides(cfg: &mut AppConfig) -> Result<(), AppConfigError> {
    if let Some(value) = parse_env::<u64>("MAX_UPLOAD_BYTES")? {
        cfg.upload.max_upload_bytes = value;
    }
    if let Some(value) = parse_env::<u32>("MAX_PAGES_PER_DOCUMENT")? {
        cfg.processing.max_pages = value;
    }
    if let Some(value) = parse_env::<usize>("WORKER_CONCURRENCY")? {
        cfg.processing.worker_concurrency = value;
    }
    if let Some(value) = parse_env::<u64>("PROCESSING_TIMEOUT_SECONDS")? {
        cfg.processing.timeout_seconds = value;
    }
    if let Some(value) = parse_env::<u32>("RATE_LIMIT_PER_MINUTE")? {
        cfg.vision.rate_limit_per_minute =
            NonZeroU32::new(value).ok_or(AppConfigError::InvalidEnv {
                name: "RATE_LIMIT_PER_MINUTE",
                reason: "must be greater than zero".to_string(),
            })?;
    }
    if let Some(value) = env_string("VISION_MODEL_NAME") {
        cfg.vision.model = value;
    }
    if let Some(value) = env_string("VISION_API_KEY") {
        cfg.vision.api_key = Some(value);
    }
    if let Some(value) = env_string("BLOB_BACKEND") {
        cfg.storage.backend = match value.as_str() {
            "local" | "fs" => BlobBackend::Local,
            "s3" => BlobBackend::S3,
            other => {
                return Err(AppConfigError::InvalidEnv {
                    name: "BLOB_BACKEND",
                    reason: format!("unknown backend `{other}` (expected `local` or `s3`)"),
                });
            }
        };
    }
    Ok(())
}

fn env_string(name: &'static str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, AppConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| AppConfigError::InvalidEnv {
                name,
                reason: err.to_string(),
            }),
    }
}

fn base_config_paths(dirs: &directories::ProjectDirs) -> [PathBuf; 3] {
    let etc_root = etc_config_dir();
    [
        etc_root.join("papersift").join("settings.toml"),
        dirs.config_dir().join("settings.toml"),
        PathBuf::from(LOCAL_CONFIG_PATH),
    ]
}

fn config_override_path() -> Result<Option<PathBuf>, AppConfigError> {
    match env::var_os(CONFIG_OVERRIDE_ENV) {
        None => Ok(None),
        Some(raw) => {
            let path = PathBuf::from(raw);
            if path.as_os_str().is_empty() {
                return Err(invalid_config("PAPERSIFT_CONFIG_FILE must not be empty"));
            }
            Ok(Some(path))
        }
    }
}

fn etc_config_dir() -> PathBuf {
    match env::var_os(ETC_CONFIG_ENV) {
        Some(raw) if !raw.is_empty() => PathBuf::from(raw),
        _ => PathBuf::from(ETC_CONFIG_DEFAULT),
    }
}

fn validate_config(config: &AppConfig) -> Result<(), AppConfigError> {
    if config.upload.max_upload_bytes == 0 {
        return Err(invalid_config("upload.max_upload_bytes must be positive"));
    }
    if config.processing.max_pages == 0 {
        return Err(invalid_config("processing.max_pages must be positive"));
    }
    if config.processing.worker_concurrency == 0 {
        return Err(invalid_config(
            "processing.worker_concurrency must be positive",
        ));
    }
    if config.storage.backend == BlobBackend::S3 && config.storage.s3.is_none() {
        return Err(invalid_config(
            "storage.backend = s3 requires a [storage.s3] section",
        ));
    }
    validate_cors(&config.server.cors)?;
    Ok(())
}

fn validate_cors(cors: &CorsConfig) -> Result<(), AppConfigError> {
    if cors.allow_origins.len() > CORS_MAX_LIST_SIZE {
        return Err(invalid_config(format!(
            "CORS allow_origins supports at most {CORS_MAX_LIST_SIZE} entries"
        )));
    }
    if cors.max_age_secs > CORS_MAX_AGE_LIMIT {
        return Err(invalid_config(
            "CORS max_age_secs exceeds 86400 second ceiling",
        ));
    }
    if cors.enabled && cors.allow_origins.is_empty() {
        return Err(invalid_config("CORS enabled but allow_origins is empty"));
    }
    for origin in &cors.allow_origins {
        validate_origin(origin)?;
    }
    Ok(())
}

fn validate_origin(raw: &str) -> Result<(), AppConfigError> {
    let url =
        Url::parse(raw).map_err(|_| invalid_config(format!("invalid CORS origin `{raw}`")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(invalid_config(format!(
                "CORS origin `{raw}` must use http or https (found {other})"
            )));
        }
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(invalid_config(format!(
            "CORS origin `{raw}` must not include path, query, or fragment"
        )));
    }
    if url.host_str().is_none() {
        return Err(invalid_config(format!(
            "CORS origin `{raw}` must include a host"
        )));
    }
    Ok(())
}

fn invalid_config<S: Into<String>>(message: S) -> AppConfigError {
    AppConfigError::Build(config::ConfigError::Message(message.into()))
}
