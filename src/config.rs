//! Configuration types for the logo processing pipeline

use crate::error::{PipelineError, Result};
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "STOREFRONT_BGREMOVE_";

/// Upper bound accepted for `max_fetch_bytes` (1 GiB)
const MAX_FETCH_BYTES_LIMIT: u64 = 1024 * 1024 * 1024;

/// Encoding used for published (processed) images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG with alpha channel transparency
    Png,
    /// Lossless WebP with alpha channel transparency
    WebP,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Png
    }
}

impl OutputFormat {
    /// Image crate format used when encoding
    #[must_use]
    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::WebP => ImageFormat::WebP,
        }
    }

    /// MIME type attached to published resources
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }

    /// File extension (without the dot)
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::WebP),
            other => Err(PipelineError::invalid_config(format!(
                "Unsupported output format: {} (expected png or webp)",
                other
            ))),
        }
    }
}

/// Configuration for pipeline construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timeout for a single source fetch, in seconds
    pub fetch_timeout_secs: u64,

    /// Maximum number of bytes accepted from a source
    pub max_fetch_bytes: u64,

    /// User agent sent with HTTP fetches
    pub user_agent: String,

    /// URL schemes the fetcher accepts
    pub allowed_schemes: Vec<String>,

    /// Maximum width or height of a decoded image
    pub max_image_dimension: u32,

    /// Maximum number of simultaneously live published resources
    pub max_published_resources: usize,

    /// Share one execution between concurrent or repeated identical sources
    pub deduplicate: bool,

    /// Encoding of published results
    pub output_format: OutputFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            max_fetch_bytes: 20 * 1024 * 1024,
            user_agent: format!("storefront-bgremove/{}", env!("CARGO_PKG_VERSION")),
            allowed_schemes: vec![
                "https".to_string(),
                "http".to_string(),
                "data".to_string(),
            ],
            max_image_dimension: 8192,
            max_published_resources: 256,
            deduplicate: true,
            output_format: OutputFormat::Png,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Validate configuration values
    ///
    /// # Errors
    /// - Zero fetch timeout, fetch size, image dimension or resource capacity
    /// - Fetch size above 1 GiB
    /// - Empty or unknown scheme list
    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout_secs == 0 {
            return Err(PipelineError::config_value_error(
                "fetch_timeout_secs",
                self.fetch_timeout_secs,
                "1-3600",
            ));
        }
        if self.fetch_timeout_secs > 3600 {
            return Err(PipelineError::config_value_error(
                "fetch_timeout_secs",
                self.fetch_timeout_secs,
                "1-3600",
            ));
        }
        if self.max_fetch_bytes == 0 || self.max_fetch_bytes > MAX_FETCH_BYTES_LIMIT {
            return Err(PipelineError::config_value_error(
                "max_fetch_bytes",
                self.max_fetch_bytes,
                &format!("1-{}", MAX_FETCH_BYTES_LIMIT),
            ));
        }
        if self.max_image_dimension == 0 {
            return Err(PipelineError::config_value_error(
                "max_image_dimension",
                self.max_image_dimension,
                "1-65535",
            ));
        }
        if self.max_published_resources == 0 {
            return Err(PipelineError::config_value_error(
                "max_published_resources",
                self.max_published_resources,
                ">= 1",
            ));
        }
        if self.allowed_schemes.is_empty() {
            return Err(PipelineError::invalid_config(
                "allowed_schemes must name at least one scheme",
            ));
        }
        for scheme in &self.allowed_schemes {
            if !matches!(scheme.as_str(), "http" | "https" | "file" | "data") {
                return Err(PipelineError::invalid_config(format!(
                    "Unsupported scheme '{}' (supported: http, https, file, data)",
                    scheme
                )));
            }
        }
        Ok(())
    }

    /// Whether the fetcher accepts the given scheme
    #[must_use]
    pub fn allows_scheme(&self, scheme: &str) -> bool {
        self.allowed_schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme))
    }

    /// Load configuration from a JSON file
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    /// - File cannot be read
    /// - Invalid JSON
    /// - Validation failures
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            PipelineError::invalid_config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STOREFRONT_BGREMOVE_*` environment overrides on top of this config
    ///
    /// # Errors
    /// - Unparseable override values
    /// - Validation failures after applying overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Apply overrides from an arbitrary key lookup (keys without prefix)
    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = parse_override("FETCH_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("MAX_FETCH_BYTES") {
            self.max_fetch_bytes = parse_override("MAX_FETCH_BYTES", &value)?;
        }
        if let Some(value) = lookup("USER_AGENT") {
            self.user_agent = value;
        }
        if let Some(value) = lookup("MAX_IMAGE_DIMENSION") {
            self.max_image_dimension = parse_override("MAX_IMAGE_DIMENSION", &value)?;
        }
        if let Some(value) = lookup("MAX_PUBLISHED_RESOURCES") {
            self.max_published_resources = parse_override("MAX_PUBLISHED_RESOURCES", &value)?;
        }
        if let Some(value) = lookup("DEDUPLICATE") {
            self.deduplicate = parse_override("DEDUPLICATE", &value)?;
        }
        if let Some(value) = lookup("OUTPUT_FORMAT") {
            self.output_format = value.parse()?;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        PipelineError::invalid_config(format!(
            "Invalid value '{}' for {}{}: {}",
            value, ENV_PREFIX, key, e
        ))
    })
}

/// Builder for `PipelineConfig`
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    #[must_use]
    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn max_fetch_bytes(mut self, bytes: u64) -> Self {
        self.config.max_fetch_bytes = bytes;
        self
    }

    #[must_use]
    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn allowed_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    /// Accept one more scheme on top of the current list
    ///
    /// `file` is not accepted by default; enable it only where sources come
    /// from a trusted operator rather than storefront data.
    #[must_use]
    pub fn allow_scheme<S: Into<String>>(mut self, scheme: S) -> Self {
        let scheme = scheme.into();
        if !self.config.allows_scheme(&scheme) {
            self.config.allowed_schemes.push(scheme);
        }
        self
    }

    #[must_use]
    pub fn max_image_dimension(mut self, dimension: u32) -> Self {
        self.config.max_image_dimension = dimension;
        self
    }

    #[must_use]
    pub fn max_published_resources(mut self, capacity: usize) -> Self {
        self.config.max_published_resources = capacity;
        self
    }

    #[must_use]
    pub fn deduplicate(mut self, deduplicate: bool) -> Self {
        self.config.deduplicate = deduplicate;
        self
    }

    #[must_use]
    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    /// - Any validation failure from [`PipelineConfig::validate`]
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
