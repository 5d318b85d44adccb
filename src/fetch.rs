//! Resource fetching stage
//!
//! Retrieves the raw bytes behind a [`SourceReference`]. The default
//! [`HttpFetcher`] understands `http`, `https`, `file` and `data` locators and
//! enforces the configured timeout and size limit. `file` is only read when the
//! configuration allows it explicitly. There is no retry and no
//! caching at this layer; a failure is reported once and the caller falls back.

use crate::config::PipelineConfig;
use crate::decode::RawImageBytes;
use crate::error::{PipelineError, Result};
use crate::source::SourceReference;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use futures_util::stream::TryStreamExt;
use reqwest::{Client, Url};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

/// Trait for source fetchers
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Retrieve the bytes behind `source`
    ///
    /// # Errors
    /// - Unreachable source, non-success status, disallowed scheme, size limit
    ///   exceeded (`PipelineError::Fetch`)
    async fn fetch(&self, source: &SourceReference) -> Result<RawImageBytes>;
}

/// Fetcher for `http(s)://`, `file://` and `data:` locators
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_bytes: u64,
    allowed_schemes: Vec<String>,
}

impl HttpFetcher {
    /// Create a fetcher from pipeline configuration
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::fetch(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_bytes: config.max_fetch_bytes,
            allowed_schemes: config.allowed_schemes.clone(),
        })
    }

    fn check_scheme(&self, source: &SourceReference) -> Result<String> {
        let scheme = source
            .scheme()
            .ok_or_else(|| {
                PipelineError::fetch(format!("Source has no URL scheme: {}", source))
            })?
            .to_ascii_lowercase();
        if !self.allowed_schemes.iter().any(|s| s.eq_ignore_ascii_case(&scheme)) {
            return Err(PipelineError::fetch(format!(
                "Scheme '{}' is not allowed for {}",
                scheme, source
            )));
        }
        Ok(scheme)
    }

    fn too_large(&self, source: &SourceReference, size: u64) -> PipelineError {
        PipelineError::fetch(format!(
            "Source {} is {} bytes, exceeding the {} byte limit",
            source, size, self.max_bytes
        ))
    }

    async fn fetch_http(&self, source: &SourceReference) -> Result<RawImageBytes> {
        let response = self
            .client
            .get(source.as_str())
            .send()
            .await
            .map_err(|e| PipelineError::network_error("Failed to fetch", source.as_str(), e))?;

        if !response.status().is_success() {
            return Err(PipelineError::http_status(
                response.status().as_u16(),
                source.as_str(),
            ));
        }

        if let Some(size) = response.content_length() {
            if size > self.max_bytes {
                return Err(self.too_large(source, size));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        // Read one byte past the limit so an oversized body is detectable
        let mut data = Vec::new();
        stream
            .take(self.max_bytes.saturating_add(1))
            .read_to_end(&mut data)
            .await
            .map_err(|e| {
                PipelineError::network_error("Failed to read response body of", source.as_str(), e)
            })?;
        if data.len() as u64 > self.max_bytes {
            return Err(self.too_large(source, data.len() as u64));
        }

        log::debug!("Fetched {} bytes from {}", data.len(), source);
        let raw = RawImageBytes::new(data);
        Ok(match content_type {
            Some(content_type) => raw.with_content_type(content_type),
            None => raw,
        })
    }

    async fn fetch_file(&self, source: &SourceReference) -> Result<RawImageBytes> {
        let path = Url::parse(source.as_str())
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| PipelineError::fetch(format!("Invalid file locator: {}", source)))?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PipelineError::network_error("Failed to stat", source.as_str(), e))?;
        if metadata.len() > self.max_bytes {
            return Err(self.too_large(source, metadata.len()));
        }

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::network_error("Failed to read", source.as_str(), e))?;
        Ok(RawImageBytes::new(data))
    }

    fn fetch_data(&self, source: &SourceReference) -> Result<RawImageBytes> {
        let (mime_type, data) = parse_data_uri(source.as_str())?;
        if data.len() as u64 > self.max_bytes {
            return Err(self.too_large(source, data.len() as u64));
        }
        let raw = RawImageBytes::new(data);
        Ok(if mime_type.is_empty() {
            raw
        } else {
            raw.with_content_type(mime_type)
        })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &SourceReference) -> Result<RawImageBytes> {
        match self.check_scheme(source)?.as_str() {
            "http" | "https" => self.fetch_http(source).await,
            "file" => self.fetch_file(source).await,
            "data" => self.fetch_data(source),
            other => Err(PipelineError::fetch(format!(
                "Unsupported scheme '{}' for {}",
                other, source
            ))),
        }
    }
}

/// Split a `data:[<mime>][;base64],<payload>` URI into MIME type and bytes
fn parse_data_uri(uri: &str) -> Result<(String, Vec<u8>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| PipelineError::fetch("Not a data URI"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| PipelineError::fetch("Malformed data URI: missing ','"))?;

    let mut params = header.split(';');
    let mime_type = params.next().unwrap_or_default().trim().to_string();
    let is_base64 = params.any(|p| p.trim().eq_ignore_ascii_case("base64"));

    let data = if is_base64 {
        general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| PipelineError::fetch(format!("Invalid base64 in data URI: {}", e)))?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok((mime_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::encode_test_image;
    use image::ImageFormat;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::from_config(&PipelineConfig::default()).unwrap()
    }

    fn file_fetcher() -> HttpFetcher {
        let config = PipelineConfig::builder().allow_scheme("file").build().unwrap();
        HttpFetcher::from_config(&config).unwrap()
    }

    #[test]
    fn test_parse_data_uri() {
        let (mime, data) = parse_data_uri("data:image/png;base64,AAEC").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, vec![0, 1, 2]);

        let (mime, data) = parse_data_uri("data:,hello").unwrap();
        assert!(mime.is_empty());
        assert_eq!(data, b"hello");

        assert!(parse_data_uri("data:image/png;base64").is_err());
        assert!(parse_data_uri("data:image/png;base64,!!!").is_err());
    }

    #[tokio::test]
    async fn test_fetch_data_uri_png() {
        let png = encode_test_image(4, 4, ImageFormat::Png);
        let uri = format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(&png));

        let raw = fetcher().fetch(&SourceReference::new(uri)).await.unwrap();
        assert_eq!(raw.data, png);
        assert_eq!(raw.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_fetch_file_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.png");
        let png = encode_test_image(8, 8, ImageFormat::Png);
        std::fs::write(&path, &png).unwrap();

        let url = Url::from_file_path(&path).unwrap();
        let raw = file_fetcher()
            .fetch(&SourceReference::new(url.as_str()))
            .await
            .unwrap();
        assert_eq!(raw.data, png);
    }

    #[tokio::test]
    async fn test_file_uri_rejected_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.png");
        std::fs::write(&path, encode_test_image(2, 2, ImageFormat::Png)).unwrap();

        let url = Url::from_file_path(&path).unwrap();
        let err = fetcher()
            .fetch(&SourceReference::new(url.as_str()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(_)));
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_missing_file_is_fetch_error() {
        let err = file_fetcher()
            .fetch(&SourceReference::new("file:///nonexistent/storefront/logo.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_disallowed_scheme() {
        let config = PipelineConfig::builder()
            .allowed_schemes(["https"])
            .build()
            .unwrap();
        let fetcher = HttpFetcher::from_config(&config).unwrap();

        let err = fetcher
            .fetch(&SourceReference::new("data:,hello"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));

        let err = fetcher
            .fetch(&SourceReference::new("logo.png"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no URL scheme"));
    }

    #[tokio::test]
    async fn test_size_limit_on_data_uri() {
        let config = PipelineConfig::builder().max_fetch_bytes(2).build().unwrap();
        let fetcher = HttpFetcher::from_config(&config).unwrap();
        let err = fetcher
            .fetch(&SourceReference::new("data:,hello"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeding"));
    }
}
