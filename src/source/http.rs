//! HTTP client shared foundation
//!
//! This module provides a shared HTTP client with:
//! - Configurable timeout and User-Agent
//! - Exponential backoff retry logic (max 3 retries)
//! - Status classification and download-to-file support

use std::path::Path;
use std::time::Duration;

use reqwest::Client;

use crate::error::SourceError;

/// Default timeout for HTTP requests (60 seconds; tarballs can be large)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default User-Agent header
const DEFAULT_USER_AGENT: &str = concat!("upmerge/", env!("CARGO_PKG_VERSION"));

/// Maximum number of retry attempts
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
const BASE_DELAY_MS: u64 = 100;

/// HTTP client wrapper with retry logic
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client,
    max_retries: u32,
}

impl HttpClient {
    /// Create a new HTTP client with default settings
    pub fn new() -> Result<Self, SourceError> {
        Self::with_config(DEFAULT_TIMEOUT, DEFAULT_USER_AGENT)
    }

    /// Create a new HTTP client with custom configuration
    pub fn with_config(timeout: Duration, user_agent: &str) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| SourceError::Network {
                url: String::new(),
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Perform a GET request with retry logic.
    pub async fn get(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        let mut last_error = None;
        let mut delay = BASE_DELAY_MS;

        for attempt in 0..=self.max_retries {
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || status.is_server_error()
                    {
                        last_error = Some(SourceError::HttpStatus {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            delay *= 2;
                            continue;
                        }
                    } else if !status.is_success() {
                        return Err(SourceError::HttpStatus {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) => {
                    last_error = Some(SourceError::Network {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SourceError::Network {
            url: url.to_string(),
            message: "unknown error".to_string(),
        }))
    }

    /// Download `url` to the file at `dest`.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), SourceError> {
        let response = self.get(url).await?;
        let bytes = response.bytes().await.map_err(|e| SourceError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(dest, &bytes)?;
        Ok(())
    }
}
