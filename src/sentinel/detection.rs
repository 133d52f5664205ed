//! Detection On Demand adapter
//!
//! Submissions are multipart uploads authenticated with the `feye-auth-key` header.
//! Reports are fetched by id until their `overall_status` is `DONE`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use thiserror::Error;
use tracing::debug;

use crate::sentinel::config_loader::Detection;
use crate::sentinel::{Report, SubmitResponse};

const AUTH_HEADER: &str = "feye-auth-key";

/// Error types for the detection service
#[derive(Error, Debug)]
pub enum DetectionError {
    /// The service refused this particular request (4xx). Never retried.
    #[error("Client error ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Detection API key is not configured")]
    MissingApiKey,
}

impl DetectionError {
    /// Client-side errors are per-item failures; everything else is transient.
    pub fn is_client(&self) -> bool {
        matches!(self, DetectionError::Client { .. })
    }

    /// The service rejected our API key; nothing else in this run can succeed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            DetectionError::Client { status: 401 | 403, .. } | DetectionError::MissingApiKey
        )
    }
}

/// Result type for detection operations
pub type DetectionResult<T> = Result<T, DetectionError>;

#[async_trait]
pub trait DetectionService: Send + Sync + 'static {
    async fn submit(&self, name: &str, content: Vec<u8>) -> DetectionResult<SubmitResponse>;

    async fn get_report(&self, report_id: &str) -> DetectionResult<Report>;
}

/// REST client for the detection service. Safe to share between workers.
pub struct DetectionClient {
    client: Client,
    api_base: String,
    api_key: String,
}

impl DetectionClient {
    pub fn new(config: &Detection) -> DetectionResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(DetectionError::MissingApiKey);
        }

        let client = Client::builder()
            .user_agent(format!("drive_sentinel/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn check(response: Response) -> DetectionResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(DetectionError::Client {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(DetectionError::Server {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl DetectionService for DetectionClient {
    async fn submit(&self, name: &str, content: Vec<u8>) -> DetectionResult<SubmitResponse> {
        let size = content.len();
        let form = Form::new().part("file", Part::bytes(content).file_name(name.to_string()));

        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .header(AUTH_HEADER, &self.api_key)
            .multipart(form)
            .send()
            .await?;
        let ack: SubmitResponse = Self::check(response).await?.json().await?;
        debug!("Submitted {} ({} bytes): status={}", name, size, ack.status);
        Ok(ack)
    }

    async fn get_report(&self, report_id: &str) -> DetectionResult<Report> {
        let response = self
            .client
            .get(format!("{}/reports/{}", self.api_base, report_id))
            .header(AUTH_HEADER, &self.api_key)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
