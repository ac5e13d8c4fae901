//! Remote OCR endpoint client
//!
//! Posts the PNG as base64 to `{endpoint}/recognize` and tries the configured
//! endpoints in order until one answers. The engine runs on the worker
//! thread, so the adapter drives its own single-threaded runtime.

use base64::Engine as _;
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::engine::{EngineAdapter, EngineKind};
use super::{is_whitelisted, BoundingBox, RecognitionOptions, RecognitionToken, SourceEngine};

const USER_AGENT: &str = concat!("inkledger/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("No remote OCR endpoint configured")]
    NoEndpoint,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Parse(String),

    #[error("All endpoints failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

/// Request body accepted by the OCR service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub image_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_field: Option<String>,
}

/// Response body of the OCR service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub text: String,
    pub confidence: f32,
}

impl RemoteResponse {
    /// Convert to tokens covering the whole image; empty text yields none
    pub fn into_tokens(self, width: u32, height: u32) -> Vec<RecognitionToken> {
        let text: String = self.text.chars().filter(|&c| is_whitelisted(c)).collect();
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        vec![RecognitionToken::new(
            text,
            self.confidence,
            BoundingBox::new(0.0, 0.0, width as f32, height as f32),
            SourceEngine::Remote,
        )]
    }
}

/// HTTP OCR engine with ordered endpoint fallback
pub struct RemoteEngine {
    endpoints: Vec<String>,
    http_client: reqwest::Client,
    runtime: Option<Runtime>,
}

impl RemoteEngine {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            http_client,
            runtime: None,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Recognize a PNG, falling back through the endpoints in order
    pub async fn recognize_png(&self, png: &[u8], target_field: Option<&str>) -> Result<RemoteResponse, RemoteError> {
        if self.endpoints.is_empty() {
            return Err(RemoteError::NoEndpoint);
        }

        let body = RemoteRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(png),
            target_field: target_field.map(str::to_string),
        };

        let mut failures = Vec::new();
        for endpoint in &self.endpoints {
            match self.post_recognize(endpoint, &body).await {
                Ok(response) => {
                    debug!(endpoint = %endpoint, confidence = response.confidence, "Remote OCR answered");
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Remote OCR endpoint {} failed: {}", endpoint, e);
                    failures.push(format!("{}: {}", endpoint, e));
                }
            }
        }

        Err(RemoteError::Exhausted(failures))
    }

    async fn post_recognize(&self, endpoint: &str, body: &RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        let response = self
            .http_client
            .post(format!("{}/recognize", endpoint))
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<RemoteResponse>()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))
    }

    /// First endpoint whose `/health` answers 2xx
    pub async fn probe_health(&self) -> Result<String, RemoteError> {
        if self.endpoints.is_empty() {
            return Err(RemoteError::NoEndpoint);
        }

        let mut failures = Vec::new();
        for endpoint in &self.endpoints {
            match self.http_client.get(format!("{}/health", endpoint)).send().await {
                Ok(response) if response.status().is_success() => return Ok(endpoint.clone()),
                Ok(response) => failures.push(format!("{}: status {}", endpoint, response.status().as_u16())),
                Err(e) => failures.push(format!("{}: {}", endpoint, e)),
            }
        }
        Err(RemoteError::Exhausted(failures))
    }

    fn runtime(&self) -> anyhow::Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Remote engine not initialized"))
    }
}

impl EngineAdapter for RemoteEngine {
    fn name(&self) -> &str {
        "remote"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Remote
    }

    fn is_ready(&self) -> bool {
        self.runtime.is_some() && !self.endpoints.is_empty()
    }

    fn init(&mut self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            return Err(RemoteError::NoEndpoint.into());
        }
        if self.runtime.is_none() {
            self.runtime = Some(tokio::runtime::Builder::new_current_thread().enable_all().build()?);
        }
        Ok(())
    }

    fn warmup(&mut self) -> anyhow::Result<()> {
        let endpoint = self.runtime()?.block_on(self.probe_health())?;
        info!("Remote OCR endpoint {} is healthy", endpoint);
        Ok(())
    }

    fn recognize(&mut self, image: &RgbaImage, options: &RecognitionOptions) -> anyhow::Result<Vec<RecognitionToken>> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let response = self
            .runtime()?
            .block_on(self.recognize_png(&png, options.target_field.as_deref()))?;
        Ok(response.into_tokens(image.width(), image.height()))
    }
}
