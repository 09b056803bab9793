//! Clients for the stateless collaborator services
//!
//! Artifact recognition, scene generation and collectible minting are opaque
//! remote services. These wrappers only shape requests and decode responses;
//! nothing here touches the local store or the sync queue.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::sync::remote::{check_status, decode};
use crate::sync::{SyncError, SyncResult};

/// Shared HTTP plumbing for one service base URL
#[derive(Clone)]
struct ServiceClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ServiceClient {
    fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mtrace/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post_json<B: Serialize + ?Sized, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> SyncResult<T> {
        let url = self.url(path);
        debug!(%url, "Calling service");
        let response = self
            .authorized(self.http.post(&url).json(body))
            .send()
            .await?;
        decode(check_status(response).await?).await
    }
}

// ==================== Recognition ====================

#[derive(Debug, Clone, Serialize)]
struct RecognizeRequest<'a> {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
}

/// Outcome of an artifact recognition attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub success: bool,
    #[serde(default)]
    pub artifact: Option<Value>,
    #[serde(default)]
    pub confidence: f64,
    /// Milliseconds spent by the service
    #[serde(default, alias = "processing_time")]
    pub processing_time: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Identifies an artifact from a photo
#[derive(Clone)]
pub struct RecognitionClient {
    inner: ServiceClient,
}

impl RecognitionClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> SyncResult<Self> {
        Ok(Self {
            inner: ServiceClient::new(base_url, api_key, timeout)?,
        })
    }

    pub fn from_config(config: &Config) -> SyncResult<Self> {
        Self::new(
            &config.services.recognition_url,
            config.api_key.clone(),
            config.sync.request_timeout(),
        )
    }

    /// Submit raw image bytes for recognition
    ///
    /// A service-side failure comes back as `success: false` with an error
    /// message rather than as an `Err`.
    pub async fn recognize(&self, image: &[u8], mime_type: Option<&str>) -> SyncResult<RecognitionResult> {
        if image.is_empty() {
            return Err(SyncError::ServerRejected("empty image".to_string()));
        }
        let request = RecognizeRequest {
            image: BASE64.encode(image),
            mime_type,
        };
        self.inner.post_json("recognize", &request).await
    }
}

// ==================== Scene generation ====================

/// Artifact fields the generator conditions on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub material: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneOptions {
    pub quality: String,
    /// Seconds
    pub duration: u32,
    pub include_audio: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_segments: Vec<Value>,
    pub historical_accuracy: String,
}

impl Default for SceneOptions {
    fn default() -> Self {
        Self {
            quality: "high".to_string(),
            duration: 120,
            include_audio: true,
            custom_segments: Vec::new(),
            historical_accuracy: "balanced".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRequest {
    pub artifact_id: String,
    pub artifact_info: ArtifactInfo,
    #[serde(default)]
    pub options: SceneOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_capabilities: Option<Value>,
}

impl SceneRequest {
    pub fn new(artifact_id: impl Into<String>, artifact_info: ArtifactInfo) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            artifact_info,
            options: SceneOptions::default(),
            device_capabilities: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneGenerationResult {
    pub scene: Value,
    /// Milliseconds spent by the generator
    #[serde(default)]
    pub processing_time: u64,
}

/// Progress notification from a streaming generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationProgress {
    pub stage: String,
    pub percentage: f64,
    /// Seconds remaining, as estimated by the generator
    #[serde(default)]
    pub estimated_time: f64,
}

/// One `data:` frame on the generation stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamFrame {
    Progress(GenerationProgress),
    Complete { scene: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub status: JobState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, alias = "estimated_time")]
    pub estimated_time: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Drives the scene generator
#[derive(Clone)]
pub struct SceneClient {
    inner: ServiceClient,
}

impl SceneClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> SyncResult<Self> {
        Ok(Self {
            inner: ServiceClient::new(base_url, api_key, timeout)?,
        })
    }

    pub fn from_config(config: &Config) -> SyncResult<Self> {
        Self::new(
            &config.services.scene_url,
            config.api_key.clone(),
            config.sync.request_timeout(),
        )
    }

    /// Generate a scene and wait for the whole result
    pub async fn generate(&self, request: &SceneRequest) -> SyncResult<SceneGenerationResult> {
        self.inner.post_json("generate", request).await
    }

    /// Generate a scene, reporting progress as the stream advances
    ///
    /// Returns the scene from the `complete` frame. A stream that ends
    /// without one is a protocol error.
    pub async fn generate_stream<F>(&self, request: &SceneRequest, mut on_progress: F) -> SyncResult<Value>
    where
        F: FnMut(GenerationProgress),
    {
        let url = self.inner.url("generate/stream");
        let response = self
            .inner
            .authorized(self.inner.http.post(&url).json(request))
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut lines = LineBuffer::default();
        let mut body = response.bytes_stream();
        let mut scene = None;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                match parse_event_line(&line) {
                    Some(StreamFrame::Progress(progress)) => on_progress(progress),
                    Some(StreamFrame::Complete { scene: s }) => scene = Some(s),
                    None => {}
                }
            }
        }
        if let Some(line) = lines.finish() {
            if let Some(StreamFrame::Complete { scene: s }) = parse_event_line(&line) {
                scene = Some(s);
            }
        }

        scene.ok_or_else(|| SyncError::Protocol("generation stream ended without a scene".to_string()))
    }

    pub async fn status(&self, generation_id: &str) -> SyncResult<GenerationStatus> {
        let url = self.inner.url(&format!("status/{}", generation_id));
        let response = self.inner.authorized(self.inner.http.get(&url)).send().await?;
        decode(check_status(response).await?).await
    }

    pub async fn cancel(&self, generation_id: &str) -> SyncResult<CancelResponse> {
        let url = self.inner.url(&format!("cancel/{}", generation_id));
        let response = self
            .inner
            .authorized(self.inner.http.delete(&url))
            .send()
            .await?;
        decode(check_status(response).await?).await
    }
}

/// Splits a byte stream into lines, holding partial lines across chunks
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).trim_end().to_string())
        }
    }
}

/// Parse one server-sent event line
///
/// Only `data:` lines carry frames. `[DONE]`, comments, blank lines and
/// unparseable payloads yield nothing.
fn parse_event_line(line: &str) -> Option<StreamFrame> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str(data) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "Skipping malformed generation frame");
            None
        }
    }
}

// ==================== Minting ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintRequest {
    pub scene_id: String,
    pub artifact_id: String,
    pub name: String,
    pub description: String,
    pub donation_amount: f64,
    pub recipient_address: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintResponse {
    pub transaction_hash: String,
    pub token_id: String,
    pub contract_address: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// Mints digital collectibles for generated scenes
#[derive(Clone)]
pub struct MintClient {
    inner: ServiceClient,
}

impl MintClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> SyncResult<Self> {
        Ok(Self {
            inner: ServiceClient::new(base_url, api_key, timeout)?,
        })
    }

    pub fn from_config(config: &Config) -> SyncResult<Self> {
        Self::new(
            &config.services.nft_url,
            config.api_key.clone(),
            config.sync.request_timeout(),
        )
    }

    pub async fn mint(&self, request: &MintRequest) -> SyncResult<MintResponse> {
        if request.donation_amount < 0.0 {
            return Err(SyncError::ServerRejected(
                "donation amount cannot be negative".to_string(),
            ));
        }
        self.inner.post_json("mint", request).await
    }
}
