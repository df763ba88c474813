//! Veo long-running operations over the Gemini REST API.

use crate::backend::{
    Artifact, ArtifactFetcher, GenerationBackend, GenerationRequest, HttpFetcher, OperationHandle,
    PollPlan, PollStatus, TimeoutPolicy, await_completion, run_job,
};
use crate::brief::BackendKind;
use crate::config::{Config, PollingSettings};
use crate::error::{GenResult, GenerationError};
use crate::executor::CancelFlag;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Segment durations for one extended clip: an initial segment followed by
/// fixed-size extensions until the target is covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionPlan {
    pub initial_sec: u32,
    pub step_sec: u32,
    pub extensions: u32,
}

impl ExtensionPlan {
    pub fn new(target_sec: u32, settings: &PollingSettings) -> Self {
        let initial = settings.initial_segment_secs;
        let step = settings.extension_step_secs.max(1);
        let target = target_sec.clamp(initial, settings.max_extended_secs.max(initial));
        Self {
            initial_sec: initial,
            step_sec: step,
            extensions: (target - initial).div_ceil(step),
        }
    }

    pub fn total_sec(&self) -> u32 {
        self.initial_sec + self.step_sec * self.extensions
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest {
    instances: Vec<Instance>,
    parameters: Parameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<VideoRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reference_images: Vec<ReferenceImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VideoRef {
    uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReferenceImage {
    image: InlineImage,
    reference_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineImage {
    bytes_base64_encoded: String,
    mime_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Parameters {
    aspect_ratio: &'static str,
    duration_seconds: u32,
    resolution: String,
    sample_count: usize,
}

#[derive(Debug, Deserialize)]
struct OperationStarted {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationState {
    #[serde(default)]
    done: bool,
    error: Option<OperationError>,
    response: Option<OperationResponse>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateVideoResponse {
    #[serde(default)]
    generated_samples: Vec<GeneratedSample>,
    #[serde(default)]
    rai_media_filtered_reasons: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GeneratedSample {
    video: Option<VideoRef>,
}

impl OperationState {
    fn into_status(self) -> PollStatus {
        if let Some(err) = self.error {
            return PollStatus::Failed(format!("Veo operation error {}: {}", err.code, err.message));
        }
        if !self.done {
            return PollStatus::Pending { rendered: 0 };
        }
        let Some(video) = self.response.and_then(|r| r.generate_video_response) else {
            return PollStatus::Failed("Veo operation finished without a response".to_string());
        };
        let artifacts: Vec<Artifact> = video
            .generated_samples
            .into_iter()
            .filter_map(|s| s.video)
            .map(|v| Artifact::new(v.uri))
            .collect();
        if artifacts.is_empty() {
            let reason = if video.rai_media_filtered_reasons.is_empty() {
                "no video in response".to_string()
            } else {
                format!("filtered: {}", video.rai_media_filtered_reasons.join("; "))
            };
            return PollStatus::Failed(format!("Veo operation finished with {}", reason));
        }
        PollStatus::Ready(artifacts)
    }
}

pub struct PollingApiBackend {
    client: Client,
    api_base: String,
    model: String,
    api_key: String,
    settings: PollingSettings,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl PollingApiBackend {
    pub fn new(client: Client, cfg: &Config, api_key: &str) -> Self {
        let fetcher = Arc::new(HttpFetcher::new(client.clone(), Some(api_key.to_string())));
        Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            model: cfg.video_model.clone(),
            api_key: api_key.to_string(),
            settings: cfg.polling.clone(),
            fetcher,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    async fn reference_images(&self, request: &GenerationRequest) -> GenResult<Vec<ReferenceImage>> {
        let mut images = Vec::with_capacity(request.reference_images.len());
        for path in &request.reference_images {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                GenerationError::input(format!("cannot read reference {}: {}", path.display(), e))
            })?;
            images.push(ReferenceImage {
                image: InlineImage {
                    bytes_base64_encoded: STANDARD.encode(bytes),
                    mime_type: crate::api::gemini::image_mime_type(path),
                },
                reference_type: "asset",
            });
        }
        Ok(images)
    }

    async fn start_operation(
        &self,
        request: &GenerationRequest,
        seed: Option<&Artifact>,
        duration_sec: u32,
    ) -> GenResult<OperationHandle> {
        // Continuations carry the previous clip instead of the stills.
        let (reference_images, sample_count) = match seed {
            Some(_) => (Vec::new(), 1),
            None => (self.reference_images(request).await?, request.output_count.max(1)),
        };
        let body = PredictRequest {
            instances: vec![Instance {
                prompt: request.prompt.clone(),
                video: seed.map(|a| VideoRef { uri: a.uri.clone() }),
                reference_images,
            }],
            parameters: Parameters {
                aspect_ratio: request.aspect_ratio.as_str(),
                duration_seconds: duration_sec,
                resolution: request.resolution.clone(),
                sample_count,
            },
        };

        let url = format!("{}/models/{}:predictLongRunning", self.api_base, self.model);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = raw.chars().take(400).collect();
            return Err(GenerationError::backend(format!(
                "Veo HTTP {}: {}",
                status.as_u16(),
                snippet
            )));
        }
        let started: OperationStarted = serde_json::from_str(&raw)
            .map_err(|e| GenerationError::backend(format!("Veo submit response parse failed: {}", e)))?;
        info!("[{}] Veo operation started: {}", request.task_id, started.name);
        Ok(OperationHandle::new(started.name, BackendKind::PollingApi))
    }

    async fn run_extension_chain(
        &self,
        request: &GenerationRequest,
        target_sec: u32,
        retry: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> GenResult<Vec<PathBuf>> {
        let plan = ExtensionPlan::new(target_sec, &self.settings);
        info!(
            "[{}] extended clip: {}s initial + {} x {}s = {}s",
            request.task_id,
            plan.initial_sec,
            plan.extensions,
            plan.step_sec,
            plan.total_sec()
        );

        let initial = plan.initial_sec;
        let mut handle = retry
            .run("submit", move || self.start_operation(request, None, initial))
            .await?;
        let mut artifacts = await_completion(self, &handle, cancel).await?.into_artifacts();

        for step in 1..=plan.extensions {
            let seed = artifacts
                .first()
                .cloned()
                .ok_or_else(|| GenerationError::backend("extension chain lost its seed clip"))?;
            let seed = &seed;
            let step_sec = plan.step_sec;
            info!("[{}] extension {}/{}", request.task_id, step, plan.extensions);
            handle = retry
                .run("extend", move || self.start_operation(request, Some(seed), step_sec))
                .await?;
            artifacts = await_completion(self, &handle, cancel).await?.into_artifacts();
        }

        // Only the last segment is fetched; it contains the whole clip.
        artifacts.truncate(1);
        self.download(handle, artifacts, request).await
    }
}

#[async_trait]
impl GenerationBackend for PollingApiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PollingApi
    }

    fn poll_plan(&self) -> PollPlan {
        PollPlan {
            interval: self.settings.interval(),
            max_attempts: self.settings.max_attempts,
            on_timeout: TimeoutPolicy::Fail,
        }
    }

    async fn submit(&self, request: &GenerationRequest) -> GenResult<OperationHandle> {
        self.start_operation(request, None, request.duration_sec).await
    }

    async fn poll(&self, handle: &OperationHandle) -> GenResult<PollStatus> {
        let url = format!("{}/{}", self.api_base, handle.id());
        let resp = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GenerationError::backend(format!(
                "Veo HTTP {} while polling {}",
                status.as_u16(),
                handle.id()
            )));
        }
        let state: OperationState = serde_json::from_str(&raw)
            .map_err(|e| GenerationError::backend(format!("Veo poll response parse failed: {}", e)))?;
        Ok(state.into_status())
    }

    async fn collect(&self, _handle: &OperationHandle) -> GenResult<Vec<Artifact>> {
        Ok(Vec::new())
    }

    async fn download(
        &self,
        handle: OperationHandle,
        mut artifacts: Vec<Artifact>,
        request: &GenerationRequest,
    ) -> GenResult<Vec<PathBuf>> {
        if artifacts.is_empty() {
            return Err(GenerationError::download(format!("{}: no video to fetch", handle.id())));
        }
        if artifacts.len() > request.output_count {
            warn!(
                "[{}] {} videos returned, keeping {}",
                request.task_id,
                artifacts.len(),
                request.output_count
            );
            artifacts.truncate(request.output_count);
        }

        let mut paths = Vec::with_capacity(artifacts.len());
        for (i, artifact) in artifacts.iter().enumerate() {
            let dest = request.output_slot(i);
            let bytes = self.fetcher.fetch(&artifact.uri, &dest).await?;
            info!("[{}] saved {} ({} bytes)", request.task_id, dest.display(), bytes);
            paths.push(dest);
        }
        Ok(paths)
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        retry: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> GenResult<Vec<PathBuf>> {
        match request.extended_duration_sec {
            Some(target) if target > self.settings.initial_segment_secs => {
                self.run_extension_chain(request, target, retry, cancel).await
            }
            _ => run_job(self, request, retry, cancel).await,
        }
    }
}
