//! Video generation backends.
//!
//! A backend turns one [`GenerationRequest`] into files on disk through a
//! submit / poll / download cycle. [`run_job`] drives that cycle the same way
//! for every backend: submission goes through the retry policy, polling
//! follows the backend's [`PollPlan`], and download is attempted once.

use crate::brief::{AspectRatio, BackendKind, Credentials};
use crate::config::Config;
use crate::error::{GenResult, GenerationError};
use crate::executor::CancelFlag;
use crate::retry::{Classify, RetryPolicy};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub mod browser;
pub mod polling;

pub use browser::BrowserAutomationBackend;
pub use polling::PollingApiBackend;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub task_id: String,
    pub scene: usize,
    pub prompt: String,
    pub reference_images: Vec<PathBuf>,
    pub duration_sec: u32,
    pub resolution: String,
    pub aspect_ratio: AspectRatio,
    pub output_count: usize,
    /// Slot for the first output; extra outputs get numbered siblings.
    pub output_path: PathBuf,
    pub extended_duration_sec: Option<u32>,
}

impl GenerationRequest {
    /// `video_01.mp4`, `video_01_2.mp4`, `video_01_3.mp4`, ...
    pub fn output_slot(&self, index: usize) -> PathBuf {
        if index == 0 {
            return self.output_path.clone();
        }
        let stem = self
            .output_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let ext = self
            .output_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mp4".to_string());
        self.output_path
            .with_file_name(format!("{}_{}.{}", stem, index + 1, ext))
    }
}

/// Reference to one in-flight remote job. Not `Clone`: downloading
/// consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct OperationHandle {
    id: String,
    backend: BackendKind,
}

impl OperationHandle {
    pub fn new(id: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            id: id.into(),
            backend,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub uri: String,
}

impl Artifact {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending { rendered: usize },
    Ready(Vec<Artifact>),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Ceiling reached is a task failure.
    Fail,
    /// Ceiling reached hands over whatever has rendered, even nothing.
    AcceptPartial,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPlan {
    pub interval: Duration,
    pub max_attempts: u32,
    pub on_timeout: TimeoutPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    Rendered(Vec<Artifact>),
    TimedOut { partial: Vec<Artifact> },
}

impl RenderOutcome {
    pub fn into_artifacts(self) -> Vec<Artifact> {
        match self {
            RenderOutcome::Rendered(artifacts) => artifacts,
            RenderOutcome::TimedOut { partial } => partial,
        }
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn poll_plan(&self) -> PollPlan;

    /// Starts a remote job. Wrapped in the retry policy by [`run_job`].
    async fn submit(&self, request: &GenerationRequest) -> GenResult<OperationHandle>;

    async fn poll(&self, handle: &OperationHandle) -> GenResult<PollStatus>;

    /// What is available right now, used when the poll ceiling is reached
    /// under [`TimeoutPolicy::AcceptPartial`].
    async fn collect(&self, handle: &OperationHandle) -> GenResult<Vec<Artifact>>;

    /// Fetches artifacts into the request's output slots. Never retried.
    async fn download(
        &self,
        handle: OperationHandle,
        artifacts: Vec<Artifact>,
        request: &GenerationRequest,
    ) -> GenResult<Vec<PathBuf>>;

    async fn generate(
        &self,
        request: &GenerationRequest,
        retry: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> GenResult<Vec<PathBuf>> {
        run_job(self, request, retry, cancel).await
    }

    /// Releases long-lived resources such as a browser session.
    async fn shutdown(&self) -> GenResult<()> {
        Ok(())
    }
}

/// Polls `handle` until the backend reports a result or the plan runs out.
pub async fn await_completion<B: GenerationBackend + ?Sized>(
    backend: &B,
    handle: &OperationHandle,
    cancel: &CancelFlag,
) -> GenResult<RenderOutcome> {
    let plan = backend.poll_plan();
    let mut last_rendered = 0usize;

    for attempt in 1..=plan.max_attempts {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        tokio::time::sleep(plan.interval).await;

        match backend.poll(handle).await {
            Ok(PollStatus::Ready(artifacts)) => {
                debug!("{} ready after {} polls", handle.id(), attempt);
                return Ok(RenderOutcome::Rendered(artifacts));
            }
            Ok(PollStatus::Failed(reason)) => return Err(GenerationError::backend(reason)),
            Ok(PollStatus::Pending { rendered }) => {
                if rendered != last_rendered {
                    info!("{}: {} rendered so far", handle.id(), rendered);
                    last_rendered = rendered;
                }
            }
            Err(err) if err.is_transient() => {
                warn!("poll {}/{} for {} failed: {}", attempt, plan.max_attempts, handle.id(), err);
            }
            Err(err) => return Err(err),
        }
    }

    let waited = plan.interval.saturating_mul(plan.max_attempts);
    match plan.on_timeout {
        TimeoutPolicy::Fail => Err(GenerationError::timeout(format!(
            "{} still pending after {}s",
            handle.id(),
            waited.as_secs()
        ))),
        TimeoutPolicy::AcceptPartial => {
            let partial = backend.collect(handle).await?;
            info!(
                "{}: render wait ended after {}s with {} result(s)",
                handle.id(),
                waited.as_secs(),
                partial.len()
            );
            Ok(RenderOutcome::TimedOut { partial })
        }
    }
}

/// Submit with retry, poll, then download once.
pub async fn run_job<B: GenerationBackend + ?Sized>(
    backend: &B,
    request: &GenerationRequest,
    retry: &RetryPolicy,
    cancel: &CancelFlag,
) -> GenResult<Vec<PathBuf>> {
    if cancel.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    let handle = retry.run("submit", move || backend.submit(request)).await?;
    let outcome = await_completion(backend, &handle, cancel).await?;
    backend
        .download(handle, outcome.into_artifacts(), request)
        .await
}

/// Writes a remote artifact to disk.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Returns the number of bytes written.
    async fn fetch(&self, uri: &str, dest: &Path) -> GenResult<u64>;
}

pub struct HttpFetcher {
    client: Client,
    api_key: Option<String>,
}

impl HttpFetcher {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }

    async fn stream_to(&self, uri: &str, dest: &Path) -> GenResult<u64> {
        let mut req = self.client.get(uri);
        if let Some(key) = &self.api_key {
            req = req.header("x-goog-api-key", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GenerationError::download(format!(
                "HTTP {} for {}",
                status.as_u16(),
                uri
            )));
        }

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str, dest: &Path) -> GenResult<u64> {
        match self.stream_to(uri, dest).await {
            Ok(n) => Ok(n),
            Err(err) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(match err {
                    GenerationError::Download(_) => err,
                    other => GenerationError::download(other.to_string()),
                })
            }
        }
    }
}

pub fn create_backend(
    kind: BackendKind,
    cfg: &Config,
    credentials: &Credentials,
    client: Client,
) -> GenResult<Arc<dyn GenerationBackend>> {
    match kind {
        BackendKind::PollingApi => {
            let key = credentials
                .api_key()
                .ok_or_else(|| GenerationError::input("polling backend needs an api_key"))?;
            Ok(Arc::new(PollingApiBackend::new(client, cfg, key)))
        }
        BackendKind::Browser => {
            let cookie = credentials
                .session_cookie()
                .ok_or_else(|| GenerationError::input("browser backend needs a session_cookie"))?;
            Ok(Arc::new(BrowserAutomationBackend::new(&cfg.browser, cookie)?))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn request(scene: usize, dir: &Path) -> GenerationRequest {
        GenerationRequest {
            task_id: format!("task{}", scene),
            scene,
            prompt: format!("prompt {}", scene),
            reference_images: Vec::new(),
            duration_sec: 8,
            resolution: "720p".into(),
            aspect_ratio: AspectRatio::Portrait,
            output_count: 1,
            output_path: dir.join(format!("video_{:02}.mp4", scene)),
            extended_duration_sec: None,
        }
    }

    /// Copies a fixed payload to the destination, failing for chosen URIs.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub failing: Vec<String>,
        pub fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArtifactFetcher for FakeFetcher {
        async fn fetch(&self, uri: &str, dest: &Path) -> GenResult<u64> {
            if self.failing.iter().any(|f| f == uri) {
                return Err(GenerationError::download(format!("HTTP 404 for {}", uri)));
            }
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, b"mp4").await?;
            self.fetched.lock().unwrap().push(uri.to_string());
            Ok(3)
        }
    }

    /// Backend scripted per call: submit failures, polls until ready.
    pub(crate) struct ScriptedBackend {
        pub submit_failures: Vec<&'static str>,
        pub polls_until_ready: u32,
        pub plan: PollPlan,
        pub submits: AtomicU32,
        pub polls: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(polls_until_ready: u32, on_timeout: TimeoutPolicy) -> Self {
            Self {
                submit_failures: Vec::new(),
                polls_until_ready,
                plan: PollPlan {
                    interval: Duration::from_secs(10),
                    max_attempts: 6,
                    on_timeout,
                },
                submits: AtomicU32::new(0),
                polls: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::PollingApi
        }

        fn poll_plan(&self) -> PollPlan {
            self.plan
        }

        async fn submit(&self, request: &GenerationRequest) -> GenResult<OperationHandle> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst) as usize;
            if let Some(msg) = self.submit_failures.get(n) {
                return Err(GenerationError::backend(*msg));
            }
            Ok(OperationHandle::new(format!("op-{}", request.task_id), self.kind()))
        }

        async fn poll(&self, handle: &OperationHandle) -> GenResult<PollStatus> {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(handle.id().to_string()).or_insert(0);
            *count += 1;
            if *count >= self.polls_until_ready {
                Ok(PollStatus::Ready(vec![Artifact::new(format!("mem://{}", handle.id()))]))
            } else {
                Ok(PollStatus::Pending { rendered: 0 })
            }
        }

        async fn collect(&self, _handle: &OperationHandle) -> GenResult<Vec<Artifact>> {
            Ok(Vec::new())
        }

        async fn download(
            &self,
            handle: OperationHandle,
            artifacts: Vec<Artifact>,
            request: &GenerationRequest,
        ) -> GenResult<Vec<PathBuf>> {
            if artifacts.is_empty() {
                return Err(GenerationError::download(format!("{}: nothing to download", handle.id())));
            }
            let path = request.output_slot(0);
            tokio::fs::write(&path, b"mp4").await?;
            Ok(vec![path])
        }
    }

    #[test]
    fn output_slots_are_numbered_siblings() {
        let req = request(3, Path::new("out"));
        assert_eq!(req.output_slot(0), PathBuf::from("out/video_03.mp4"));
        assert_eq!(req.output_slot(1), PathBuf::from("out/video_03_2.mp4"));
    }

    #[tokio::test(start_paused = true)]
    async fn job_retries_transient_submit_then_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = ScriptedBackend::new(2, TimeoutPolicy::Fail);
        backend.submit_failures = vec!["429 RESOURCE_EXHAUSTED", "503 unavailable"];

        let paths = run_job(&backend, &request(1, dir.path()), &RetryPolicy::default(), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(backend.submits.load(Ordering::SeqCst), 3);
        assert_eq!(paths, vec![dir.path().join("video_01.mp4")]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_submit_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = ScriptedBackend::new(1, TimeoutPolicy::Fail);
        backend.submit_failures = vec!["prompt blocked by safety filter"];

        let err = run_job(&backend, &request(1, dir.path()), &RetryPolicy::default(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Backend(_)));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_ceiling_fails_or_hands_over_partial() {
        let dir = tempfile::tempdir().unwrap();
        let strict = ScriptedBackend::new(100, TimeoutPolicy::Fail);
        let err = run_job(&strict, &request(1, dir.path()), &RetryPolicy::none(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(_)));
        assert_eq!(strict.polls.lock().unwrap()["op-task1"], 6);

        let lenient = ScriptedBackend::new(100, TimeoutPolicy::AcceptPartial);
        let err = run_job(&lenient, &request(1, dir.path()), &RetryPolicy::none(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Download(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(100, TimeoutPolicy::Fail);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = run_job(&backend, &request(1, dir.path()), &RetryPolicy::none(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Cancelled));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 0);
    }
}
