//! Flow web UI driven through a real browser session.
//!
//! One backend owns one page. A job walks the page through
//! `Disconnected → SessionStarted → Authenticated → ProjectReady →
//! PromptSubmitted → Rendering → ResultsReady → Downloaded`, stopping in
//! `AuthFailed`, `SubmitFailed`, `RenderTimeout` or `DownloadFailed` when a
//! step cannot complete. Jobs sharing the backend run one after another.

pub mod driver;
pub mod selectors;
pub mod webdriver;

use crate::backend::{
    Artifact, ArtifactFetcher, GenerationBackend, GenerationRequest, HttpFetcher, OperationHandle,
    PollPlan, PollStatus, TimeoutPolicy, run_job,
};
use crate::brief::BackendKind;
use crate::config::BrowserSettings;
use crate::cookies::{CookieRecord, cookies_for_domain, parse_cookie_string};
use crate::error::{GenResult, GenerationError};
use crate::executor::CancelFlag;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use driver::{BrowserDriver, ElementId};
use reqwest::Url;
use reqwest::cookie::Jar;
use selectors::Locator;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use webdriver::WebDriverClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BrowserState {
    Disconnected,
    SessionStarted,
    Authenticated,
    ProjectReady,
    PromptSubmitted,
    Rendering,
    ResultsReady,
    Downloaded,
    AuthFailed,
    SubmitFailed,
    RenderTimeout,
    DownloadFailed,
}

struct Session {
    driver: Box<dyn BrowserDriver>,
    state: BrowserState,
    jobs: u64,
}

impl Session {
    fn set_state(&mut self, next: BrowserState) {
        if self.state != next {
            debug!("browser: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

pub struct BrowserAutomationBackend {
    settings: BrowserSettings,
    target_host: String,
    target_origin: String,
    cookies: Vec<CookieRecord>,
    session: Mutex<Session>,
    job_lock: Mutex<()>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

fn parse_target(target_url: &str) -> GenResult<(String, String)> {
    let url = Url::parse(target_url)
        .map_err(|e| GenerationError::input(format!("bad target_url {}: {}", target_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| GenerationError::input(format!("target_url has no host: {}", target_url)))?
        .to_string();
    Ok((host, url.origin().ascii_serialization()))
}

impl BrowserAutomationBackend {
    /// The browser session itself opens with the first job.
    pub fn new(settings: &BrowserSettings, raw_cookie: &str) -> GenResult<Self> {
        let (_, origin) = parse_target(&settings.target_url)?;
        let jar = Arc::new(Jar::default());
        if let Ok(url) = Url::parse(&origin) {
            for cookie in parse_cookie_string(raw_cookie) {
                jar.add_cookie_str(&format!("{}={}", cookie.name, cookie.value), &url);
            }
        }
        let download_client = reqwest::Client::builder().cookie_provider(jar).build()?;
        let driver = WebDriverClient::new(
            reqwest::Client::new(),
            &settings.webdriver_url,
            settings.headless,
            settings.page_load_timeout(),
        );
        Self::with_driver(
            settings,
            raw_cookie,
            Box::new(driver),
            Arc::new(HttpFetcher::new(download_client, None)),
        )
    }

    pub fn with_driver(
        settings: &BrowserSettings,
        raw_cookie: &str,
        driver: Box<dyn BrowserDriver>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> GenResult<Self> {
        let (host, origin) = parse_target(&settings.target_url)?;
        let cookies = cookies_for_domain(&parse_cookie_string(raw_cookie), &host);
        if cookies.is_empty() {
            return Err(GenerationError::input("session cookie string has no cookies"));
        }
        Ok(Self {
            settings: settings.clone(),
            target_host: host,
            target_origin: origin,
            cookies,
            session: Mutex::new(Session {
                driver,
                state: BrowserState::Disconnected,
                jobs: 0,
            }),
            job_lock: Mutex::new(()),
            fetcher,
        })
    }

    pub async fn state(&self) -> BrowserState {
        self.session.lock().await.state
    }

    async fn wait_for_document(&self, driver: &mut dyn BrowserDriver) {
        let deadline = Instant::now() + self.settings.page_load_timeout();
        loop {
            match driver.ready_state().await {
                Ok(state) if state == "complete" => return,
                Ok(_) => {}
                Err(err) => debug!("readyState check failed: {}", err),
            }
            if Instant::now() >= deadline {
                warn!("page did not settle within {:?}", self.settings.page_load_timeout());
                return;
            }
            sleep(self.settings.settle_delay()).await;
        }
    }

    async fn start_session(&self, session: &mut Session) -> GenResult<()> {
        let driver = session.driver.as_mut();
        driver.start().await?;
        // Cookies can only be set for the page that is loaded.
        driver.goto(&self.target_origin).await?;
        driver.add_cookies(&self.cookies).await?;
        info!("injected {} cookies for {}", self.cookies.len(), self.target_host);
        session.set_state(BrowserState::SessionStarted);
        Ok(())
    }

    async fn open_target(&self, session: &mut Session) -> GenResult<()> {
        let driver = session.driver.as_mut();
        driver.goto(&self.settings.target_url).await?;
        self.wait_for_document(driver).await;
        Ok(())
    }

    async fn authenticate(&self, session: &mut Session) -> GenResult<()> {
        let deadline = Instant::now() + self.settings.login_check();
        let selectors = &self.settings.selectors;
        loop {
            let url = session.driver.current_url().await.unwrap_or_default();
            if url.contains(&self.settings.sign_in_host) {
                session.set_state(BrowserState::AuthFailed);
                return Err(GenerationError::session(
                    "redirected to sign-in; session cookie expired or invalid",
                ));
            }

            let driver = session.driver.as_mut();
            if first_visible(driver, &selectors.ready).await.is_some()
                || first_visible(driver, &selectors.new_project).await.is_some()
            {
                session.set_state(BrowserState::Authenticated);
                return Ok(());
            }

            if Instant::now() >= deadline {
                session.set_state(BrowserState::AuthFailed);
                return Err(GenerationError::session(
                    "Flow page never showed a signed-in view; check the session cookie",
                ));
            }
            sleep(self.settings.login_retry_interval()).await;
        }
    }

    async fn dismiss_popups(&self, driver: &mut dyn BrowserDriver) {
        for locator in &self.settings.selectors.close_popup {
            if let Some(button) = first_visible(driver, std::slice::from_ref(locator)).await {
                if driver.click(&button).await.is_ok() {
                    debug!("closed popup via {}", locator.value);
                    sleep(self.settings.settle_delay()).await;
                    return;
                }
            }
        }
        if let Err(err) = driver.press_escape().await {
            debug!("escape fallback failed: {}", err);
        }
    }

    async fn prepare_project(&self, session: &mut Session) {
        let driver = session.driver.as_mut();
        self.dismiss_popups(driver).await;
        match first_visible(driver, &self.settings.selectors.new_project).await {
            Some(button) => match driver.click(&button).await {
                Ok(()) => {
                    sleep(self.settings.settle_delay()).await;
                    self.dismiss_popups(driver).await;
                }
                Err(err) => warn!("new project click failed: {}", err),
            },
            None => debug!("no new project button, using current page"),
        }
        session.set_state(BrowserState::ProjectReady);
    }

    async fn submit_prompt(&self, session: &mut Session, prompt: &str) -> GenResult<()> {
        let selectors = &self.settings.selectors;
        let driver = session.driver.as_mut();

        let Some(input) = first_visible(driver, &selectors.prompt_input).await else {
            session.set_state(BrowserState::SubmitFailed);
            return Err(GenerationError::submit("prompt input not found"));
        };
        if let Err(err) = driver.fill(&input, prompt).await {
            session.set_state(BrowserState::SubmitFailed);
            return Err(GenerationError::submit(format!("could not type prompt: {}", err)));
        }

        let timeout = self.settings.submit_enable_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(button) = first_visible(driver, &selectors.submit).await {
                let disabled = driver.attribute(&button, "disabled").await.unwrap_or(None);
                if disabled.is_none() {
                    if let Err(err) = driver.click(&button).await {
                        session.set_state(BrowserState::SubmitFailed);
                        return Err(GenerationError::submit(format!("submit click failed: {}", err)));
                    }
                    session.set_state(BrowserState::PromptSubmitted);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                session.set_state(BrowserState::SubmitFailed);
                return Err(GenerationError::submit(format!(
                    "submit control not enabled after {}s",
                    timeout.as_secs()
                )));
            }
            sleep(self.settings.submit_poll_interval()).await;
        }
    }

    async fn rendered_videos(&self, driver: &mut dyn BrowserDriver) -> GenResult<Vec<ElementId>> {
        driver.find_all(&self.settings.selectors.rendered_video).await
    }

    /// Closes the browser. The next job opens a fresh session.
    async fn close_session(&self) -> GenResult<()> {
        let mut session = self.session.lock().await;
        session.driver.close().await?;
        session.set_state(BrowserState::Disconnected);
        Ok(())
    }
}

/// First element from an ordered candidate list that is visible.
async fn first_visible(driver: &mut dyn BrowserDriver, candidates: &[Locator]) -> Option<ElementId> {
    for locator in candidates {
        let found = match driver.find_all(locator).await {
            Ok(found) => found,
            Err(err) => {
                debug!("locator {} failed: {}", locator.value, err);
                continue;
            }
        };
        for element in found {
            if driver.is_visible(&element).await.unwrap_or(false) {
                return Some(element);
            }
        }
    }
    None
}

fn is_http(src: &str) -> bool {
    src.starts_with("http://") || src.starts_with("https://")
}

fn download_name(dir: &Path, stamp: i64, scene: usize, index: usize) -> PathBuf {
    dir.join(format!("veo_{}_{:02}_{}.mp4", stamp, scene, index + 1))
}

#[async_trait]
impl GenerationBackend for BrowserAutomationBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Browser
    }

    fn poll_plan(&self) -> PollPlan {
        PollPlan {
            interval: self.settings.render_poll_interval(),
            max_attempts: self.settings.render_poll_attempts(),
            on_timeout: TimeoutPolicy::AcceptPartial,
        }
    }

    async fn submit(&self, request: &GenerationRequest) -> GenResult<OperationHandle> {
        if let Some(target) = request.extended_duration_sec {
            warn!(
                "[{}] Flow renders single clips; {}s extension ignored, aspect ratio {} is left to the page",
                request.task_id, target, request.aspect_ratio
            );
        }
        let mut session = self.session.lock().await;
        if session.state == BrowserState::AuthFailed {
            return Err(GenerationError::session(
                "browser session was rejected earlier; refresh the session cookie",
            ));
        }

        if session.state == BrowserState::Disconnected {
            self.start_session(&mut session).await?;
        }
        self.open_target(&mut session).await?;
        self.authenticate(&mut session).await?;
        self.prepare_project(&mut session).await;
        self.submit_prompt(&mut session, &request.prompt).await?;

        session.jobs += 1;
        session.set_state(BrowserState::Rendering);
        info!("[{}] prompt submitted to Flow", request.task_id);
        Ok(OperationHandle::new(
            format!("flow-{}-{}", session.jobs, request.task_id),
            BackendKind::Browser,
        ))
    }

    async fn poll(&self, _handle: &OperationHandle) -> GenResult<PollStatus> {
        let mut session = self.session.lock().await;
        let rendered = match self.rendered_videos(session.driver.as_mut()).await {
            Ok(found) => found.len(),
            Err(err) => {
                debug!("video count failed: {}", err);
                0
            }
        };
        // Flow gives no completion signal; the full window is always waited out.
        Ok(PollStatus::Pending { rendered })
    }

    async fn collect(&self, handle: &OperationHandle) -> GenResult<Vec<Artifact>> {
        let mut session = self.session.lock().await;
        let driver = session.driver.as_mut();
        let videos = self.rendered_videos(driver).await?;

        let mut artifacts = Vec::with_capacity(videos.len());
        for video in &videos {
            match driver.attribute(video, "src").await {
                Ok(Some(src)) if is_http(&src) => artifacts.push(Artifact::new(src)),
                Ok(other) => debug!("skipping video without http source: {:?}", other),
                Err(err) => debug!("could not read video source: {}", err),
            }
        }
        info!(
            "{}: {} rendered, {} downloadable",
            handle.id(),
            videos.len(),
            artifacts.len()
        );
        session.set_state(if videos.is_empty() {
            BrowserState::RenderTimeout
        } else {
            BrowserState::ResultsReady
        });
        Ok(artifacts)
    }

    async fn download(
        &self,
        handle: OperationHandle,
        artifacts: Vec<Artifact>,
        request: &GenerationRequest,
    ) -> GenResult<Vec<PathBuf>> {
        if artifacts.is_empty() {
            return Err(GenerationError::download(format!(
                "{}: no rendered video to download",
                handle.id()
            )));
        }

        let dir = request
            .output_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let stamp = chrono::Local::now().timestamp_millis();
        let mut paths = Vec::new();
        // Later videos stand in for ones that fail to download.
        for (i, artifact) in artifacts.iter().enumerate() {
            if paths.len() >= request.output_count {
                break;
            }
            let dest = download_name(dir, stamp, request.scene, paths.len());
            match self.fetcher.fetch(&artifact.uri, &dest).await {
                Ok(bytes) => {
                    info!("[{}] saved {} ({} bytes)", request.task_id, dest.display(), bytes);
                    paths.push(dest);
                }
                Err(err) => warn!("[{}] video {} skipped: {}", request.task_id, i + 1, err),
            }
        }

        let mut session = self.session.lock().await;
        if paths.is_empty() {
            session.set_state(BrowserState::DownloadFailed);
            return Err(GenerationError::download(format!(
                "{}: none of {} videos could be fetched",
                handle.id(),
                artifacts.len()
            )));
        }
        session.set_state(BrowserState::Downloaded);
        Ok(paths)
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        retry: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> GenResult<Vec<PathBuf>> {
        let _job = self.job_lock.lock().await;
        run_job(self, request, retry, cancel).await
    }

    async fn shutdown(&self) -> GenResult<()> {
        self.close_session().await
    }
}
