//! Bounded fan-out of generation jobs.

use crate::backend::{GenerationBackend, GenerationRequest};
use crate::error::GenResult;
use crate::events::{EventSink, TaskCompletion};
use crate::retry::RetryPolicy;
use crate::task::{TaskRegistry, TaskStatus};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Cooperative cancellation shared by the executor and the backends.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Percent range the batch reports progress in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressBand {
    pub start: u8,
    pub end: u8,
}

impl ProgressBand {
    pub fn full() -> Self {
        Self { start: 0, end: 100 }
    }

    fn at(&self, finished: usize, total: usize) -> u8 {
        if total == 0 {
            return self.end;
        }
        let span = self.end.saturating_sub(self.start) as usize;
        self.start + (span * finished.min(total) / total) as u8
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub succeeded: Vec<(String, Vec<PathBuf>)>,
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn videos(&self) -> Vec<PathBuf> {
        self.succeeded
            .iter()
            .flat_map(|(_, paths)| paths.iter().cloned())
            .collect()
    }
}

#[derive(Default)]
struct Tally {
    finished: usize,
    completed: usize,
    report: BatchReport,
}

/// Everything a worker needs, cloned into each spawned job.
#[derive(Clone)]
struct Shared {
    backend: Arc<dyn GenerationBackend>,
    retry: RetryPolicy,
    registry: TaskRegistry,
    events: EventSink,
    cancel: CancelFlag,
    tally: Arc<Mutex<Tally>>,
    total: usize,
    band: ProgressBand,
}

impl Shared {
    /// Counter, registry and events move together under one lock.
    fn finish(&self, request: &GenerationRequest, result: GenResult<Vec<PathBuf>>) {
        let mut tally = self.tally.lock().unwrap_or_else(|e| e.into_inner());
        tally.finished += 1;
        let id = request.task_id.clone();

        let outcome = match result {
            Ok(paths) if !paths.is_empty() => Ok(paths),
            Ok(_) => Err("no video produced".to_string()),
            Err(err) => Err(err.to_string()),
        };

        match outcome {
            Ok(mut paths) => {
                paths.truncate(request.output_count);
                let stored = self
                    .registry
                    .update(&id, |t| t.complete(paths.clone(), request.output_count));
                if let Ok(Err(err)) | Err(err) = stored {
                    warn!("task {} not updated: {}", id, err);
                }
                tally.completed += 1;
                self.events.logok(format!(
                    "Scene {}: {} video(s) ready ({}/{})",
                    request.scene,
                    paths.len(),
                    tally.completed,
                    self.total
                ));
                self.events.task_finished(TaskCompletion {
                    task_id: id.clone(),
                    success: true,
                    output_paths: Some(paths.clone()),
                    error: None,
                });
                tally.report.succeeded.push((id, paths));
            }
            Err(reason) => {
                let stored = self.registry.update(&id, |t| t.fail(reason.clone()));
                if let Ok(Err(err)) | Err(err) = stored {
                    warn!("task {} not updated: {}", id, err);
                }
                self.events.loge(format!("Scene {}: {}", request.scene, reason));
                self.events.task_finished(TaskCompletion {
                    task_id: id.clone(),
                    success: false,
                    output_paths: None,
                    error: Some(reason.clone()),
                });
                tally.report.failed.push((id, reason));
            }
        }

        let percent = self.band.at(tally.finished, self.total);
        self.events.progress(
            format!("{}/{} videos finished", tally.finished, self.total),
            percent,
        );
    }
}

pub struct BatchExecutor {
    backend: Arc<dyn GenerationBackend>,
    retry: RetryPolicy,
    threads: usize,
    registry: TaskRegistry,
    events: EventSink,
    cancel: CancelFlag,
}

impl BatchExecutor {
    pub fn new(backend: Arc<dyn GenerationBackend>, registry: TaskRegistry, events: EventSink) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
            threads: 1,
            registry,
            events,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Runs every request and returns once all of them are terminal.
    ///
    /// Each request's `task_id` must name a task in the registry.
    pub async fn run(&self, jobs: Vec<GenerationRequest>, band: ProgressBand) -> BatchReport {
        let shared = Shared {
            backend: self.backend.clone(),
            retry: self.retry,
            registry: self.registry.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            tally: Arc::new(Mutex::new(Tally::default())),
            total: jobs.len(),
            band,
        };
        let ids: Vec<String> = jobs.iter().map(|j| j.task_id.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.threads));
        let mut workers = JoinSet::new();

        self.events.logi(format!(
            "Generating {} videos with {} worker(s)",
            jobs.len(),
            self.threads
        ));

        for request in jobs {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    shared.finish(&request, Err(crate::error::GenerationError::Cancelled));
                    continue;
                }
            };
            if shared.cancel.is_cancelled() {
                drop(permit);
                shared.finish(&request, Err(crate::error::GenerationError::Cancelled));
                continue;
            }

            let _ = shared
                .registry
                .update(&request.task_id, |t| t.advance(TaskStatus::Generating));
            let worker = shared.clone();
            workers.spawn(async move {
                let result = worker
                    .backend
                    .generate(&request, &worker.retry, &worker.cancel)
                    .await;
                worker.finish(&request, result);
                drop(permit);
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!("generation worker crashed: {}", err);
            }
        }

        // A crashed worker never reached `finish`.
        for id in &ids {
            let stuck = shared
                .registry
                .get(id)
                .is_some_and(|t| !t.status().is_terminal());
            if stuck {
                let _ = shared.registry.update(id, |t| t.fail("worker aborted"));
                let mut tally = shared.tally.lock().unwrap_or_else(|e| e.into_inner());
                tally.finished += 1;
                tally.report.failed.push((id.clone(), "worker aborted".to_string()));
            }
        }

        let tally = shared.tally.lock().unwrap_or_else(|e| e.into_inner());
        tally.report.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::request;
    use crate::backend::{Artifact, OperationHandle, PollPlan, PollStatus, TimeoutPolicy};
    use crate::brief::BackendKind;
    use crate::error::GenerationError;
    use crate::events::PipelineEvent;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Fails odd scenes on request, tracks how many jobs overlap.
    struct CountingBackend {
        registry: TaskRegistry,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        max_generating: AtomicUsize,
        fail_scenes: Vec<usize>,
        cancel_on_first: Option<CancelFlag>,
        panic_scene: Option<usize>,
    }

    impl CountingBackend {
        fn new(registry: TaskRegistry) -> Self {
            Self {
                registry,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                max_generating: AtomicUsize::new(0),
                fail_scenes: Vec::new(),
                cancel_on_first: None,
                panic_scene: None,
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::PollingApi
        }

        fn poll_plan(&self) -> PollPlan {
            PollPlan {
                interval: Duration::from_secs(1),
                max_attempts: 1,
                on_timeout: TimeoutPolicy::Fail,
            }
        }

        async fn submit(&self, _request: &GenerationRequest) -> GenResult<OperationHandle> {
            unreachable!("generate is overridden")
        }

        async fn poll(&self, _handle: &OperationHandle) -> GenResult<PollStatus> {
            unreachable!("generate is overridden")
        }

        async fn collect(&self, _handle: &OperationHandle) -> GenResult<Vec<Artifact>> {
            Ok(Vec::new())
        }

        async fn download(
            &self,
            _handle: OperationHandle,
            _artifacts: Vec<Artifact>,
            _request: &GenerationRequest,
        ) -> GenResult<Vec<PathBuf>> {
            unreachable!("generate is overridden")
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
            _retry: &RetryPolicy,
            _cancel: &CancelFlag,
        ) -> GenResult<Vec<PathBuf>> {
            if let Some(flag) = &self.cancel_on_first {
                flag.cancel();
            }
            if self.panic_scene == Some(request.scene) {
                panic!("driver crashed");
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.max_generating
                .fetch_max(self.registry.count_in(TaskStatus::Generating), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5 + request.scene as u64)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_scenes.contains(&request.scene) {
                return Err(GenerationError::backend("quota exceeded"));
            }
            Ok(vec![request.output_path.clone()])
        }
    }

    fn jobs(registry: &TaskRegistry, n: usize) -> Vec<GenerationRequest> {
        (1..=n)
            .map(|scene| {
                let id = registry.create(scene, format!("prompt {}", scene), vec![]);
                let mut req = request(scene, std::path::Path::new("out"));
                req.task_id = id;
                req
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_n_generating() {
        let registry = TaskRegistry::new();
        let backend = Arc::new(CountingBackend::new(registry.clone()));
        let batch = jobs(&registry, 7);

        let report = BatchExecutor::new(backend.clone(), registry.clone(), EventSink::discard())
            .with_threads(3)
            .run(batch, ProgressBand::full())
            .await;

        assert_eq!(report.succeeded.len(), 7);
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 3);
        assert!(backend.max_generating.load(Ordering::SeqCst) <= 3);
        assert_eq!(registry.count_in(TaskStatus::Completed), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_per_task_and_progress_reaches_band_end() {
        let registry = TaskRegistry::new();
        let mut backend = CountingBackend::new(registry.clone());
        backend.fail_scenes = vec![2];
        let (events, rx) = EventSink::channel();
        let batch = jobs(&registry, 3);
        let failed_id = batch[1].task_id.clone();

        let report = BatchExecutor::new(Arc::new(backend), registry.clone(), events)
            .with_threads(2)
            .run(batch, ProgressBand { start: 40, end: 100 })
            .await;

        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed, vec![(failed_id.clone(), "Backend error: quota exceeded".to_string())]);
        assert_eq!(registry.get(&failed_id).unwrap().error(), Some("Backend error: quota exceeded"));

        let events: Vec<PipelineEvent> = rx.try_iter().collect();
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![60, 80, 100]);
        let finished = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::TaskFinished(c) if !c.success))
            .count();
        assert_eq!(finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_new_work_and_drains_results() {
        let registry = TaskRegistry::new();
        let cancel = CancelFlag::new();
        let mut backend = CountingBackend::new(registry.clone());
        backend.cancel_on_first = Some(cancel.clone());
        let batch = jobs(&registry, 4);

        let report = BatchExecutor::new(Arc::new(backend), registry.clone(), EventSink::discard())
            .with_threads(1)
            .with_cancel(cancel)
            .run(batch, ProgressBand::full())
            .await;

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 3);
        assert!(report.failed.iter().all(|(_, reason)| reason == "cancelled"));
        assert!(registry.snapshot().iter().all(|t| t.status().is_terminal()));
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_worker_leaves_no_task_pending() {
        let registry = TaskRegistry::new();
        let mut backend = CountingBackend::new(registry.clone());
        backend.panic_scene = Some(2);
        let batch = jobs(&registry, 3);
        let crashed = batch[1].task_id.clone();

        let report = BatchExecutor::new(Arc::new(backend), registry.clone(), EventSink::discard())
            .with_threads(3)
            .run(batch, ProgressBand::full())
            .await;

        assert_eq!(report.total(), 3);
        assert_eq!(registry.get(&crashed).unwrap().error(), Some("worker aborted"));
    }

    #[test]
    fn band_interpolates() {
        let band = ProgressBand { start: 40, end: 100 };
        assert_eq!(band.at(0, 4), 40);
        assert_eq!(band.at(2, 4), 70);
        assert_eq!(band.at(4, 4), 100);
        assert_eq!(band.at(0, 0), 100);
    }
}
