//! Runs one brief end to end: analysis, script, prompts, then the batch.

use crate::api::LanguageModel;
use crate::backend::{GenerationBackend, GenerationRequest};
use crate::brief::Brief;
use crate::error::{GenResult, GenerationError};
use crate::events::EventSink;
use crate::executor::{BatchExecutor, CancelFlag, ProgressBand};
use crate::retry::RetryPolicy;
use crate::stages::{
    self, STAGE_IMAGE_ANALYSIS, STAGE_PROMPT_CONVERSION, STAGE_SCRIPT_GENERATION,
    STAGE_VIDEO_GENERATION, Script,
};
use crate::task::{TaskRegistry, TaskStatus};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const ANALYSIS_START: u8 = 0;
const SCRIPT_START: u8 = 20;
const PROMPTS_START: u8 = 30;
const GENERATION_START: u8 = 40;

#[derive(Debug, Clone, Serialize)]
pub struct BriefReport {
    /// At least one video was produced.
    pub success: bool,
    pub message: String,
    pub task_ids: Vec<String>,
    pub videos: Vec<PathBuf>,
    pub script: Option<Script>,
}

pub struct WorkflowOrchestrator {
    llm: Arc<dyn LanguageModel>,
    backend: Arc<dyn GenerationBackend>,
    registry: TaskRegistry,
    events: EventSink,
    retry: RetryPolicy,
    cancel: CancelFlag,
    default_threads: usize,
}

impl WorkflowOrchestrator {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        backend: Arc<dyn GenerationBackend>,
        registry: TaskRegistry,
        events: EventSink,
    ) -> Self {
        Self {
            llm,
            backend,
            registry,
            events,
            retry: RetryPolicy::default(),
            cancel: CancelFlag::new(),
            default_threads: 1,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_default_threads(mut self, threads: usize) -> Self {
        self.default_threads = threads.max(1);
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    fn enter_stage(&self, ids: &[String], status: TaskStatus, percent: u8, message: &str) {
        for id in ids {
            let _ = self.registry.update(id, |t| {
                if t.advance(status).is_ok() {
                    t.set_progress(percent);
                }
            });
        }
        self.events.progress(message, percent);
    }

    fn abort(&self, ids: Vec<String>, err: GenerationError) -> BriefReport {
        let reason = err.to_string();
        for id in &ids {
            if let Ok(Err(e)) = self.registry.update(id, |t| t.fail(reason.clone())) {
                warn!("task {} not failed: {}", id, e);
            }
        }
        self.events.loge(&reason);
        self.events.progress(format!("Stopped: {}", reason), 100);
        BriefReport {
            success: false,
            message: reason,
            task_ids: ids,
            videos: Vec::new(),
            script: None,
        }
    }

    /// Input problems are returned as errors before any task exists. Once
    /// tasks are created every outcome is a report, and every task ends
    /// terminal.
    pub async fn run(&self, brief: &Brief) -> GenResult<BriefReport> {
        brief.validate()?;
        let (Some(character), Some(product)) = (brief.character_image(), brief.product_image())
        else {
            return Err(GenerationError::input("character and product images are required"));
        };

        let ids: Vec<String> = (1..=brief.scene_count)
            .map(|scene| {
                self.registry
                    .create(scene, brief.prompt.clone(), brief.reference_images.clone())
            })
            .collect();
        self.events
            .logi(format!("Brief accepted: {} scenes", brief.scene_count));

        self.enter_stage(&ids, TaskStatus::Analyzing, ANALYSIS_START, "Analyzing reference images");
        let llm = self.llm.as_ref();
        let analysis = match stages::analyze_images(llm, character, product).await {
            Ok(analysis) => analysis,
            Err(err) => return Ok(self.abort(ids, err)),
        };
        self.events
            .stage(STAGE_IMAGE_ANALYSIS, json!({"character": analysis.character, "product": analysis.product}));
        if self.cancel.is_cancelled() {
            return Ok(self.abort(ids, GenerationError::Cancelled));
        }

        self.enter_stage(&ids, TaskStatus::ScriptGenerating, SCRIPT_START, "Writing the script");
        let script = match stages::generate_script(
            llm,
            &self.retry,
            &self.events,
            &analysis,
            &brief.prompt,
            brief.scene_count,
            brief.scene_duration_sec,
        )
        .await
        {
            Ok(script) => script,
            Err(err) => return Ok(self.abort(ids, err)),
        };
        self.events.stage(
            STAGE_SCRIPT_GENERATION,
            serde_json::to_value(&script).unwrap_or_default(),
        );
        if self.cancel.is_cancelled() {
            return Ok(self.abort(ids, GenerationError::Cancelled));
        }

        self.enter_stage(&ids, TaskStatus::PromptConverting, PROMPTS_START, "Converting scenes to prompts");
        let prompts = match stages::convert_prompts(llm, &self.retry, &script, &analysis).await {
            Ok(prompts) => prompts,
            Err(err) => return Ok(self.abort(ids, err)),
        };
        self.events.stage(STAGE_PROMPT_CONVERSION, json!(prompts));
        if self.cancel.is_cancelled() {
            return Ok(self.abort(ids, GenerationError::Cancelled));
        }

        if let Err(err) = tokio::fs::create_dir_all(&brief.output_dir).await {
            let err = GenerationError::pipeline(
                "video generation",
                format!("cannot create {}: {}", brief.output_dir.display(), err),
            );
            return Ok(self.abort(ids, err));
        }

        let requests: Vec<GenerationRequest> = ids
            .iter()
            .zip(prompts)
            .enumerate()
            .map(|(i, (id, prompt))| {
                let scene = i + 1;
                let _ = self.registry.update(id, |t| t.prompt = prompt.clone());
                GenerationRequest {
                    task_id: id.clone(),
                    scene,
                    prompt,
                    reference_images: brief.reference_images.clone(),
                    duration_sec: brief.scene_duration_sec,
                    resolution: brief.resolution.clone(),
                    aspect_ratio: brief.aspect_ratio,
                    output_count: brief.output_count,
                    output_path: brief.output_dir.join(format!("video_{:02}.mp4", scene)),
                    extended_duration_sec: brief
                        .is_extended
                        .then_some(brief.extended_duration_sec)
                        .flatten(),
                }
            })
            .collect();

        for id in &ids {
            let _ = self.registry.update(id, |t| t.set_progress(GENERATION_START));
        }
        self.events.progress("Generating videos", GENERATION_START);

        let threads = brief.threads.unwrap_or(self.default_threads);
        let report = BatchExecutor::new(self.backend.clone(), self.registry.clone(), self.events.clone())
            .with_retry(self.retry)
            .with_threads(threads)
            .with_cancel(self.cancel.clone())
            .run(requests, ProgressBand { start: GENERATION_START, end: 100 })
            .await;

        let videos = report.videos();
        self.events.stage(
            STAGE_VIDEO_GENERATION,
            json!({
                "succeeded": report.succeeded.len(),
                "failed": report.failed,
                "videos": videos,
            }),
        );

        let total = ids.len();
        let done = report.succeeded.len();
        let message = if done == total {
            format!("Done: all {} videos generated", total)
        } else if done > 0 {
            format!("Done: {}/{} videos generated", done, total)
        } else {
            "No video produced".to_string()
        };
        if done > 0 {
            self.events.logok(&message);
        } else {
            self.events.loge(&message);
        }
        self.events.progress(message.clone(), 100);

        Ok(BriefReport {
            success: done > 0,
            message,
            task_ids: ids,
            videos,
            script: Some(script),
        })
    }
}
