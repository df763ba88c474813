//! Per-scene task records and the registry UI listeners read from.

use crate::history::HistoryRecord;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Analyzing,
    ScriptGenerating,
    PromptConverting,
    Generating,
    Completed,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Analyzing => 1,
            TaskStatus::ScriptGenerating => 2,
            TaskStatus::PromptConverting => 3,
            TaskStatus::Generating => 4,
            TaskStatus::Completed | TaskStatus::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    /// 1-based output slot.
    pub scene: usize,
    pub prompt: String,
    pub reference_images: Vec<PathBuf>,
    status: TaskStatus,
    progress: u8,
    output_paths: Vec<PathBuf>,
    error: Option<String>,
    pub created_at: DateTime<Local>,
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl Task {
    pub fn new(scene: usize, prompt: impl Into<String>, reference_images: Vec<PathBuf>) -> Self {
        Self {
            id: short_id(),
            scene,
            prompt: prompt.into(),
            reference_images,
            status: TaskStatus::Pending,
            progress: 0,
            output_paths: Vec::new(),
            error: None,
            created_at: Local::now(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn output_paths(&self) -> &[PathBuf] {
        &self.output_paths
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn transition_error(&self, to: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// Moves to a later non-terminal status. Staying put is allowed.
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if self.status.is_terminal() || next.is_terminal() || next.rank() < self.status.rank() {
            return Err(self.transition_error(next));
        }
        self.status = next;
        Ok(())
    }

    /// Progress never moves backwards within a run.
    pub fn set_progress(&mut self, percent: u8) {
        self.progress = self.progress.max(percent.min(100));
    }

    pub fn complete(&mut self, mut paths: Vec<PathBuf>, max_outputs: usize) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(TaskStatus::Completed));
        }
        paths.truncate(max_outputs);
        self.output_paths = paths;
        self.error = None;
        self.status = TaskStatus::Completed;
        self.progress = 100;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(TaskStatus::Failed));
        }
        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            "unknown error".to_string()
        } else {
            reason
        };
        self.error = Some(reason);
        self.output_paths.clear();
        self.status = TaskStatus::Failed;
        Ok(())
    }

    /// The only way out of a terminal state.
    pub fn reset_for_retry(&mut self) -> Result<(), TaskError> {
        if !self.status.is_terminal() {
            return Err(self.transition_error(TaskStatus::Pending));
        }
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.output_paths.clear();
        self.error = None;
        Ok(())
    }
}

/// Shared, lock-protected task list.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<Vec<Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, task: Task) -> String {
        let id = task.id.clone();
        self.lock().push(task);
        id
    }

    pub fn create(
        &self,
        scene: usize,
        prompt: impl Into<String>,
        reference_images: Vec<PathBuf>,
    ) -> String {
        self.insert(Task::new(scene, prompt, reference_images))
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs `f` against one task while holding the registry lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Result<R, TaskError> {
        let mut tasks = self.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        Ok(f(task))
    }

    pub fn count_in(&self, status: TaskStatus) -> usize {
        self.lock().iter().filter(|t| t.status == status).count()
    }

    /// Rebuilds completed entries from persisted history. Referenced files
    /// are not checked.
    pub fn from_history(records: &[HistoryRecord]) -> Self {
        let registry = Self::new();
        for (i, record) in records.iter().enumerate() {
            let mut task = Task::new(record.stt.max(1) as usize, record.prompt.clone(), Vec::new());
            if let Some(created) = parse_history_time(&record.created_at) {
                task.created_at = created;
            }
            let paths = if record.video_path.is_empty() {
                Vec::new()
            } else {
                vec![PathBuf::from(&record.video_path)]
            };
            if task.complete(paths, usize::MAX).is_err() {
                tracing::debug!("history entry {} could not be restored", i);
                continue;
            }
            registry.insert(task);
        }
        registry
    }
}

fn parse_history_time(value: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(value, crate::history::TIME_FORMAT).ok()?;
    Local.from_local_datetime(&naive).single()
}
