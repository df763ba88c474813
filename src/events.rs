//! Typed progress stream shared between the pipeline and its listeners.
//!
//! Events are sent from whichever worker produced them; the receiving end is
//! a plain crossbeam channel so a UI thread can block on it or drain it from
//! its own loop.

use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskCompletion {
    pub task_id: String,
    pub success: bool,
    pub output_paths: Option<Vec<PathBuf>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Log { message: String, level: LogLevel },
    Stage { name: String, result: serde_json::Value },
    Progress { message: String, percent: u8 },
    TaskFinished(TaskCompletion),
}

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only traces.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        self.emit(PipelineEvent::Log { message, level });
    }

    pub fn logi(&self, message: impl AsRef<str>) {
        info!("{}", message.as_ref());
        self.log(LogLevel::Info, message.as_ref().to_string());
    }

    pub fn logok(&self, message: impl AsRef<str>) {
        info!("[OK] {}", message.as_ref());
        self.log(LogLevel::Success, message.as_ref().to_string());
    }

    pub fn logw(&self, message: impl AsRef<str>) {
        warn!("{}", message.as_ref());
        self.log(LogLevel::Warning, message.as_ref().to_string());
    }

    pub fn loge(&self, message: impl AsRef<str>) {
        error!("{}", message.as_ref());
        self.log(LogLevel::Error, message.as_ref().to_string());
    }

    pub fn stage(&self, name: &str, result: serde_json::Value) {
        self.emit(PipelineEvent::Stage {
            name: name.to_string(),
            result,
        });
    }

    pub fn progress(&self, message: impl Into<String>, percent: u8) {
        let message = message.into();
        info!("[{:>3}%] {}", percent.min(100), message);
        self.emit(PipelineEvent::Progress {
            message,
            percent: percent.min(100),
        });
    }

    pub fn task_finished(&self, completion: TaskCompletion) {
        self.emit(PipelineEvent::TaskFinished(completion));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_receiver_in_order() {
        let (sink, rx) = EventSink::channel();
        sink.logi("starting");
        sink.progress("half way", 50);
        sink.logok("done");

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[1],
            PipelineEvent::Progress {
                message: "half way".into(),
                percent: 50
            }
        );
        assert!(matches!(
            &events[2],
            PipelineEvent::Log { level: LogLevel::Success, .. }
        ));
    }

    #[test]
    fn percent_is_clamped() {
        let (sink, rx) = EventSink::channel();
        sink.progress("overflow", 250);
        match rx.recv().unwrap() {
            PipelineEvent::Progress { percent, .. } => assert_eq!(percent, 100),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn dropped_receiver_is_harmless() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.loge("nobody listens");
        EventSink::discard().logw("nothing to send");
    }

    #[test]
    fn completion_serializes_with_tag() {
        let event = PipelineEvent::TaskFinished(TaskCompletion {
            task_id: "ab12cd34".into(),
            success: false,
            output_paths: None,
            error: Some("quota exceeded".into()),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_finished");
        assert_eq!(json["error"], "quota exceeded");
    }
}
