use crate::task::Task;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(deserialize_with = "number_or_string")]
    pub stt: u64,
    pub prompt: String,
    #[serde(default = "full_progress")]
    pub progress: String,
    #[serde(default)]
    pub video_path: String,
    #[serde(default)]
    pub video_name: String,
    #[serde(default)]
    pub created_at: String,
}

fn full_progress() -> String {
    "100%".to_string()
}

// Older history files wrote the ordinal as a string.
fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl HistoryRecord {
    /// One record per produced file; `stt` is assigned by the store.
    pub fn from_task(task: &Task) -> Vec<Self> {
        task.output_paths()
            .iter()
            .map(|path| Self {
                stt: 0,
                prompt: task.prompt.clone(),
                progress: full_progress(),
                video_path: path.display().to_string(),
                video_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                created_at: task.created_at.format(TIME_FORMAT).to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Vec<HistoryRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read history: {}", self.path.display()));
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse history: {}", self.path.display()))
    }

    /// Appends records, numbering them after the existing entries.
    pub async fn append(&self, records: Vec<HistoryRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut all = self.load().await?;
        let added = records.len();
        let mut next = all.iter().map(|r| r.stt).max().unwrap_or(0);
        for mut record in records {
            next += 1;
            record.stt = next;
            all.push(record);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&all)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write history: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).await?;
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(prompt: &str) -> HistoryRecord {
        HistoryRecord {
            stt: 0,
            prompt: prompt.into(),
            progress: full_progress(),
            video_path: format!("output/{}.mp4", prompt),
            video_name: format!("{}.mp4", prompt),
            created_at: "2025-06-01 10:00:00".into(),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("none.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_numbers_after_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history/video_history.json"));
        store.append(vec![record("a")]).await.unwrap();
        store.append(vec![record("b"), record("c")]).await.unwrap();

        let all = store.load().await.unwrap();
        let numbers: Vec<u64> = all.iter().map(|r| r.stt).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(all[2].prompt, "c");
    }

    #[test]
    fn string_ordinals_are_accepted() {
        let json = r#"{"stt":"7","prompt":"p"}"#;
        let rec: HistoryRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.stt, 7);
        assert_eq!(rec.progress, "100%");
    }

    #[test]
    fn completed_task_becomes_records() {
        let mut task = Task::new(1, "launch", vec![]);
        task.complete(vec!["out/video_01.mp4".into()], 1).unwrap();
        let records = HistoryRecord::from_task(&task);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].video_name, "video_01.mp4");
        assert_eq!(records[0].created_at.len(), 19);
    }
}
