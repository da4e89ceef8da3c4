use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::DownloadError;
use super::task::{CommandTemplate, State, Task};

/// 下载完成后交给历史记录层的数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub video_title: String,
    pub video_author: String,
    pub video_url: String,
    pub thumbnail_url: String,
    pub video_path: String,
    pub extractor: String,
    pub download_time: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn from_completed(task: &Task, state: &State, file_path: &str) -> Self {
        let view = &state.view_state;
        Self {
            id: task.id.clone(),
            video_title: view.title.clone(),
            video_author: view.uploader.clone(),
            video_url: if view.url.is_empty() {
                task.url.clone()
            } else {
                view.url.clone()
            },
            thumbnail_url: view.thumbnail_url.clone(),
            video_path: file_path.to_string(),
            extractor: view.extractor_key.clone(),
            download_time: Utc::now(),
        }
    }
}

/// 持久化层的接口，具体存储方式由调用方决定
pub trait HistorySink: Send + Sync {
    fn record(&self, record: HistoryRecord);
}

/// 内存中的历史记录，用于导出备份
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, id: &str) -> bool {
        match self.records.lock() {
            Ok(mut records) => {
                let before = records.len();
                records.retain(|r| r.id != id);
                records.len() != before
            }
            Err(_) => false,
        }
    }
}

impl HistorySink for MemoryHistory {
    fn record(&self, record: HistoryRecord) {
        debug!("写入历史记录: {} -> {}", record.video_title, record.video_path);
        if let Ok(mut records) = self.records.lock() {
            // 同一任务重新下载时覆盖旧记录
            records.retain(|r| r.id != record.id);
            records.push(record);
        }
    }
}

// --------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionShortcut {
    pub id: u32,
    pub option: String,
}

/// 导入导出用的备份，不是运行时实体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates: Option<Vec<CommandTemplate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcuts: Option<Vec<OptionShortcut>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_history: Option<Vec<HistoryRecord>>,
}

impl Backup {
    pub fn to_json(&self) -> Result<String, DownloadError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, DownloadError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::preferences::DownloadPreferences;
    use crate::downloader::task::ViewState;

    fn completed_record(title: &str) -> HistoryRecord {
        let task = Task::new("https://example.com/v", DownloadPreferences::default());
        let state = State::idle(ViewState {
            title: title.to_string(),
            uploader: "Uploader".to_string(),
            extractor_key: "Youtube".to_string(),
            ..Default::default()
        });
        HistoryRecord::from_completed(&task, &state, "/storage/video.mp4")
    }

    #[test]
    fn test_record_from_completed_task() {
        let record = completed_record("Title");
        assert_eq!(record.video_url, "https://example.com/v");
        assert_eq!(record.video_path, "/storage/video.mp4");
        assert_eq!(record.extractor, "Youtube");
    }

    #[test]
    fn test_memory_history_replaces_same_task() {
        let history = MemoryHistory::new();
        history.record(completed_record("First"));
        history.record(completed_record("Second"));

        let records = history.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].video_title, "Second");
        assert!(history.remove(&records[0].id));
        assert!(history.records().is_empty());
    }

    #[test]
    fn test_backup_json() {
        let backup = Backup {
            templates: Some(vec![CommandTemplate {
                id: 1,
                name: "audio".to_string(),
                template: "-x --audio-format mp3".to_string(),
            }]),
            download_history: Some(vec![completed_record("Title")]),
            ..Default::default()
        };

        let json = backup.to_json().unwrap();
        assert!(json.contains("downloadHistory"));
        assert!(!json.contains("shortcuts"));

        let restored = Backup::from_json(&json).unwrap();
        assert_eq!(restored, backup);
        assert!(Backup::from_json("{}").unwrap().templates.is_none());
    }
}
