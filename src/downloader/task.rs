use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::error::DownloadError;
use super::preferences::DownloadPreferences;
use crate::common::models::{Format, VideoInfo};

pub type TaskId = String;

/// 进度未知时使用的哨兵值
pub const PROGRESS_INDETERMINATE: f32 = -1.0;

// --------------------------------------------------------------------

/// 用户保存的自定义命令模板
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub id: u32,
    pub name: String,
    pub template: String,
}

/// 任务类型：单个链接、播放列表中的某一项，或自定义命令
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeInfo {
    Url,
    Playlist(usize), // 从 1 开始的播放列表序号
    CustomCommand(CommandTemplate),
}

/// 一个下载单元的身份。相同字段的两个 Task 相等且 id 相同
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub url: String,
    pub preferences: DownloadPreferences,
    pub type_info: TypeInfo,
    pub id: TaskId,
}

impl Task {
    pub fn new(url: impl Into<String>, preferences: DownloadPreferences) -> Self {
        Self::with_type(url, preferences, TypeInfo::Url)
    }

    pub fn with_type(
        url: impl Into<String>,
        preferences: DownloadPreferences,
        type_info: TypeInfo,
    ) -> Self {
        let url = url.into();
        let id = derive_task_id(&url, &type_info, &preferences);
        Self {
            url,
            preferences,
            type_info,
            id,
        }
    }

    pub fn playlist_index(&self) -> Option<usize> {
        match self.type_info {
            TypeInfo::Playlist(index) => Some(index),
            _ => None,
        }
    }

    /// 新任务的默认重试方式
    pub fn default_action(&self) -> RestartableAction {
        match &self.type_info {
            TypeInfo::CustomCommand(template) => RestartableAction::CustomCommand(template.clone()),
            _ => RestartableAction::Download,
        }
    }
}

// url + 类型 + 配置 的稳定哈希
fn derive_task_id(url: &str, type_info: &TypeInfo, preferences: &DownloadPreferences) -> TaskId {
    let payload = serde_json::to_vec(&(url, type_info, preferences)).unwrap_or_default();
    let digest = Sha256::digest(&payload);
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

// --------------------------------------------------------------------

/// 取消或失败后，重试时应该执行的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartableAction {
    Download,
    CustomCommand(CommandTemplate),
}

static NEXT_JOB_GENERATION: AtomicU64 = AtomicU64::new(1);

/// 正在执行的工作单元，持有取消令牌
#[derive(Debug, Clone)]
pub struct Job {
    generation: u64,
    token: CancellationToken,
}

impl Job {
    pub fn new() -> Self {
        Self {
            generation: NEXT_JOB_GENERATION.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

/// 任务生命周期状态，每次转换整体替换
#[derive(Debug, Clone)]
pub enum DownloadState {
    Idle,
    FetchingInfo {
        job: Job,
        task_id: TaskId,
    },
    ReadyWithInfo,
    Running {
        job: Job,
        task_id: TaskId,
        progress: f32,
        progress_text: String,
    },
    Completed {
        file_path: Option<String>,
    },
    Canceled {
        action: RestartableAction,
        progress: Option<f32>,
    },
    Error {
        error: Arc<DownloadError>,
        action: RestartableAction,
    },
}

impl DownloadState {
    pub fn name(&self) -> &'static str {
        match self {
            DownloadState::Idle => "Idle",
            DownloadState::FetchingInfo { .. } => "FetchingInfo",
            DownloadState::ReadyWithInfo => "ReadyWithInfo",
            DownloadState::Running { .. } => "Running",
            DownloadState::Completed { .. } => "Completed",
            DownloadState::Canceled { .. } => "Canceled",
            DownloadState::Error { .. } => "Error",
        }
    }

    pub fn job(&self) -> Option<&Job> {
        match self {
            DownloadState::FetchingInfo { job, .. } | DownloadState::Running { job, .. } => Some(job),
            _ => None,
        }
    }

    /// 可以被取消的状态
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            DownloadState::Idle
                | DownloadState::FetchingInfo { .. }
                | DownloadState::ReadyWithInfo
                | DownloadState::Running { .. }
        )
    }

    /// 可以重试的状态，返回保存的动作
    pub fn restartable_action(&self) -> Option<&RestartableAction> {
        match self {
            DownloadState::Canceled { action, .. } | DownloadState::Error { action, .. } => {
                Some(action)
            }
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DownloadState::Completed { .. })
    }

    /// Running 中的进度，负数表示未知
    pub fn progress(&self) -> Option<f32> {
        match self {
            DownloadState::Running { progress, .. } => Some(*progress),
            DownloadState::Canceled { progress, .. } => *progress,
            DownloadState::Completed { .. } => Some(1.0),
            _ => None,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        match self {
            DownloadState::Running { progress, .. } => *progress < 0.0,
            DownloadState::Idle | DownloadState::FetchingInfo { .. } | DownloadState::ReadyWithInfo => {
                true
            }
            _ => false,
        }
    }

    pub fn error(&self) -> Option<&Arc<DownloadError>> {
        match self {
            DownloadState::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}

// --------------------------------------------------------------------

/// 界面展示用的投影，和完整元数据分开保存
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewState {
    pub url: String,
    pub title: String,
    pub uploader: String,
    pub extractor_key: String,
    pub duration: u32,
    pub file_size_approx: f64,
    pub thumbnail_url: String,
    pub video_formats: Vec<Format>,
    pub audio_only_formats: Vec<Format>,
}

impl ViewState {
    pub fn from_video_info(info: &VideoInfo) -> Self {
        Self {
            url: info.source_url(),
            title: info.title.clone(),
            uploader: info
                .uploader
                .clone()
                .or_else(|| info.channel.clone())
                .or_else(|| info.uploader_id.clone())
                .unwrap_or_default(),
            extractor_key: info.extractor_key.clone().unwrap_or_default(),
            duration: info.duration.map(|d| d.round() as u32).unwrap_or(0),
            file_size_approx: info.file_size.or(info.file_size_approx).unwrap_or(0.0),
            thumbnail_url: info
                .thumbnail
                .clone()
                .or_else(|| info.thumbnails.last().map(|t| t.url.clone()))
                .unwrap_or_default(),
            video_formats: Vec::new(),
            audio_only_formats: Vec::new(),
        }
    }

    /// 用新解析的元数据刷新，保留用户覆盖的标题和已选格式
    pub fn refresh_with(&self, info: &VideoInfo, title_override: &str) -> Self {
        let mut refreshed = Self::from_video_info(info);
        if !title_override.is_empty() {
            refreshed.title = title_override.to_string();
        }
        refreshed.video_formats = self.video_formats.clone();
        refreshed.audio_only_formats = self.audio_only_formats.clone();
        refreshed
    }
}

/// 注册表中每个任务对应的当前值
#[derive(Debug, Clone)]
pub struct State {
    pub download_state: DownloadState,
    pub video_info: Option<VideoInfo>,
    pub view_state: ViewState,
}

impl State {
    pub fn idle(view_state: ViewState) -> Self {
        Self {
            download_state: DownloadState::Idle,
            video_info: None,
            view_state,
        }
    }

    pub fn with_download_state(&self, download_state: DownloadState) -> Self {
        Self {
            download_state,
            ..self.clone()
        }
    }
}

// --------------------------------------------------------------------

/// 任务列表的筛选条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFilter {
    All,
    Downloading,
    Canceled,
    Finished,
    CanceledAndDownloading,
}

impl TaskFilter {
    pub fn matches(&self, state: &DownloadState) -> bool {
        let downloading = matches!(
            state,
            DownloadState::Idle
                | DownloadState::FetchingInfo { .. }
                | DownloadState::ReadyWithInfo
                | DownloadState::Running { .. }
        );
        let canceled = matches!(
            state,
            DownloadState::Error { .. } | DownloadState::Canceled { .. }
        );
        match self {
            TaskFilter::All => true,
            TaskFilter::Downloading => downloading,
            TaskFilter::Canceled => canceled,
            TaskFilter::Finished => state.is_completed(),
            TaskFilter::CanceledAndDownloading => downloading || canceled,
        }
    }
}
