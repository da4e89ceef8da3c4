use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::DownloadError;
use super::task::{CommandTemplate, Task};
use crate::common::models::{PlaylistResult, VideoInfo};

/// 下载引擎上报的一次进度，fraction 为负表示未知
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub fraction: f32,
    pub line: String,
}

impl ProgressUpdate {
    pub fn new(fraction: f32, line: impl Into<String>) -> Self {
        Self {
            fraction,
            line: line.into(),
        }
    }
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

/// 外部的解析/下载引擎
///
/// 所有耗时操作都应在 `token` 被取消时尽快返回 `DownloadError::Canceled`
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// 解析单个任务的元数据（播放列表条目按序号解析）
    async fn fetch_info(
        &self,
        task: &Task,
        token: CancellationToken,
    ) -> Result<VideoInfo, DownloadError>;

    /// 解析播放列表（不展开条目的完整元数据）
    async fn fetch_playlist(
        &self,
        url: &str,
        token: CancellationToken,
    ) -> Result<PlaylistResult, DownloadError>;

    /// 按任务配置下载，成功时返回最终文件路径
    async fn download(
        &self,
        task: &Task,
        video_info: Option<&VideoInfo>,
        progress: ProgressSender,
        token: CancellationToken,
    ) -> Result<Option<String>, DownloadError>;

    /// 执行用户的自定义命令模板
    async fn run_command(
        &self,
        task: &Task,
        template: &CommandTemplate,
        progress: ProgressSender,
        token: CancellationToken,
    ) -> Result<Option<String>, DownloadError>;

    /// 按任务 id 强制结束底层进程，返回是否找到进程
    fn destroy_process(&self, process_id: &str) -> bool;
}
