use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::core::TaskEvent;
use super::task::{DownloadState, TaskId};
use crate::common::utils::FormatTool;

const BAR_LENGTH: u64 = 1000;

/// 终端进度面板，每个任务一行，由注册表事件驱动
pub struct DownloadProgress {
    multi_pb: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
    style: ProgressStyle,
    spinner: ProgressStyle,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self::with_target(MultiProgress::new())
    }

    /// 不输出到终端，测试使用
    pub fn hidden() -> Self {
        Self::with_target(MultiProgress::with_draw_target(
            indicatif::ProgressDrawTarget::hidden(),
        ))
    }

    fn with_target(multi_pb: MultiProgress) -> Self {
        let style = ProgressStyle::default_bar()
            .template("{msg:40!} [{elapsed_precise}] {wide_bar} {prefix}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        let spinner = ProgressStyle::default_spinner()
            .template("{spinner} {msg:40!} {prefix}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        Self {
            multi_pb,
            bars: HashMap::new(),
            style,
            spinner,
        }
    }

    pub fn apply(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Updated { task, state } => {
                let pb = self
                    .bars
                    .entry(task.id.clone())
                    .or_insert_with(|| self.multi_pb.add(ProgressBar::new(BAR_LENGTH)));
                pb.set_message(state.view_state.title.clone());

                let download_state = &state.download_state;
                // 引擎输出的原始进度行优先，比百分比多出速度和剩余时间
                let engine_line = match download_state {
                    DownloadState::Running { progress_text, .. }
                        if !progress_text.trim().is_empty() =>
                    {
                        Some(progress_text.trim().to_string())
                    }
                    _ => None,
                };
                if download_state.is_indeterminate() {
                    pb.set_style(self.spinner.clone());
                    pb.set_prefix(
                        engine_line.unwrap_or_else(|| download_state.name().to_string()),
                    );
                    pb.tick();
                } else {
                    pb.set_style(self.style.clone());
                    let progress = download_state.progress().unwrap_or(0.0).clamp(0.0, 1.0);
                    pb.set_position((progress as f64 * BAR_LENGTH as f64) as u64);
                    pb.set_prefix(
                        engine_line
                            .or_else(|| FormatTool::progress_text(download_state))
                            .unwrap_or_else(|| download_state.name().to_string()),
                    );
                }

                match download_state {
                    DownloadState::Completed { .. } => pb.finish(),
                    DownloadState::Canceled { .. } | DownloadState::Error { .. } => {
                        pb.abandon()
                    }
                    _ => {}
                }
            }
            TaskEvent::Removed { task } => {
                if let Some(pb) = self.bars.remove(&task.id) {
                    pb.finish_and_clear();
                    self.multi_pb.remove(&pb);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn position(&self, task_id: &str) -> Option<u64> {
        self.bars.get(task_id).map(ProgressBar::position)
    }

    pub fn prefix(&self, task_id: &str) -> Option<String> {
        self.bars.get(task_id).map(ProgressBar::prefix)
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
