use crate::downloader::error::DownloadError;
use crate::downloader::task::{DownloadState, ViewState};

pub struct FormatTool;

impl FormatTool {
    // 格式化时长
    pub fn format_duration(duration: u32) -> String {
        if duration == 0 {
            return "--:--".to_string();
        }
        let hours = duration / 3600;
        let mins = (duration % 3600) / 60;
        let secs = duration % 60;

        if hours != 0 {
            format!("{:02}:{:02}:{:02}", hours, mins, secs)
        } else {
            format!("{:02}:{:02}", mins, secs)
        }
    }

    // 格式化文件大小
    pub fn format_size(size: f64) -> String {
        if size <= 0.0 {
            "0 MB".to_string()
        } else if size > 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} GB", size / 1024.0 / 1024.0 / 1024.0)
        } else if size > 1024.0 * 1024.0 {
            format!("{:.1} MB", size / 1024.0 / 1024.0)
        } else {
            format!("{:.1} KB", size / 1024.0)
        }
    }

    // 格式化进度，未知进度返回 None
    pub fn progress_text(state: &DownloadState) -> Option<String> {
        match state {
            DownloadState::Running { progress, .. } if *progress >= 0.0 => {
                Some(format!("{:.1} %", progress * 100.0))
            }
            DownloadState::Canceled {
                progress: Some(progress),
                ..
            } => Some(format!("{:.1} %", progress * 100.0)),
            DownloadState::Completed { .. } => Some("100.0 %".to_string()),
            _ => None,
        }
    }

    /// 视频卡片上的副标题：作者、时长、预估大小
    pub fn video_summary(view: &ViewState) -> String {
        let mut parts = Vec::new();
        if !view.uploader.is_empty() {
            parts.push(view.uploader.clone());
        }
        parts.push(Self::format_duration(view.duration));
        if view.file_size_approx > 0.0 {
            parts.push(Self::format_size(view.file_size_approx));
        }
        parts.join(" · ")
    }

    /// 复制给用户反馈用的错误报告
    pub fn error_report(error: &DownloadError, url: &str) -> String {
        format!(
            "版本: {}\nURL: {}\n错误信息:\n```\n{}\n```",
            env!("CARGO_PKG_VERSION"),
            url,
            error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::{Job, RestartableAction};

    #[test]
    fn test_format_duration() {
        assert_eq!(FormatTool::format_duration(0), "--:--");
        assert_eq!(FormatTool::format_duration(65), "01:05");
        assert_eq!(FormatTool::format_duration(3725), "01:02:05");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(FormatTool::format_size(0.0), "0 MB");
        assert_eq!(FormatTool::format_size(2048.0), "2.0 KB");
        assert_eq!(FormatTool::format_size(5.0 * 1024.0 * 1024.0), "5.0 MB");
        assert_eq!(
            FormatTool::format_size(1.5 * 1024.0 * 1024.0 * 1024.0),
            "1.50 GB"
        );
    }

    #[test]
    fn test_video_summary() {
        let view = ViewState {
            uploader: "Uploader".to_string(),
            duration: 65,
            file_size_approx: 1.5 * 1024.0 * 1024.0,
            ..Default::default()
        };
        assert_eq!(FormatTool::video_summary(&view), "Uploader · 01:05 · 1.5 MB");

        let unknown = ViewState::default();
        assert_eq!(FormatTool::video_summary(&unknown), "--:--");
    }

    #[test]
    fn test_progress_text() {
        let running = |progress: f32| DownloadState::Running {
            job: Job::new(),
            task_id: "id".to_string(),
            progress,
            progress_text: String::new(),
        };
        assert_eq!(
            FormatTool::progress_text(&running(0.42)).as_deref(),
            Some("42.0 %")
        );
        assert_eq!(FormatTool::progress_text(&running(-1.0)), None);
        assert_eq!(
            FormatTool::progress_text(&DownloadState::Canceled {
                action: RestartableAction::Download,
                progress: Some(0.5),
            })
            .as_deref(),
            Some("50.0 %")
        );
        assert_eq!(FormatTool::progress_text(&DownloadState::Idle), None);
    }

    #[test]
    fn test_error_report() {
        let report = FormatTool::error_report(
            &DownloadError::Engine("ERROR: Unsupported URL".to_string()),
            "https://example.com",
        );
        assert!(report.contains("URL: https://example.com"));
        assert!(report.contains("ERROR: Unsupported URL"));
    }
}
