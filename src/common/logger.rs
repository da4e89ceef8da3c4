use colored::*;

use super::utils::FormatTool;
use crate::downloader::task::{DownloadState, State};

/// 终端输出工具
pub struct PrettyLogger;

impl PrettyLogger {
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    pub fn error(message: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), message.as_ref());
    }

    pub fn step_start(step: impl AsRef<str>) {
        println!("\n{} {}", "▶".cyan().bold(), step.as_ref().bold());
    }

    /// 显示解析到的视频信息
    pub fn video_info(state: &State) {
        let view = &state.view_state;
        println!(
            "{} {} ({})",
            "🎬".magenta().bold(),
            view.title.bold(),
            FormatTool::video_summary(view).cyan()
        );
    }

    /// 任务结束后的单行状态
    pub fn task_result(state: &State) {
        let title = &state.view_state.title;
        match &state.download_state {
            DownloadState::Completed { file_path } => {
                let path = file_path.as_deref().unwrap_or("-");
                println!("  {} {} {} {}", "✓".green(), title, "→".bright_black(), path);
            }
            DownloadState::Canceled { .. } => {
                println!("  {} {} {}", "⏹".yellow(), title, "已取消".yellow());
            }
            DownloadState::Error { error, .. } => {
                println!("  {} {} {}", "✗".red(), title, error.to_string().red());
            }
            other => println!("  {} {} {}", "…".bright_black(), title, other.name()),
        }
    }

    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    /// 显示完成总结
    pub fn completion_summary(completed: usize, canceled: usize, failed: usize) {
        let head = if failed == 0 && canceled == 0 {
            "🎉 下载完成！".green().bold()
        } else {
            "下载结束".yellow().bold()
        };
        println!(
            "\n{} 成功 {}，取消 {}，失败 {}",
            head,
            completed.to_string().green(),
            canceled.to_string().yellow(),
            failed.to_string().red()
        );
    }
}

#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::success(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::warning(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::error(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_step {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::step_start(format!($($arg)*))
    };
}
