use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use vdownloader::common::logger::PrettyLogger;
use vdownloader::common::utils::FormatTool;
use vdownloader::downloader::{
    Backup, DownloadCore, DownloadPreferences, DownloadProgress, DownloadState,
    DownloaderConfig, MemoryHistory, Task, TaskEvent, TaskFactory, TaskStateView, YtDlpEngine,
};
use vdownloader::{log_error, log_info, log_step, log_success, log_warning};

mod cli;

/// 把播放列表中选中的条目加入注册表
async fn enqueue_playlist(
    core: &DownloadCore,
    url: &str,
    range: &str,
    preferences: &DownloadPreferences,
) -> Result<usize> {
    log_step!("解析播放列表...");
    let playlist = core
        .fetch_playlist(url)
        .await
        .with_context(|| format!("播放列表解析失败: {}", url))?;
    let count = playlist.entries.as_ref().map_or(0, Vec::len);
    info!(
        "播放列表: << {} >>，共 {} 个条目",
        playlist.title.as_deref().unwrap_or("-"),
        count
    );

    let indexes = cli::parse_item_range(range).map_err(|e| anyhow!(e))?;
    let (valid, skipped): (Vec<usize>, Vec<usize>) =
        indexes.into_iter().partition(|index| *index <= count);
    if !skipped.is_empty() {
        log_warning!("超出播放列表范围的序号已忽略: {:?}", skipped);
    }
    if valid.is_empty() {
        return Err(anyhow!("没有可下载的播放列表条目"));
    }

    let tasks = TaskFactory::create_with_playlist_result(url, &valid, &playlist, preferences);
    let total = tasks.len();
    for item in tasks {
        core.enqueue_with_state(item.task, item.state);
    }
    Ok(total)
}

/// 消费注册表事件，直到没有进行中的任务
async fn wait_until_settled(
    core: &DownloadCore,
    events: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
    view: &mut TaskStateView,
) {
    let mut board = DownloadProgress::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        if !view.is_empty() && view.is_settled() {
            break;
        }
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                let canceled = core.cancel_all();
                warn!("收到中断信号，已取消 {} 个任务", canceled);
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let TaskEvent::Updated { state, .. } = &event {
                        if matches!(state.download_state, DownloadState::ReadyWithInfo) {
                            PrettyLogger::video_info(state);
                        }
                    }
                    board.apply(&event);
                    view.apply(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    // 落后太多时用注册表快照重建
                    debug!("事件积压，跳过 {} 条", skipped);
                    *view = TaskStateView::new();
                    for (task, state) in core.get_task_state_map() {
                        let event = TaskEvent::Updated { task, state };
                        board.apply(&event);
                        view.apply(&event);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // 初始化日志
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let preferences = args.preferences();
    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .with_context(|| format!("无法创建输出目录: {:?}", args.output_dir))?;

    let engine = Arc::new(YtDlpEngine::new(&args.ytdlp));
    let history = Arc::new(MemoryHistory::new());
    let config = DownloaderConfig {
        max_concurrent: args.concurrency.max(1),
        ..Default::default()
    };
    let core = DownloadCore::new(engine, config).with_history(history.clone());

    // 先订阅再提交，保证不丢事件
    let mut events = core.subscribe();
    let mut view = TaskStateView::new();

    match &args.playlist_items {
        Some(range) => {
            let total = enqueue_playlist(&core, &args.url, range, &preferences).await?;
            log_info!("已添加 {} 个播放列表任务", total);
        }
        None => {
            log_step!("开始解析: {}", args.url);
            core.enqueue(Task::new(args.url.clone(), preferences));
        }
    }

    wait_until_settled(&core, &mut events, &mut view).await;

    // 汇总
    PrettyLogger::separator();
    let mut completed = 0;
    let mut canceled = 0;
    let mut failed = 0;
    for (task, state) in core.get_task_state_map() {
        PrettyLogger::task_result(&state);
        match &state.download_state {
            DownloadState::Completed { .. } => completed += 1,
            DownloadState::Canceled { .. } => canceled += 1,
            DownloadState::Error { error, .. } => {
                failed += 1;
                error!("{}", FormatTool::error_report(error, &task.url));
            }
            _ => {}
        }
    }
    PrettyLogger::completion_summary(completed, canceled, failed);

    if let Some(path) = &args.backup {
        let backup = Backup {
            download_history: Some(history.records()),
            ..Default::default()
        };
        tokio::fs::write(path, backup.to_json()?)
            .await
            .with_context(|| format!("无法写入备份: {:?}", path))?;
        log_success!("备份已导出: {}", path.display());
    }

    if failed > 0 {
        log_error!("{} 个任务失败", failed);
        std::process::exit(1);
    }
    info!("{}", "全部完成".green());
    Ok(())
}
