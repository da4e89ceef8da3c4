use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{MediaEngine, ProgressSender, ProgressUpdate};
use super::error::DownloadError;
use super::task::{CommandTemplate, Task, TypeInfo};
use crate::common::models::{PlaylistResult, VideoInfo};

lazy_static! {
    static ref PROGRESS_RE: Regex = Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").unwrap();
}

// stderr 只保留最后几行用于错误信息
const STDERR_TAIL_LINES: usize = 8;

type ProcessMap = DashMap<String, (u64, CancellationToken)>; // task_id -> (序号, 进程结束信号)

/// 调用 yt-dlp 可执行文件的下载引擎
pub struct YtDlpEngine {
    binary: PathBuf,
    processes: ProcessMap,
    next_process: AtomicU64,
}

// 进程登记，离开作用域（包括 future 被丢弃）时注销
struct ProcessEntry<'a> {
    processes: &'a ProcessMap,
    id: String,
    seq: u64,
}

impl Drop for ProcessEntry<'_> {
    fn drop(&mut self) {
        // 同一 id 已被新进程覆盖时不动它
        self.processes
            .remove_if(&self.id, |_, (seq, _)| *seq == self.seq);
    }
}

impl YtDlpEngine {
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            processes: DashMap::new(),
            next_process: AtomicU64::new(1),
        }
    }

    fn register(&self, process_id: &str) -> (ProcessEntry<'_>, CancellationToken) {
        let seq = self.next_process.fetch_add(1, Ordering::Relaxed);
        let kill = CancellationToken::new();
        self.processes
            .insert(process_id.to_string(), (seq, kill.clone()));
        let entry = ProcessEntry {
            processes: &self.processes,
            id: process_id.to_string(),
            seq,
        };
        (entry, kill)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// 运行命令并返回完整的标准输出（用于 -J）
    async fn run_json(
        &self,
        args: Vec<String>,
        token: CancellationToken,
    ) -> Result<Value, DownloadError> {
        debug!("执行: {} {}", self.binary.display(), args.join(" "));
        let mut child = self.command().args(&args).spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Engine("无法读取标准输出".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::Engine("无法读取错误输出".to_string()))?;

        let read_all = async {
            let mut out = Vec::new();
            let mut err = String::new();
            let (out_result, err_result) =
                tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_string(&mut err));
            out_result?;
            err_result?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, out, err) = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Canceled),
            result = read_all => result?,
        };

        if !status.success() {
            return Err(engine_failure(status.code(), &err));
        }
        Ok(serde_json::from_slice(&out)?)
    }

    /// 运行下载类命令，逐行解析进度，返回最终文件路径
    async fn run_with_progress(
        &self,
        process_id: &str,
        args: Vec<String>,
        progress: ProgressSender,
        token: CancellationToken,
    ) -> Result<Option<String>, DownloadError> {
        debug!("执行: {} {}", self.binary.display(), args.join(" "));
        let mut child = self.command().args(&args).spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Engine("无法读取标准输出".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::Engine("无法读取错误输出".to_string()))?;

        let (_entry, kill) = self.register(process_id);

        let stdout_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut file_path = None;
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_output_line(&line) {
                    OutputLine::Progress(fraction) => {
                        let _ = progress.send(ProgressUpdate::new(fraction, line));
                    }
                    OutputLine::FilePath(path) => file_path = Some(path),
                    OutputLine::Other => {
                        let _ = progress.send(ProgressUpdate::new(-1.0, line));
                    }
                }
            }
            file_path
        });
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                tail.push(line);
                if tail.len() > STDERR_TAIL_LINES {
                    tail.remove(0);
                }
            }
            tail.join("\n")
        });

        let status = tokio::select! {
            status = child.wait() => status,
            _ = token.cancelled() => {
                let _ = child.kill().await;
                info!("已结束下载进程: {}", process_id);
                return Err(DownloadError::Canceled);
            }
            _ = kill.cancelled() => {
                let _ = child.kill().await;
                return Err(DownloadError::Canceled);
            }
        };
        let status = status?;

        let file_path = stdout_reader.await.unwrap_or_default();
        let stderr_tail = stderr_reader.await.unwrap_or_default();

        if status.success() {
            Ok(file_path)
        } else {
            Err(engine_failure(status.code(), &stderr_tail))
        }
    }
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    async fn fetch_info(
        &self,
        task: &Task,
        token: CancellationToken,
    ) -> Result<VideoInfo, DownloadError> {
        let mut args = task.preferences.network_args();
        match task.type_info {
            TypeInfo::Playlist(index) => {
                args.push("--yes-playlist".to_string());
                args.push("--playlist-items".to_string());
                args.push(index.to_string());
            }
            _ => args.push("--no-playlist".to_string()),
        }
        args.push("-J".to_string());
        args.push("--".to_string());
        args.push(task.url.clone());

        let value = self.run_json(args, token).await?;
        let mut info = video_info_from_json(value)?;
        if info.original_url.is_none() {
            info.original_url = Some(task.url.clone());
        }
        Ok(info)
    }

    async fn fetch_playlist(
        &self,
        url: &str,
        token: CancellationToken,
    ) -> Result<PlaylistResult, DownloadError> {
        let args = vec![
            "--flat-playlist".to_string(),
            "-J".to_string(),
            "--".to_string(),
            url.to_string(),
        ];
        let value = self.run_json(args, token).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn download(
        &self,
        task: &Task,
        _video_info: Option<&VideoInfo>,
        progress: ProgressSender,
        token: CancellationToken,
    ) -> Result<Option<String>, DownloadError> {
        tokio::fs::create_dir_all(&task.preferences.output_dir).await?;

        let mut args = task.preferences.to_args();
        if let Some(index) = task.playlist_index() {
            args.push("--yes-playlist".to_string());
            args.push("--playlist-items".to_string());
            args.push(index.to_string());
        } else {
            args.push("--no-playlist".to_string());
        }
        args.extend(progress_args());
        args.push("--".to_string());
        args.push(task.url.clone());

        self.run_with_progress(&task.id, args, progress, token).await
    }

    async fn run_command(
        &self,
        task: &Task,
        template: &CommandTemplate,
        progress: ProgressSender,
        token: CancellationToken,
    ) -> Result<Option<String>, DownloadError> {
        let mut args: Vec<String> = template
            .template
            .split_whitespace()
            .map(str::to_string)
            .collect();
        args.extend(progress_args());
        args.push("--".to_string());
        args.push(task.url.clone());

        info!("执行自定义命令 [{}]: {}", template.name, task.url);
        self.run_with_progress(&task.id, args, progress, token).await
    }

    fn destroy_process(&self, process_id: &str) -> bool {
        match self.processes.remove(process_id) {
            Some((_, (_, kill))) => {
                kill.cancel();
                true
            }
            None => {
                warn!("没有找到进程: {}", process_id);
                false
            }
        }
    }
}

// --------------------------------------------------------------------

// --print 会隐含 --quiet，需要 --progress 才能保留进度行
fn progress_args() -> Vec<String> {
    vec![
        "--progress".to_string(),
        "--newline".to_string(),
        "--no-simulate".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
    ]
}

#[derive(Debug, PartialEq)]
enum OutputLine {
    Progress(f32),
    FilePath(String),
    Other,
}

// yt-dlp 的进度行以 [xxx] 开头，--print 输出的路径不带前缀
fn parse_output_line(line: &str) -> OutputLine {
    if let Some(caps) = PROGRESS_RE.captures(line) {
        if let Ok(percent) = caps[1].parse::<f32>() {
            return OutputLine::Progress((percent / 100.0).clamp(0.0, 1.0));
        }
    }
    let trimmed = line.trim();
    if !trimmed.is_empty() && !trimmed.starts_with('[') {
        return OutputLine::FilePath(trimmed.to_string());
    }
    OutputLine::Other
}

// -J 对播放列表条目返回 playlist 对象，取第一个条目
fn video_info_from_json(value: Value) -> Result<VideoInfo, DownloadError> {
    if value.get("_type").and_then(Value::as_str) == Some("playlist") {
        let entry = value
            .get("entries")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .cloned()
            .ok_or_else(|| DownloadError::Engine("播放列表中没有可下载的条目".to_string()))?;
        return Ok(serde_json::from_value(entry)?);
    }
    Ok(serde_json::from_value(value)?)
}

fn engine_failure(code: Option<i32>, stderr: &str) -> DownloadError {
    let message = stderr
        .lines()
        .rev()
        .find(|line| line.contains("ERROR"))
        .unwrap_or(stderr)
        .trim()
        .to_string();
    if message.is_empty() {
        DownloadError::ProcessExited(code.unwrap_or(-1))
    } else {
        DownloadError::Engine(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_output_line() {
        assert_eq!(
            parse_output_line("[download]  42.5% of 10.00MiB at 1.00MiB/s ETA 00:05"),
            OutputLine::Progress(0.425)
        );
        assert_eq!(
            parse_output_line("[download] 100% of 10.00MiB"),
            OutputLine::Progress(1.0)
        );
        assert_eq!(
            parse_output_line("/storage/emulated/0/Download/video.mp4"),
            OutputLine::FilePath("/storage/emulated/0/Download/video.mp4".to_string())
        );
        assert_eq!(
            parse_output_line("[Merger] Merging formats into \"video.mp4\""),
            OutputLine::Other
        );
        assert_eq!(parse_output_line("   "), OutputLine::Other);
    }

    #[test]
    fn test_video_info_from_playlist_json() {
        let value = json!({
            "_type": "playlist",
            "title": "Mix",
            "entries": [{"id": "a", "title": "First"}]
        });
        let info = video_info_from_json(value).unwrap();
        assert_eq!(info.title, "First");

        let empty = json!({"_type": "playlist", "entries": []});
        assert!(matches!(
            video_info_from_json(empty),
            Err(DownloadError::Engine(_))
        ));
    }

    #[test]
    fn test_engine_failure_message() {
        let err = engine_failure(Some(1), "WARNING: x\nERROR: Unsupported URL: foo\n");
        assert!(matches!(err, DownloadError::Engine(msg) if msg == "ERROR: Unsupported URL: foo"));
        assert!(matches!(
            engine_failure(Some(2), ""),
            DownloadError::ProcessExited(2)
        ));
    }

    #[test]
    fn test_destroy_unknown_process() {
        let engine = YtDlpEngine::new("yt-dlp");
        assert!(!engine.destroy_process("missing"));
    }

    #[test]
    fn test_progress_args_keep_progress_lines() {
        let args = progress_args();
        assert!(args.iter().any(|a| a == "--progress"));
        assert!(args.iter().any(|a| a == "--newline"));
        assert!(args.windows(2).any(|w| w[0] == "--print" && w[1] == "after_move:filepath"));
    }

    #[test]
    fn test_process_entry_unregisters_on_drop() {
        let engine = YtDlpEngine::new("yt-dlp");

        let (entry, kill) = engine.register("task");
        assert!(engine.processes.contains_key("task"));
        drop(entry);
        assert!(!kill.is_cancelled());
        assert!(!engine.destroy_process("task"));

        // 旧登记被丢弃时不能删掉同一 id 的新进程
        let (old, _) = engine.register("task");
        let (new, new_kill) = engine.register("task");
        drop(old);
        assert_eq!(engine.processes.get("task").map(|e| e.0), Some(new.seq));
        assert!(engine.destroy_process("task"));
        assert!(new_kill.is_cancelled());
        drop(new);
        assert!(engine.processes.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_download_releases_process() {
        use std::os::unix::fs::PermissionsExt;

        use crate::downloader::preferences::DownloadPreferences;

        let dir = std::env::temp_dir().join(format!("vdl-ytdlp-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("fake-yt-dlp");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = YtDlpEngine::new(&script);
        let task = Task::new(
            "https://example.com/v",
            DownloadPreferences {
                output_dir: dir.join("out").to_string_lossy().to_string(),
                ..Default::default()
            },
        );
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        // 外层取消时 future 直接被丢弃
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(300),
            engine.download(&task, None, tx, CancellationToken::new()),
        )
        .await;
        assert!(result.is_err());

        assert!(engine.processes.is_empty());
        assert!(!engine.destroy_process(&task.id));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
