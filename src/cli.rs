use clap::Parser;
use std::path::PathBuf;

use vdownloader::downloader::preferences::DownloadPreferences;

/// 视频下载器
#[derive(Parser, Debug)]
#[command(name = "vdl")]
#[command(version)]
#[command(about = "基于 yt-dlp 的视频下载工具", long_about = None)]
pub struct Cli {
    /// 视频或播放列表链接
    #[arg(value_name = "URL")]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub url: String,

    /// 视频保存目录
    #[arg(long, short = 'o', value_name = "DIR")]
    #[arg(default_value = "./downloads")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// 格式选择 (yt-dlp 的 -f 语法，如 137+140)
    #[arg(long, short = 'f', value_name = "FORMAT")]
    pub format: Option<String>,

    /// 只下载音频
    #[arg(long, short = 'x')]
    pub audio_only: bool,

    /// 音频格式 (配合 --audio-only)
    #[arg(long, value_name = "EXT")]
    pub audio_format: Option<String>,

    /// 下载并嵌入字幕
    #[arg(long)]
    pub subtitles: bool,

    /// 字幕语言
    #[arg(long, value_name = "LANGS", default_value = "en.*,.*-orig")]
    pub sub_langs: String,

    /// 播放列表条目 (可选，仅用于播放列表)
    #[arg(long, value_name = "RANGE")]
    #[arg(help = "指定要下载的条目，如: 1-3,5,7-9")]
    pub playlist_items: Option<String>,

    /// 同时下载的任务数
    #[arg(long, short = 'j', value_name = "N", default_value_t = 3)]
    pub concurrency: usize,

    /// cookies.txt 路径
    #[arg(long, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub cookies: Option<PathBuf>,

    /// 代理地址
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    /// 限速 (如 2M)
    #[arg(long, value_name = "RATE")]
    pub rate_limit: Option<String>,

    /// yt-dlp 可执行文件
    #[arg(long, value_name = "PATH", default_value = "yt-dlp")]
    pub ytdlp: PathBuf,

    /// 下载结束后导出备份 JSON
    #[arg(long, value_name = "FILE")]
    pub backup: Option<PathBuf>,

    /// 输出调试日志
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl Cli {
    /// 由命令行参数生成默认下载配置
    pub fn preferences(&self) -> DownloadPreferences {
        let defaults = DownloadPreferences::default();
        DownloadPreferences {
            output_dir: self.output_dir.to_string_lossy().to_string(),
            extract_audio: self.audio_only,
            audio_format: self.audio_format.clone(),
            format_id_string: self.format.clone().unwrap_or_default(),
            download_subtitle: self.subtitles,
            embed_subtitle: self.subtitles,
            subtitle_language: self.sub_langs.clone(),
            proxy: self.proxy.clone(),
            cookies_file: self
                .cookies
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            rate_limit: self.rate_limit.clone(),
            ..defaults
        }
    }
}

// 解析条目范围字符串，返回需要下载的序号列表
// 例如: "1-3,5,7-9" => [1,2,3,5,7,8,9]
pub fn parse_item_range(range_str: &str) -> Result<Vec<usize>, String> {
    let mut items = Vec::new();

    for part in range_str.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .trim()
                .parse()
                .map_err(|_| format!("无效的起始序号: {}", part))?;
            let end: usize = end
                .trim()
                .parse()
                .map_err(|_| format!("无效的结束序号: {}", part))?;
            if start == 0 || start > end {
                return Err(format!("无效的范围: {}", part));
            }
            items.extend(start..=end);
        } else {
            let item: usize = part.parse().map_err(|_| format!("无效的序号: {}", part))?;
            if item == 0 {
                return Err("序号从 1 开始".to_string());
            }
            items.push(item);
        }
    }

    if items.is_empty() {
        return Err("没有有效的序号".to_string());
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_item_range() {
        assert_eq!(
            parse_item_range("1-3,5,7-9").unwrap(),
            vec![1, 2, 3, 5, 7, 8, 9]
        );
        assert_eq!(parse_item_range(" 4 , 2").unwrap(), vec![4, 2]);
        assert!(parse_item_range("3-1").is_err());
        assert!(parse_item_range("0").is_err());
        assert!(parse_item_range("a").is_err());
        assert!(parse_item_range("").is_err());
    }

    #[test]
    fn test_preferences_from_args() {
        let cli = Cli::parse_from([
            "vdl",
            "https://example.com/v",
            "-x",
            "--audio-format",
            "mp3",
            "--proxy",
            "socks5://127.0.0.1:1080",
        ]);
        let prefs = cli.preferences();
        assert!(prefs.extract_audio);
        assert_eq!(prefs.audio_format.as_deref(), Some("mp3"));
        assert_eq!(prefs.output_dir, "./downloads");
        assert_eq!(prefs.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert!(prefs.embed_metadata);
    }
}
