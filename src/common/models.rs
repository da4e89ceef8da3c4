use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------------------------

/// 单个可选的音视频流格式（对应 yt-dlp 的 formats 条目）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Format {
    pub format_id: String,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default, rename = "filesize")]
    pub file_size: Option<f64>,
    #[serde(default, rename = "filesize_approx")]
    pub file_size_approx: Option<f64>,
}

impl Format {
    pub fn contains_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(codec) if codec != "none")
    }

    pub fn contains_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(codec) if codec != "none")
    }

    pub fn is_audio_only(&self) -> bool {
        self.contains_audio() && !self.contains_video()
    }

    pub fn is_video_only(&self) -> bool {
        self.contains_video() && !self.contains_audio()
    }

    /// 已知大小，优先使用精确值
    pub fn size_or_approx(&self) -> f64 {
        self.file_size.or(self.file_size_approx).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubtitleFormat {
    pub ext: String,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// 视频片段（秒），用于 --download-sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoClip {
    pub start: u32,
    pub end: u32,
}

impl VideoClip {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn to_section(&self) -> String {
        format!("*{}-{}", self.start, self.end)
    }
}

// -----------------------------------------------------------------------------------------------

/// 解析完成的单个视频元数据
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub original_url: Option<String>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub uploader_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(default)]
    pub extractor_key: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub formats: Vec<Format>,
    #[serde(default, rename = "filesize")]
    pub file_size: Option<f64>,
    #[serde(default, rename = "filesize_approx")]
    pub file_size_approx: Option<f64>,
    #[serde(default)]
    pub subtitles: HashMap<String, Vec<SubtitleFormat>>,
    #[serde(default)]
    pub automatic_captions: HashMap<String, Vec<SubtitleFormat>>,
}

impl VideoInfo {
    /// 用户提交的地址，缺失时退回 webpage_url
    pub fn source_url(&self) -> String {
        self.original_url
            .clone()
            .or_else(|| self.webpage_url.clone())
            .unwrap_or_default()
    }
}

// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaylistEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub thumbnails: Option<Vec<Thumbnail>>,
}

/// 播放列表查询结果，entries 为空表示尚未解析
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaylistResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub playlist_count: Option<usize>,
    #[serde(default)]
    pub entries: Option<Vec<PlaylistEntry>>,
}
