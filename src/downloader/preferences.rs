use serde::{Deserialize, Serialize};

use crate::common::models::VideoClip;

/// 一次下载的配置快照，任务创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadPreferences {
    pub output_dir: String,
    pub output_template: String,
    pub extract_audio: bool,
    pub audio_format: Option<String>,
    pub video_format: Option<String>,
    pub format_id_string: String,
    pub video_clips: Vec<VideoClip>,
    pub split_by_chapter: bool,
    pub new_title: String,
    pub merge_audio_stream: bool,
    pub merge_to_mkv: bool,
    pub download_subtitle: bool,
    pub auto_subtitle: bool,
    pub embed_subtitle: bool,
    pub subtitle_language: String,
    pub embed_metadata: bool,
    pub embed_thumbnail: bool,
    pub restrict_filenames: bool,
    pub concurrent_fragments: u32,
    pub rate_limit: Option<String>,
    pub proxy: Option<String>,
    pub cookies_file: Option<String>,
}

impl Default for DownloadPreferences {
    fn default() -> Self {
        Self {
            output_dir: "./downloads".to_string(),
            output_template: "%(title).200B [%(id)s].%(ext)s".to_string(),
            extract_audio: false,
            audio_format: None,
            video_format: None,
            format_id_string: String::new(),
            video_clips: Vec::new(),
            split_by_chapter: false,
            new_title: String::new(),
            merge_audio_stream: false,
            merge_to_mkv: false,
            download_subtitle: false,
            auto_subtitle: false,
            embed_subtitle: false,
            subtitle_language: "en.*,.*-orig".to_string(),
            embed_metadata: true,
            embed_thumbnail: false,
            restrict_filenames: false,
            concurrent_fragments: 1,
            rate_limit: None,
            proxy: None,
            cookies_file: None,
        }
    }
}

impl DownloadPreferences {
    /// 解析元数据时需要的参数（网络相关）
    pub fn network_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(cookies) = &self.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.clone());
        }
        args
    }

    /// 转换为 yt-dlp 下载参数（不包含 URL）
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.network_args();

        // 格式选择: 用户手动选择的 format id 优先
        if !self.format_id_string.is_empty() {
            args.push("-f".to_string());
            args.push(self.format_id_string.clone());
        } else if let Some(format) = &self.video_format {
            args.push("-f".to_string());
            args.push(format.clone());
        }

        if self.merge_audio_stream {
            args.push("--audio-multistreams".to_string());
        }
        if self.merge_to_mkv {
            args.push("--merge-output-format".to_string());
            args.push("mkv".to_string());
        }

        if self.extract_audio {
            args.push("-x".to_string());
            if let Some(audio_format) = &self.audio_format {
                args.push("--audio-format".to_string());
                args.push(audio_format.clone());
            }
        }

        for clip in &self.video_clips {
            args.push("--download-sections".to_string());
            args.push(clip.to_section());
        }
        if self.split_by_chapter {
            args.push("--split-chapters".to_string());
        }

        if self.download_subtitle {
            args.push("--write-subs".to_string());
            if self.auto_subtitle {
                args.push("--write-auto-subs".to_string());
            }
            if !self.subtitle_language.is_empty() {
                args.push("--sub-langs".to_string());
                args.push(self.subtitle_language.clone());
            }
            if self.embed_subtitle {
                args.push("--embed-subs".to_string());
            }
        }

        if self.embed_metadata {
            args.push("--embed-metadata".to_string());
        }
        if self.embed_thumbnail {
            args.push("--embed-thumbnail".to_string());
        }
        if self.restrict_filenames {
            args.push("--restrict-filenames".to_string());
        }
        if self.concurrent_fragments > 1 {
            args.push("--concurrent-fragments".to_string());
            args.push(self.concurrent_fragments.to_string());
        }
        if let Some(rate) = &self.rate_limit {
            args.push("--limit-rate".to_string());
            args.push(rate.clone());
        }

        // 输出路径，自定义标题替换模板中的 title 字段
        let template = if self.new_title.is_empty() {
            self.output_template.clone()
        } else {
            self.output_template
                .replace("%(title).200B", &self.new_title)
                .replace("%(title)s", &self.new_title)
        };
        args.push("-P".to_string());
        args.push(self.output_dir.clone());
        args.push("-o".to_string());
        args.push(template);

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_default_args_use_output_template() {
        let args = DownloadPreferences::default().to_args();
        assert!(has_pair(&args, "-P", "./downloads"));
        assert!(has_pair(&args, "-o", "%(title).200B [%(id)s].%(ext)s"));
        assert!(!args.contains(&"-f".to_string()));
        assert!(!args.contains(&"--write-subs".to_string()));
    }

    #[test]
    fn test_selection_args() {
        let preferences = DownloadPreferences {
            format_id_string: "251+140".to_string(),
            merge_audio_stream: true,
            extract_audio: true,
            video_clips: vec![VideoClip::new(10, 20)],
            download_subtitle: true,
            auto_subtitle: true,
            subtitle_language: "en,ja".to_string(),
            new_title: "My Title".to_string(),
            ..Default::default()
        };

        let args = preferences.to_args();
        assert!(has_pair(&args, "-f", "251+140"));
        assert!(args.contains(&"--audio-multistreams".to_string()));
        assert!(args.contains(&"-x".to_string()));
        assert!(has_pair(&args, "--download-sections", "*10-20"));
        assert!(args.contains(&"--write-auto-subs".to_string()));
        assert!(has_pair(&args, "--sub-langs", "en,ja"));
        assert!(has_pair(&args, "-o", "My Title [%(id)s].%(ext)s"));
    }
}
