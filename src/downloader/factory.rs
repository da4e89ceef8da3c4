use itertools::Itertools;
use tracing::debug;

use super::preferences::DownloadPreferences;
use super::task::{DownloadState, State, Task, TypeInfo, ViewState};
use crate::common::models::{Format, PlaylistResult, VideoClip, VideoInfo};

/// 任务和它的初始状态
#[derive(Debug, Clone)]
pub struct TaskWithState {
    pub task: Task,
    pub state: State,
}

/// 用户在格式选择页面做出的选择
#[derive(Debug, Clone, Default)]
pub struct FormatSelection {
    pub formats: Vec<Format>,
    pub video_clips: Vec<VideoClip>,
    pub split_by_chapter: bool,
    pub new_title: String,
    pub selected_subtitles: Vec<String>,
    pub selected_auto_captions: Vec<String>,
}

/// 纯函数式的任务构造，不做任何 IO
#[derive(Debug, Clone, Default)]
pub struct TaskFactory {
    defaults: DownloadPreferences,
}

impl TaskFactory {
    pub fn new(defaults: DownloadPreferences) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &DownloadPreferences {
        &self.defaults
    }

    /// 根据用户的格式选择构造任务，初始状态为 ReadyWithInfo
    pub fn create_with_configurations(
        &self,
        video_info: &VideoInfo,
        selection: FormatSelection,
    ) -> TaskWithState {
        let FormatSelection {
            formats,
            video_clips,
            split_by_chapter,
            new_title,
            selected_subtitles,
            selected_auto_captions,
        } = selection;

        let mut info = video_info.clone();

        // 已选格式没有报告大小时保留原有估算
        let file_size: f64 = formats.iter().map(Format::size_or_approx).sum();
        if file_size != 0.0 {
            info.file_size = Some(file_size);
        }
        if !new_title.is_empty() {
            info.title = new_title.clone();
        }

        let (audio_only_formats, video_formats): (Vec<Format>, Vec<Format>) = (
            formats.iter().filter(|f| f.is_audio_only()).cloned().collect(),
            formats.iter().filter(|f| f.contains_video()).cloned().collect(),
        );
        let audio_only = !audio_only_formats.is_empty() && video_formats.is_empty();
        let merge_audio_stream = audio_only_formats.len() > 1;
        let format_id = formats.iter().map(|f| f.format_id.as_str()).join("+");

        let subtitle_language = selected_subtitles
            .iter()
            .chain(selected_auto_captions.iter())
            .join(",");

        let mut preferences = DownloadPreferences {
            format_id_string: format_id,
            video_clips,
            split_by_chapter,
            new_title,
            merge_audio_stream,
            extract_audio: self.defaults.extract_audio || audio_only,
            ..self.defaults.clone()
        };
        if !subtitle_language.is_empty() {
            preferences.download_subtitle = true;
            preferences.auto_subtitle = !selected_auto_captions.is_empty();
            preferences.subtitle_language = subtitle_language;
        }

        debug!(
            "构造任务: format={}, audio_only={}, merge_audio={}",
            preferences.format_id_string, audio_only, merge_audio_stream
        );

        let task = Task::new(info.source_url(), preferences);
        let view_state = ViewState {
            video_formats,
            audio_only_formats,
            ..ViewState::from_video_info(&info)
        };
        let state = State {
            download_state: DownloadState::ReadyWithInfo,
            video_info: Some(info),
            view_state,
        };

        TaskWithState { task, state }
    }

    /// 根据播放列表结果批量构造任务，index 从 1 开始
    ///
    /// entries 为空说明调用方在元数据解析完成前就调用了本函数，直接 panic
    pub fn create_with_playlist_result(
        playlist_url: &str,
        index_list: &[usize],
        playlist_result: &PlaylistResult,
        preferences: &DownloadPreferences,
    ) -> Vec<TaskWithState> {
        let entries = playlist_result
            .entries
            .as_ref()
            .expect("播放列表条目尚未解析");
        let playlist_title = playlist_result.title.as_deref().unwrap_or_default();

        index_list
            .iter()
            .copied()
            .unique()
            .map(|index| {
                let entry = index
                    .checked_sub(1)
                    .and_then(|i| entries.get(i))
                    .unwrap_or_else(|| {
                        panic!("播放列表序号越界: {} (共 {} 项)", index, entries.len())
                    });

                let view_state = ViewState {
                    url: entry.url.clone().unwrap_or_default(),
                    title: entry
                        .title
                        .clone()
                        .unwrap_or_else(|| format!("{} - {}", playlist_title, index)),
                    duration: entry.duration.map(|d| d.round() as u32).unwrap_or(0),
                    uploader: entry
                        .uploader
                        .clone()
                        .or_else(|| entry.channel.clone())
                        .or_else(|| playlist_result.channel.clone())
                        .unwrap_or_default(),
                    thumbnail_url: entry
                        .thumbnails
                        .as_ref()
                        .and_then(|thumbnails| thumbnails.last())
                        .map(|t| t.url.clone())
                        .unwrap_or_default(),
                    ..Default::default()
                };

                let task = Task::with_type(
                    playlist_url,
                    preferences.clone(),
                    TypeInfo::Playlist(index),
                );
                TaskWithState {
                    task,
                    state: State::idle(view_state),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::{PlaylistEntry, Thumbnail};

    fn audio(id: &str, size: Option<f64>, approx: Option<f64>) -> Format {
        Format {
            format_id: id.to_string(),
            vcodec: Some("none".into()),
            acodec: Some("opus".into()),
            file_size: size,
            file_size_approx: approx,
            ..Default::default()
        }
    }

    fn video(id: &str) -> Format {
        Format {
            format_id: id.to_string(),
            vcodec: Some("avc1".into()),
            acodec: Some("none".into()),
            ..Default::default()
        }
    }

    fn info() -> VideoInfo {
        VideoInfo {
            id: "abc".into(),
            title: "Original".into(),
            original_url: Some("https://example.com/watch?v=abc".into()),
            file_size_approx: Some(42.0),
            ..Default::default()
        }
    }

    fn select(formats: Vec<Format>) -> FormatSelection {
        FormatSelection {
            formats,
            ..Default::default()
        }
    }

    #[test]
    fn test_format_id_keeps_input_order() {
        let factory = TaskFactory::default();
        let ab = factory.create_with_configurations(&info(), select(vec![video("A"), audio("B", None, None)]));
        let ba = factory.create_with_configurations(&info(), select(vec![audio("B", None, None), video("A")]));
        assert_eq!(ab.task.preferences.format_id_string, "A+B");
        assert_eq!(ba.task.preferences.format_id_string, "B+A");
    }

    #[test]
    fn test_audio_only_selection() {
        let factory = TaskFactory::default();
        let result = factory.create_with_configurations(&info(), select(vec![audio("251", None, None)]));

        assert!(result.task.preferences.extract_audio);
        assert!(!result.task.preferences.merge_audio_stream);
        assert!(result.state.view_state.video_formats.is_empty());
        assert_eq!(result.state.view_state.audio_only_formats.len(), 1);
        assert!(matches!(result.state.download_state, DownloadState::ReadyWithInfo));
    }

    #[test]
    fn test_merge_audio_streams() {
        let factory = TaskFactory::default();
        let result = factory.create_with_configurations(
            &info(),
            select(vec![audio("251", None, None), audio("140", None, None)]),
        );
        assert!(result.task.preferences.merge_audio_stream);
        assert!(result.task.preferences.extract_audio);

        // 有视频流时不算纯音频
        let mixed = factory.create_with_configurations(&info(), select(vec![video("137"), audio("140", None, None)]));
        assert!(!mixed.task.preferences.extract_audio);
        assert!(!mixed.task.preferences.merge_audio_stream);
    }

    #[test]
    fn test_file_size_aggregation() {
        let factory = TaskFactory::default();
        let result = factory.create_with_configurations(
            &info(),
            select(vec![audio("a", Some(1000.0), None), audio("b", None, Some(500.0))]),
        );
        let info = result.state.video_info.unwrap();
        assert_eq!(info.file_size, Some(1500.0));
        assert_eq!(result.state.view_state.file_size_approx, 1500.0);

        // 格式都没有大小时，不覆盖已有估算
        let unknown = factory.create_with_configurations(&self::info(), select(vec![video("137")]));
        assert_eq!(unknown.state.video_info.unwrap().file_size, None);
        assert_eq!(unknown.state.view_state.file_size_approx, 42.0);
    }

    #[test]
    fn test_title_and_subtitles_overlay() {
        let factory = TaskFactory::new(DownloadPreferences {
            output_dir: "/sdcard/Download".into(),
            ..Default::default()
        });
        let result = factory.create_with_configurations(
            &info(),
            FormatSelection {
                formats: vec![video("137")],
                new_title: "Renamed".into(),
                selected_subtitles: vec!["en".into()],
                selected_auto_captions: vec!["ja".into()],
                split_by_chapter: true,
                ..Default::default()
            },
        );

        let preferences = &result.task.preferences;
        assert_eq!(preferences.output_dir, "/sdcard/Download");
        assert_eq!(preferences.new_title, "Renamed");
        assert!(preferences.split_by_chapter);
        assert!(preferences.download_subtitle);
        assert!(preferences.auto_subtitle);
        assert_eq!(preferences.subtitle_language, "en,ja");
        assert_eq!(result.state.view_state.title, "Renamed");
        assert_eq!(result.task.url, "https://example.com/watch?v=abc");
    }

    #[test]
    fn test_no_subtitle_keeps_defaults() {
        let factory = TaskFactory::default();
        let result = factory.create_with_configurations(&info(), select(vec![video("137")]));
        assert!(!result.task.preferences.download_subtitle);
        assert_eq!(
            result.task.preferences.subtitle_language,
            DownloadPreferences::default().subtitle_language
        );
    }

    fn playlist(count: usize) -> PlaylistResult {
        PlaylistResult {
            title: Some("Mix".into()),
            entries: Some(
                (1..=count)
                    .map(|i| PlaylistEntry {
                        url: Some(format!("https://example.com/{}", i)),
                        title: Some(format!("Entry {}", i)),
                        duration: Some(10.4),
                        thumbnails: Some(vec![
                            Thumbnail {
                                url: format!("{}-low.jpg", i),
                                ..Default::default()
                            },
                            Thumbnail {
                                url: format!("{}-high.jpg", i),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_playlist_index_mapping() {
        let result = TaskFactory::create_with_playlist_result(
            "https://example.com/list",
            &[3, 1],
            &playlist(5),
            &DownloadPreferences::default(),
        );

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].task.type_info, TypeInfo::Playlist(3));
        assert_eq!(result[1].task.type_info, TypeInfo::Playlist(1));
        assert_eq!(result[0].state.view_state.title, "Entry 3");
        assert_eq!(result[0].state.view_state.thumbnail_url, "3-high.jpg");
        assert_eq!(result[0].state.view_state.duration, 10);
        assert_ne!(result[0].task.id, result[1].task.id);
        assert!(result.iter().all(|r| r.state.video_info.is_none()));
        assert!(result.iter().all(|r| matches!(r.state.download_state, DownloadState::Idle)));
    }

    #[test]
    fn test_playlist_fallbacks() {
        let mut result = playlist(3);
        if let Some(entries) = result.entries.as_mut() {
            entries[1] = PlaylistEntry::default();
        }

        let tasks = TaskFactory::create_with_playlist_result(
            "https://example.com/list",
            &[2],
            &result,
            &DownloadPreferences::default(),
        );
        let view = &tasks[0].state.view_state;
        assert_eq!(view.title, "Mix - 2");
        assert_eq!(view.uploader, "");
        assert_eq!(view.thumbnail_url, "");
        assert_eq!(view.duration, 0);

        result.channel = Some("Playlist Channel".into());
        let tasks = TaskFactory::create_with_playlist_result(
            "https://example.com/list",
            &[2],
            &result,
            &DownloadPreferences::default(),
        );
        assert_eq!(tasks[0].state.view_state.uploader, "Playlist Channel");
    }

    #[test]
    fn test_playlist_duplicate_index_collapses() {
        let tasks = TaskFactory::create_with_playlist_result(
            "https://example.com/list",
            &[2, 1, 2],
            &playlist(3),
            &DownloadPreferences::default(),
        );
        let indexes: Vec<_> = tasks.iter().filter_map(|t| t.task.playlist_index()).collect();
        assert_eq!(indexes, vec![2, 1]);
    }

    #[test]
    #[should_panic(expected = "播放列表条目尚未解析")]
    fn test_playlist_without_entries_panics() {
        TaskFactory::create_with_playlist_result(
            "https://example.com/list",
            &[1],
            &PlaylistResult::default(),
            &DownloadPreferences::default(),
        );
    }
}
