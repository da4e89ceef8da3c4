pub mod core;
pub mod engine;
pub mod error;
pub mod factory;
pub mod history;
pub mod preferences;
pub mod progress;
pub mod task;
pub mod ytdlp;

pub use core::{DownloadCore, DownloaderConfig, TaskEvent, TaskStateView};
pub use engine::{MediaEngine, ProgressSender, ProgressUpdate};
pub use error::DownloadError;
pub use factory::{FormatSelection, TaskFactory, TaskWithState};
pub use history::{Backup, HistoryRecord, HistorySink, MemoryHistory};
pub use preferences::DownloadPreferences;
pub use progress::DownloadProgress;
pub use task::{
    CommandTemplate, DownloadState, RestartableAction, State, Task, TaskFilter, TaskId, TypeInfo,
    ViewState,
};
pub use ytdlp::YtDlpEngine;
