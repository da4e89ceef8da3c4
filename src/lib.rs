pub mod common;
pub mod downloader;

pub use downloader::{DownloadCore, DownloadError, Task, TaskFactory};
