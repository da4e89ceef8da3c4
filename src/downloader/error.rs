use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("下载引擎错误: {0}")]
    Engine(String),
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON解析错误: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("无效的URL: {0}")]
    InvalidUrl(String),
    #[error("任务未找到: {0}")]
    TaskNotFound(String),
    #[error("无效的状态: {0}")]
    InvalidState(String),
    #[error("任务已取消")]
    Canceled,
    #[error("进程异常退出，退出码: {0}")]
    ProcessExited(i32),
}

impl From<url::ParseError> for DownloadError {
    fn from(error: url::ParseError) -> Self {
        DownloadError::InvalidUrl(error.to_string())
    }
}
