use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::engine::{MediaEngine, ProgressUpdate};
use super::error::DownloadError;
use super::history::{HistoryRecord, HistorySink};
use super::task::{
    CommandTemplate, DownloadState, Job, PROGRESS_INDETERMINATE, RestartableAction, State, Task,
    TaskFilter, TaskId, TypeInfo, ViewState,
};
use crate::common::models::PlaylistResult;

/// 任务注册表的配置
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// 同时下载的任务数，解析元数据不受限制
    pub max_concurrent: usize,
    /// 事件通道容量，订阅者落后太多会收到 Lagged
    pub event_capacity: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            event_capacity: 256,
        }
    }
}

/// 注册表发布的变更事件
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Updated { task: Task, state: State },
    Removed { task: Task },
}

impl TaskEvent {
    pub fn task(&self) -> &Task {
        match self {
            TaskEvent::Updated { task, .. } | TaskEvent::Removed { task } => task,
        }
    }
}

// 注册表中的一项，job 存在说明有后台操作在运行
struct Slot {
    task: Task,
    state: State,
    job: Option<Job>,
    action: RestartableAction,
}

/// 所有下载任务的唯一来源，也是状态转换的唯一入口
#[derive(Clone)]
pub struct DownloadCore {
    tasks: Arc<DashMap<TaskId, Slot>>, // task_id -> Slot
    engine: Arc<dyn MediaEngine>,
    semaphore: Arc<Semaphore>, // 控制并发数
    events: broadcast::Sender<TaskEvent>,
    history: Option<Arc<dyn HistorySink>>,
}

impl DownloadCore {
    pub fn new(engine: Arc<dyn MediaEngine>, config: DownloaderConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            tasks: Arc::new(DashMap::new()),
            engine,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            events,
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    // ------------------------------------------------------------------ 查询

    /// 订阅状态变更，先订阅再提交任务才不会漏掉事件
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// 当前所有任务状态的快照
    pub fn get_task_state_map(&self) -> HashMap<Task, State> {
        self.tasks
            .iter()
            .map(|slot| (slot.task.clone(), slot.state.clone()))
            .collect()
    }

    pub fn snapshot_filtered(&self, filter: TaskFilter) -> Vec<(Task, State)> {
        self.tasks
            .iter()
            .filter(|slot| filter.matches(&slot.state.download_state))
            .map(|slot| (slot.task.clone(), slot.state.clone()))
            .collect()
    }

    pub fn get_state(&self, task_id: &str) -> Option<State> {
        self.tasks.get(task_id).map(|slot| slot.state.clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 解析播放列表，供调用方用 TaskFactory 构造批量任务
    pub async fn fetch_playlist(&self, url: &str) -> Result<PlaylistResult, DownloadError> {
        url::Url::parse(url)?;
        let token = Job::new().token();
        self.engine.fetch_playlist(url, token).await
    }

    // ------------------------------------------------------------------ 命令

    /// 提交一个新链接，从 Idle 开始解析
    pub fn enqueue(&self, task: Task) {
        let view_state = ViewState {
            url: task.url.clone(),
            ..Default::default()
        };
        self.enqueue_with_state(task, State::idle(view_state));
    }

    /// 以指定的初始状态注册任务
    ///
    /// 同一 id 已有进行中的操作时，先取消旧操作再重新开始
    pub fn enqueue_with_state(&self, task: Task, state: State) {
        let mut state = state;
        if matches!(
            state.download_state,
            DownloadState::FetchingInfo { .. } | DownloadState::Running { .. }
        ) {
            // 外部传入的 job 不受本注册表管理
            state.download_state = if state.video_info.is_some() {
                DownloadState::ReadyWithInfo
            } else {
                DownloadState::Idle
            };
        }

        let action = task.default_action();
        let job = match state.download_state {
            DownloadState::Idle | DownloadState::ReadyWithInfo => Some(Job::new()),
            _ => None,
        };
        let slot = Slot {
            task: task.clone(),
            state,
            job: job.clone(),
            action: action.clone(),
        };

        let previous_job = match self.tasks.entry(task.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(slot);
                self.publish(occupied.get());
                previous.job
            }
            Entry::Vacant(vacant) => {
                let inserted = vacant.insert(slot);
                self.publish(inserted.value());
                None
            }
        };
        if let Some(previous_job) = previous_job {
            warn!("任务 {} 已有进行中的操作，取消后重新开始", task.id);
            previous_job.cancel();
        }

        info!("添加下载任务: {} ({})", task.id, task.url);
        if let Some(job) = job {
            self.spawn(task, job, action);
        }
    }

    /// 用自定义命令模板执行一个链接
    pub fn enqueue_command(&self, url: &str, template: CommandTemplate) -> Task {
        let task = Task::with_type(
            url,
            Default::default(),
            TypeInfo::CustomCommand(template.clone()),
        );
        let view_state = ViewState {
            url: url.to_string(),
            title: template.name.clone(),
            ..Default::default()
        };
        self.enqueue_with_state(
            task.clone(),
            State {
                download_state: DownloadState::ReadyWithInfo,
                video_info: None,
                view_state,
            },
        );
        task
    }

    /// 请求取消，返回是否找到正在运行的操作
    ///
    /// 只是发出取消信号，不等待底层进程退出
    pub fn cancel(&self, task: &Task) -> bool {
        self.cancel_by_id(&task.id)
    }

    pub fn cancel_by_id(&self, task_id: &str) -> bool {
        let Some(mut slot) = self.tasks.get_mut(task_id) else {
            debug!("取消的任务不存在: {}", task_id);
            return false;
        };
        if !slot.state.download_state.is_cancellable() {
            // 已结束的任务重复取消不做任何事
            return false;
        }

        let progress = match slot.state.download_state {
            DownloadState::Running { progress, .. } if progress >= 0.0 => Some(progress),
            _ => None,
        };
        let had_job = match slot.job.take() {
            Some(job) => {
                job.cancel();
                true
            }
            None => false,
        };
        let canceled = DownloadState::Canceled {
            action: slot.action.clone(),
            progress,
        };
        slot.state = slot.state.with_download_state(canceled);
        self.publish(&slot);

        info!("已取消任务: {}", task_id);
        had_job
    }

    /// 注册表中找不到运行中的操作时，退回到按 id 结束进程
    pub fn cancel_or_destroy(&self, task_id: &str) -> bool {
        if self.cancel_by_id(task_id) {
            return true;
        }
        let destroyed = self.engine.destroy_process(task_id);
        if destroyed {
            warn!("任务 {} 不在注册表中，已直接结束其进程", task_id);
        }
        destroyed
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = self.tasks.iter().map(|slot| slot.key().clone()).collect();
        ids.iter().filter(|id| self.cancel_by_id(id)).count()
    }

    /// 从 Canceled / Error 重新开始，使用保存的动作和原配置
    pub fn restart(&self, task: &Task) -> Result<(), DownloadError> {
        let (task, job, action) = {
            let mut slot = self
                .tasks
                .get_mut(&task.id)
                .ok_or_else(|| DownloadError::TaskNotFound(task.id.clone()))?;

            let action = slot
                .state
                .download_state
                .restartable_action()
                .cloned()
                .ok_or_else(|| {
                    DownloadError::InvalidState(format!(
                        "任务 {} 当前状态为 {}，无法重试",
                        task.id,
                        slot.state.download_state.name()
                    ))
                })?;

            let job = Job::new();
            let next = if needs_fetch(&action, &slot.state) {
                DownloadState::FetchingInfo {
                    job: job.clone(),
                    task_id: task.id.clone(),
                }
            } else {
                DownloadState::Running {
                    job: job.clone(),
                    task_id: task.id.clone(),
                    progress: PROGRESS_INDETERMINATE,
                    progress_text: String::new(),
                }
            };
            slot.job = Some(job.clone());
            slot.action = action.clone();
            slot.state = slot.state.with_download_state(next);
            self.publish(&slot);

            (slot.task.clone(), job, action)
        };

        info!("重新开始任务: {}", task.id);
        self.spawn(task, job, action);
        Ok(())
    }

    /// 从注册表中删除，运行中的操作一并取消
    pub fn remove(&self, task: &Task) -> bool {
        match self.tasks.remove(&task.id) {
            Some((_, slot)) => {
                if let Some(job) = slot.job {
                    job.cancel();
                }
                let _ = self.events.send(TaskEvent::Removed { task: slot.task });
                info!("已删除任务: {}", task.id);
                true
            }
            None => false,
        }
    }

    /// 修改显示标题，完成后的任务不可修改
    pub fn rename(&self, task: &Task, title: &str) -> Result<(), DownloadError> {
        let mut slot = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| DownloadError::TaskNotFound(task.id.clone()))?;
        if slot.state.download_state.is_completed() {
            return Err(DownloadError::InvalidState(format!(
                "任务 {} 已完成，标题不可修改",
                task.id
            )));
        }
        slot.state.view_state.title = title.to_string();
        self.publish(&slot);
        Ok(())
    }

    // ------------------------------------------------------------------ 内部

    // 必须在持有条目锁时调用，保证同一任务的事件顺序与写入顺序一致
    fn publish(&self, slot: &Slot) {
        let _ = self.events.send(TaskEvent::Updated {
            task: slot.task.clone(),
            state: slot.state.clone(),
        });
    }

    // 只有持有当前 job 的后台操作才能写入，旧操作的迟到回调被丢弃
    fn transition(&self, task_id: &str, job: &Job, apply: impl FnOnce(&mut Slot)) -> bool {
        match self.tasks.get_mut(task_id) {
            Some(mut slot) if slot.job.as_ref() == Some(job) => {
                apply(slot.value_mut());
                self.publish(&slot);
                true
            }
            _ => false,
        }
    }

    fn spawn(&self, task: Task, job: Job, action: RestartableAction) {
        let core = self.clone();
        tokio::spawn(async move {
            core.run(task, job, action).await;
        });
    }

    async fn run(self, task: Task, job: Job, action: RestartableAction) {
        let token = job.token();
        let Some(state) = self.get_state(&task.id) else {
            return;
        };
        let fetch = needs_fetch(&action, &state);
        let mut video_info = state.video_info;

        // 1. 解析元数据
        if fetch {
            let fetching = DownloadState::FetchingInfo {
                job: job.clone(),
                task_id: task.id.clone(),
            };
            if !self.transition(&task.id, &job, |slot| {
                slot.state = slot.state.with_download_state(fetching);
            }) {
                return;
            }
            debug!("开始解析元数据: {}", task.id);

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.engine.fetch_info(&task, token.clone()) => result,
            };
            match result {
                Ok(info) => {
                    let title_override = task.preferences.new_title.clone();
                    let resolved = info.clone();
                    self.transition(&task.id, &job, |slot| {
                        slot.state.view_state =
                            slot.state.view_state.refresh_with(&resolved, &title_override);
                        slot.state.video_info = Some(resolved);
                        slot.state.download_state = DownloadState::ReadyWithInfo;
                    });
                    info!("元数据解析完成: {} << {} >>", task.id, info.title);
                    video_info = Some(info);
                }
                Err(DownloadError::Canceled) => {
                    self.finish_canceled(&task, &job);
                    return;
                }
                Err(e) => {
                    self.finish_with_error(&task, &job, &action, e);
                    return;
                }
            }
        }

        // 2. 等待下载槽位
        let _permit = tokio::select! {
            _ = token.cancelled() => return,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish_with_error(
                        &task,
                        &job,
                        &action,
                        DownloadError::InvalidState("信号量已关闭".to_string()),
                    );
                    return;
                }
            },
        };

        // 3. 下载
        let running = DownloadState::Running {
            job: job.clone(),
            task_id: task.id.clone(),
            progress: PROGRESS_INDETERMINATE,
            progress_text: String::new(),
        };
        if !self.transition(&task.id, &job, |slot| {
            slot.state = slot.state.with_download_state(running);
        }) {
            return;
        }
        info!("开始下载任务: {}", task.id);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let download = async {
            match &action {
                RestartableAction::Download => {
                    self.engine
                        .download(&task, video_info.as_ref(), progress_tx, token.clone())
                        .await
                }
                RestartableAction::CustomCommand(template) => {
                    self.engine
                        .run_command(&task, template, progress_tx, token.clone())
                        .await
                }
            }
        };
        tokio::pin!(download);

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => return,
                Some(update) = progress_rx.recv() => self.apply_progress(&task.id, &job, update),
                result = &mut download => break result,
            }
        };
        while let Ok(update) = progress_rx.try_recv() {
            self.apply_progress(&task.id, &job, update);
        }

        match result {
            Ok(file_path) => self.finish_completed(&task, &job, file_path),
            Err(DownloadError::Canceled) => {
                self.finish_canceled(&task, &job);
            }
            Err(e) => self.finish_with_error(&task, &job, &action, e),
        }
    }

    // 进程被外部结束，令牌本身没有取消
    fn finish_canceled(&self, task: &Task, job: &Job) -> bool {
        let applied = self.transition(&task.id, job, |slot| {
            let progress = slot.state.download_state.progress().filter(|p| *p >= 0.0);
            slot.job = None;
            slot.state = slot.state.with_download_state(DownloadState::Canceled {
                action: slot.action.clone(),
                progress,
            });
        });
        if applied {
            warn!("任务 {} 的进程被外部结束", task.id);
        }
        applied
    }

    fn apply_progress(&self, task_id: &str, job: &Job, update: ProgressUpdate) {
        self.transition(task_id, job, |slot| {
            if let DownloadState::Running { progress, .. } = slot.state.download_state {
                // 同一轮下载内进度不回退
                let next = if update.fraction >= 0.0 {
                    update.fraction.clamp(0.0, 1.0).max(progress)
                } else {
                    progress
                };
                slot.state.download_state = DownloadState::Running {
                    job: job.clone(),
                    task_id: task_id.to_string(),
                    progress: next,
                    progress_text: update.line,
                };
            }
        });
    }

    fn finish_completed(&self, task: &Task, job: &Job, file_path: Option<String>) {
        let mut record = None;
        self.transition(&task.id, job, |slot| {
            slot.job = None;
            slot.state = slot.state.with_download_state(DownloadState::Completed {
                file_path: file_path.clone(),
            });
            if let Some(path) = &file_path {
                record = Some(HistoryRecord::from_completed(&slot.task, &slot.state, path));
            }
        });
        info!("✅ 下载任务完成: {} -> {:?}", task.id, file_path);

        if let (Some(history), Some(record)) = (&self.history, record) {
            history.record(record);
        }
    }

    fn finish_with_error(&self, task: &Task, job: &Job, action: &RestartableAction, e: DownloadError) {
        error!("❌ 下载任务失败: {}, 错误: {}", task.id, e);
        let error = Arc::new(e);
        self.transition(&task.id, job, |slot| {
            slot.job = None;
            slot.state = slot.state.with_download_state(DownloadState::Error {
                error,
                action: action.clone(),
            });
        });
    }
}

fn needs_fetch(action: &RestartableAction, state: &State) -> bool {
    matches!(action, RestartableAction::Download) && state.video_info.is_none()
}

// --------------------------------------------------------------------

/// 订阅方自己维护的渲染快照
#[derive(Debug, Default, Clone)]
pub struct TaskStateView {
    entries: HashMap<TaskId, (Task, State)>,
}

impl TaskStateView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Updated { task, state } => {
                self.entries
                    .insert(task.id.clone(), (task.clone(), state.clone()));
            }
            TaskEvent::Removed { task } => {
                self.entries.remove(&task.id);
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&State> {
        self.entries.get(task_id).map(|(_, state)| state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn filtered(&self, filter: TaskFilter) -> Vec<&(Task, State)> {
        self.entries
            .values()
            .filter(|(_, state)| filter.matches(&state.download_state))
            .collect()
    }

    /// 没有进行中的任务
    pub fn is_settled(&self) -> bool {
        self.filtered(TaskFilter::Downloading).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::common::models::VideoInfo;
    use crate::downloader::engine::ProgressSender;

    // 所有操作都挂起，状态只由测试直接驱动
    struct PendingEngine;

    #[async_trait]
    impl MediaEngine for PendingEngine {
        async fn fetch_info(
            &self,
            _task: &Task,
            _token: CancellationToken,
        ) -> Result<VideoInfo, DownloadError> {
            std::future::pending().await
        }

        async fn fetch_playlist(
            &self,
            _url: &str,
            _token: CancellationToken,
        ) -> Result<PlaylistResult, DownloadError> {
            std::future::pending().await
        }

        async fn download(
            &self,
            _task: &Task,
            _video_info: Option<&VideoInfo>,
            _progress: ProgressSender,
            _token: CancellationToken,
        ) -> Result<Option<String>, DownloadError> {
            std::future::pending().await
        }

        async fn run_command(
            &self,
            _task: &Task,
            _template: &CommandTemplate,
            _progress: ProgressSender,
            _token: CancellationToken,
        ) -> Result<Option<String>, DownloadError> {
            std::future::pending().await
        }

        fn destroy_process(&self, _process_id: &str) -> bool {
            false
        }
    }

    fn template() -> CommandTemplate {
        CommandTemplate {
            id: 7,
            name: "mp3".to_string(),
            template: "-x --audio-format mp3".to_string(),
        }
    }

    #[tokio::test]
    async fn test_external_kill_only_applies_to_current_job() {
        let core = DownloadCore::new(Arc::new(PendingEngine), DownloaderConfig::default());
        let task = core.enqueue_command("https://example.com/v", template());

        // 过期的 job 不能把任务改成 Canceled
        assert!(!core.finish_canceled(&task, &Job::new()));
        assert!(core.get_state(&task.id).unwrap().download_state.is_cancellable());

        let job = core.tasks.get(&task.id).and_then(|slot| slot.job.clone()).unwrap();
        assert!(core.finish_canceled(&task, &job));
        match core.get_state(&task.id).unwrap().download_state {
            DownloadState::Canceled { action, .. } => {
                assert_eq!(action, RestartableAction::CustomCommand(template()))
            }
            other => panic!("意外的状态: {}", other.name()),
        }
        assert!(core.tasks.get(&task.id).unwrap().job.is_none());

        // 已处理过的 job 再次上报也被忽略
        assert!(!core.finish_canceled(&task, &job));
    }
}
