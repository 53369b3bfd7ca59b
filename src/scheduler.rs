//! 为每个叶子文件发出一次 `PUT` 上传。
//!
//! 默认不限制并发，发现一个叶子就立刻开始上传；设置 `max_in_flight` 后任务
//! 先排队等待许可。每个任务的终态恰好向批次报告一次。

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::completion::{BatchSummary, TransferBatch};
use crate::error::{Rejection, TransferError};
use crate::path::{directory_url, encode_segments, join_url};
use crate::progress::{ProgressReport, ProgressTracker};
use crate::tree::{LeafDescriptor, LeafSource};

/// 读取本地文件的块大小
const CHUNK_SIZE: usize = 64 * 1024;

/// 携带源文件修改时间（Unix 毫秒）
pub const LAST_MODIFIED_HEADER: &str = "X-Last-Modified";

pub type TaskId = u64;

type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded { status: u16 },
    Failed(Arc<TransferError>),
    Cancelled,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Succeeded { .. } => TaskStatus::Succeeded,
            TaskOutcome::Failed(_) => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
        }
    }

    pub fn error(&self) -> Option<&TransferError> {
        match self {
            TaskOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    fn failed(err: TransferError) -> Self {
        TaskOutcome::Failed(Arc::new(err))
    }
}

/// 单个上传的当前状态，只由该任务自己的生命周期修改
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: TaskId,
    pub descriptor: LeafDescriptor,
    pub destination_url: String,
    pub bytes_sent: u64,
    pub status: TaskStatus,
    pub started_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    Started {
        id: TaskId,
        path: String,
        destination_url: String,
        size: u64,
    },
    Progress {
        id: TaskId,
        report: ProgressReport,
    },
    Finished {
        id: TaskId,
        path: String,
        outcome: TaskOutcome,
    },
    BatchComplete(BatchSummary),
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// `None` 表示不限并发
    pub max_in_flight: Option<usize>,
    pub send_last_modified: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_in_flight: None,
            send_last_modified: true,
        }
    }
}

#[derive(Clone)]
pub struct Uploader {
    client: Client,
    base_url: String,
    options: UploadOptions,
    permits: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<UploadEvent>>,
    next_id: Arc<AtomicU64>,
}

impl Uploader {
    pub fn new(client: Client, base_url: impl AsRef<str>, options: UploadOptions) -> Self {
        let permits = options
            .max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Self {
            client,
            base_url: directory_url(base_url.as_ref()),
            options,
            permits,
            cancel: CancellationToken::new(),
            events: None,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn destination_for(&self, leaf: &LeafDescriptor) -> String {
        join_url(&self.base_url, &encode_segments(leaf.relative_path()))
    }

    pub(crate) fn emit(&self, event: UploadEvent) {
        if let Some(events) = &self.events {
            // 没有人接收事件时不影响上传
            let _ = events.send(event);
        }
    }

    /// 立即返回；上传在后台任务里进行，终态会报告给 `batch`。
    ///
    /// 调用前必须已经在 `batch` 上登记过这个叶子。
    pub fn schedule(&self, leaf: LeafDescriptor, batch: &TransferBatch) -> ScheduledTask {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let destination_url = self.destination_for(&leaf);
        let path = leaf.display_path();
        let state = Arc::new(Mutex::new(UploadTask {
            id,
            descriptor: leaf,
            destination_url: destination_url.clone(),
            bytes_sent: 0,
            status: TaskStatus::Pending,
            started_at: None,
        }));

        let uploader = self.clone();
        let batch = batch.clone();
        let task_state = Arc::clone(&state);
        let span = info_span!("upload", id, path = %path);
        let join = tokio::spawn(
            async move {
                let outcome = uploader.run(&task_state).await;
                task_state.lock().status = outcome.status();
                match &outcome {
                    TaskOutcome::Succeeded { status } => info!(status, "upload finished"),
                    TaskOutcome::Failed(err) => warn!(error = %err, "upload failed"),
                    TaskOutcome::Cancelled => info!("upload cancelled"),
                }
                uploader.emit(UploadEvent::Finished {
                    id,
                    path,
                    outcome: outcome.clone(),
                });
                if let Err(err) = batch.report_terminal(&outcome) {
                    warn!(error = %err, "terminal report rejected");
                }
                outcome
            }
            .instrument(span),
        );

        ScheduledTask {
            id,
            destination_url,
            state,
            join,
        }
    }

    async fn run(&self, state: &Arc<Mutex<UploadTask>>) -> TaskOutcome {
        // 有并发上限时先排队；排队期间也可以取消
        let _permit: Option<OwnedSemaphorePermit> = match &self.permits {
            Some(permits) => tokio::select! {
                permit = Arc::clone(permits).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return TaskOutcome::Cancelled,
                },
                _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
            },
            None => None,
        };
        if self.cancel.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        let started_at = Instant::now();
        let (id, leaf, url) = {
            let mut task = state.lock();
            task.status = TaskStatus::Active;
            task.started_at = Some(started_at);
            (task.id, task.descriptor.clone(), task.destination_url.clone())
        };
        debug!(url = %url, size = leaf.size(), "upload started");
        self.emit(UploadEvent::Started {
            id,
            path: leaf.display_path(),
            destination_url: url.clone(),
            size: leaf.size(),
        });

        let body = match open_source(leaf.source()).await {
            Ok(body) => body,
            Err(err) => return TaskOutcome::failed(err),
        };
        let metered = Metered::new(body, self.progress_callback(id, leaf.size(), started_at, state));

        let mut request = self
            .client
            .put(&url)
            .header(CONTENT_LENGTH, leaf.size())
            .body(reqwest::Body::wrap_stream(metered));
        if let Some(mime) = mime_guess::from_path(leaf.name()).first() {
            request = request.header(CONTENT_TYPE, mime.essence_str());
        }
        if self.options.send_last_modified {
            if let Some(modified) = leaf.last_modified() {
                request = request.header(LAST_MODIFIED_HEADER, unix_millis(modified));
            }
        }

        let response = tokio::select! {
            response = request.send() => response,
            _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
        };
        match response {
            Ok(response) if response.status().is_success() => TaskOutcome::Succeeded {
                status: response.status().as_u16(),
            },
            Ok(response) => TaskOutcome::failed(Rejection::from_response(response).await.into()),
            Err(err) => TaskOutcome::failed(TransferError::Transport(err)),
        }
    }

    fn progress_callback(
        &self,
        id: TaskId,
        total: u64,
        started_at: Instant,
        state: &Arc<Mutex<UploadTask>>,
    ) -> impl FnMut(u64, bool) + Send + Sync + 'static {
        let state = Arc::clone(state);
        let events = self.events.clone();
        let mut tracker = ProgressTracker::new(started_at);
        move |loaded, finished| {
            state.lock().bytes_sent = loaded;
            let now = Instant::now();
            if tracker.should_emit(now, finished) {
                let report = tracker.sample(loaded, Some(total), now);
                if let Some(events) = &events {
                    let _ = events.send(UploadEvent::Progress { id, report });
                }
            }
        }
    }
}

/// `schedule` 的返回值，可随时查看任务状态或等待其终态
#[derive(Debug)]
pub struct ScheduledTask {
    id: TaskId,
    destination_url: String,
    state: Arc<Mutex<UploadTask>>,
    join: JoinHandle<TaskOutcome>,
}

impl ScheduledTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn destination_url(&self) -> &str {
        &self.destination_url
    }

    pub fn snapshot(&self) -> UploadTask {
        self.state.lock().clone()
    }

    pub async fn outcome(self) -> TaskOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => TaskOutcome::failed(TransferError::Aborted(err.to_string())),
        }
    }
}

fn unix_millis(at: OffsetDateTime) -> String {
    (at.unix_timestamp_nanos() / 1_000_000).to_string()
}

async fn open_source(source: &LeafSource) -> Result<BodyStream, TransferError> {
    match source {
        LeafSource::Path(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|source| TransferError::Source {
                    path: path.clone(),
                    source,
                })?;
            Ok(Box::pin(ReaderStream::with_capacity(file, CHUNK_SIZE)))
        }
        LeafSource::Memory(data) => {
            let data = data.clone();
            let chunks: Vec<io::Result<Bytes>> = (0..data.len())
                .step_by(CHUNK_SIZE)
                .map(|start| Ok(data.slice(start..(start + CHUNK_SIZE).min(data.len()))))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }
    }
}

pin_project! {
    /// 统计已交给 HTTP 客户端的字节数
    struct Metered<S, F> {
        #[pin]
        inner: S,
        sent: u64,
        on_progress: F,
    }
}

impl<S, F> Metered<S, F> {
    fn new(inner: S, on_progress: F) -> Self {
        Self {
            inner,
            sent: 0,
            on_progress,
        }
    }
}

impl<S, F> Stream for Metered<S, F>
where
    S: Stream<Item = io::Result<Bytes>>,
    F: FnMut(u64, bool),
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                *this.sent += chunk.len() as u64;
                (this.on_progress)(*this.sent, false);
            }
            Poll::Ready(None) => (this.on_progress)(*this.sent, true),
            _ => {}
        }
        polled
    }
}
