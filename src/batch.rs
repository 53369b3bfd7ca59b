//! 一次输入（拖放、选择文件、命令行参数）对应的一整批上传。

use futures_util::StreamExt;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::completion::{BatchSummary, TransferBatch};
use crate::error::{BatchError, EnumerationError};
use crate::scheduler::{TaskStatus, UploadEvent, Uploader};
use crate::tree::{count_leaves, enumerate, RootSource};

/// 预期数量的确定方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountMode {
    /// 先单独展开一遍计数，再展开第二遍上传
    #[default]
    Prepass,
    /// 边展开边登记
    Incremental,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub path: String,
    pub destination_url: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub id: Uuid,
    pub summary: BatchSummary,
    pub tasks: Vec<TaskReport>,
    pub enumeration_errors: Vec<String>,
}

/// 展开 `source` 的所有叶子并逐个上传，等到整批完成后返回。
///
/// 单个文件读取或上传失败不影响其他文件，完成信号照样触发。
pub async fn upload_batch<R>(
    uploader: &Uploader,
    source: &R,
    batch: &TransferBatch,
    mode: CountMode,
) -> Result<BatchReport, BatchError>
where
    R: RootSource + ?Sized,
{
    let id = Uuid::new_v4();
    let span = info_span!("batch", %id);
    async move {
        let mut registered = 0u64;
        if mode == CountMode::Prepass {
            let roots = match source.open_roots().await {
                Ok(roots) => roots,
                Err(err) => return Err(abandon(batch, err)),
            };
            let count = count_leaves(roots).await;
            info!(leaves = count.leaves, bytes = count.bytes, "counted upload tree");
            batch.register(count.leaves)?;
            registered = count.leaves;
        }

        // 上传遍重新打开根，不复用计数遍已经读完的游标
        let roots = match source.open_roots().await {
            Ok(roots) => roots,
            Err(err) => return Err(abandon(batch, err)),
        };
        let mut leaves = enumerate(roots);
        let mut tasks = Vec::new();
        let mut enumeration_errors = Vec::new();
        while let Some(item) = leaves.next().await {
            match item {
                Ok(leaf) => {
                    // 计数之后新增的文件也要登记，先登记后发出
                    if tasks.len() as u64 >= registered {
                        batch.register(1)?;
                        registered += 1;
                    }
                    tasks.push(uploader.schedule(leaf, batch));
                }
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry");
                    enumeration_errors.push(err.to_string());
                }
            }
        }

        batch.reconcile(tasks.len() as u64)?;
        batch.seal();
        let summary = batch.wait().await;

        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            let snapshot = task.snapshot();
            let outcome = task.outcome().await;
            reports.push(TaskReport {
                path: snapshot.descriptor.display_path(),
                destination_url: snapshot.destination_url,
                status: outcome.status(),
                error: outcome.error().map(ToString::to_string),
            });
        }
        uploader.emit(UploadEvent::BatchComplete(summary));

        Ok(BatchReport {
            id,
            summary,
            tasks: reports,
            enumeration_errors,
        })
    }
    .instrument(span)
    .await
}

/// 打不开上传根：作废已登记的数量并封住批次，等待者随即收到完成信号
fn abandon(batch: &TransferBatch, err: EnumerationError) -> BatchError {
    match batch.reconcile(0) {
        Ok(()) => {
            batch.seal();
            err.into()
        }
        Err(gate) => gate.into(),
    }
}
