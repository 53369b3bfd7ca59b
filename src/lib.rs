//! 把本地文件和整棵目录树通过逐文件 `PUT` 上传到 HTTP 服务器。
//!
//! 流程：[`tree::enumerate`] 把输入的根展开成叶子文件，[`scheduler::Uploader`] 为每个叶子
//! 发出一次上传并跟踪进度，[`completion::TransferBatch`] 统计剩余数量并在整批结束时
//! 触发一次完成信号。[`batch::upload_batch`] 把这几步串起来。

pub mod batch;
pub mod completion;
pub mod config;
pub mod error;
pub mod local;
pub mod logging;
pub mod manage;
pub mod path;
pub mod progress;
pub mod scheduler;
pub mod tree;

pub use batch::{upload_batch, BatchReport, CountMode, TaskReport};
pub use completion::{BatchSummary, TransferBatch};
pub use error::{BatchError, EnumerationError, ManageError, Rejection, TransferError};
pub use local::LocalRoots;
pub use scheduler::{ScheduledTask, TaskOutcome, TaskStatus, UploadEvent, UploadOptions, UploadTask, Uploader};
pub use tree::{Entry, LeafDescriptor, RootSource};
