//! 一次上传批次的剩余计数与完成信号。
//!
//! 计数在批次被 `seal` 之前不会触发完成：展开还没结束时，已发出的上传先跑完
//! 也不能算整批完成。`seal` 之后剩余计数归零的那一刻触发一次，且只触发一次。

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::GateError;
use crate::scheduler::TaskOutcome;

/// 批次结束时的统计。有上传失败时完成信号照样触发，由 `any_failed` 区分。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub expected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub any_failed: bool,
}

type CompleteFn = Box<dyn FnOnce(BatchSummary) + Send>;

#[derive(Default)]
struct GateState {
    expected: u64,
    remaining: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    sealed: bool,
    fired: bool,
    on_complete: Option<CompleteFn>,
}

impl GateState {
    fn summary(&self) -> BatchSummary {
        BatchSummary {
            expected: self.expected,
            succeeded: self.succeeded,
            failed: self.failed,
            cancelled: self.cancelled,
            any_failed: self.failed > 0 || self.cancelled > 0,
        }
    }

    /// 满足条件时标记已触发并交出回调，回调在锁外执行
    fn take_completion(&mut self) -> Option<(BatchSummary, Option<CompleteFn>)> {
        if self.sealed && self.remaining == 0 && !self.fired {
            self.fired = true;
            Some((self.summary(), self.on_complete.take()))
        } else {
            None
        }
    }
}

struct Inner {
    state: Mutex<GateState>,
    done: Notify,
}

/// 多个上传任务共享的批次计数
#[derive(Clone)]
pub struct TransferBatch {
    inner: Arc<Inner>,
}

impl Default for TransferBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransferBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransferBatch")
            .field("expected", &state.expected)
            .field("remaining", &state.remaining)
            .field("sealed", &state.sealed)
            .field("fired", &state.fired)
            .finish()
    }
}

impl TransferBatch {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(GateState::default()),
                done: Notify::new(),
            }),
        }
    }

    /// 批次完成时调用一次
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: FnOnce(BatchSummary) + Send + 'static,
    {
        self.inner.state.lock().on_complete = Some(Box::new(callback));
        self
    }

    pub fn register(&self, count: u64) -> Result<(), GateError> {
        let mut state = self.inner.state.lock();
        if state.sealed {
            return Err(GateError::Sealed);
        }
        state.expected += count;
        state.remaining += count;
        debug!(count, expected = state.expected, "registered uploads");
        Ok(())
    }

    /// 计数遍之后文件树可能变小，把预期数量修正为实际发出的上传数
    pub fn reconcile(&self, actual: u64) -> Result<(), GateError> {
        let mut state = self.inner.state.lock();
        if state.sealed {
            return Err(GateError::Sealed);
        }
        if actual >= state.expected {
            let extra = actual - state.expected;
            state.expected += extra;
            state.remaining += extra;
        } else {
            let shortfall = state.expected - actual;
            state.expected = actual;
            state.remaining = state.remaining.saturating_sub(shortfall);
        }
        Ok(())
    }

    /// 不会再有新的上传登记；剩余为 0 时立即触发完成
    pub fn seal(&self) {
        let completion = {
            let mut state = self.inner.state.lock();
            state.sealed = true;
            state.take_completion()
        };
        self.finish(completion);
    }

    /// 每个上传的终态（成功、失败、取消）都调用且只调用一次
    pub fn report_terminal(&self, outcome: &TaskOutcome) -> Result<(), GateError> {
        let completion = {
            let mut state = self.inner.state.lock();
            if state.remaining == 0 {
                return Err(GateError::Underflow {
                    expected: state.expected,
                });
            }
            state.remaining -= 1;
            match outcome {
                TaskOutcome::Succeeded { .. } => state.succeeded += 1,
                TaskOutcome::Failed(_) => state.failed += 1,
                TaskOutcome::Cancelled => state.cancelled += 1,
            }
            state.take_completion()
        };
        self.finish(completion);
        Ok(())
    }

    fn finish(&self, completion: Option<(BatchSummary, Option<CompleteFn>)>) {
        if let Some((summary, callback)) = completion {
            info!(
                expected = summary.expected,
                succeeded = summary.succeeded,
                failed = summary.failed,
                cancelled = summary.cancelled,
                "batch complete"
            );
            if let Some(callback) = callback {
                callback(summary);
            }
            self.inner.done.notify_waiters();
        }
    }

    pub fn expected(&self) -> u64 {
        self.inner.state.lock().expected
    }

    pub fn remaining(&self) -> u64 {
        self.inner.state.lock().remaining
    }

    pub fn any_failed(&self) -> bool {
        self.inner.state.lock().summary().any_failed
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().fired
    }

    pub fn summary(&self) -> BatchSummary {
        self.inner.state.lock().summary()
    }

    /// 等待完成信号
    pub async fn wait(&self) -> BatchSummary {
        loop {
            // 先注册再检查状态，避免错过检查与等待之间的通知
            let notified = self.inner.done.notified();
            {
                let state = self.inner.state.lock();
                if state.fired {
                    return state.summary();
                }
            }
            notified.await;
        }
    }
}
