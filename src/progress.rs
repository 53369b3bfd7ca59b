//! 单个上传的进度、速率和剩余时间。

use std::time::{Duration, Instant};

/// 启动后不到这个时长不计算速率，避免刚开始时 ETA 剧烈跳动
pub const RATE_THRESHOLD: Duration = Duration::from_millis(100);

/// 两次进度事件之间的最小间隔
pub const EMIT_INTERVAL: Duration = Duration::from_millis(100);

const UNITS: [&str; 9] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressReport {
    /// 总长度未知，只能报告已发送字节
    Indeterminate { loaded: u64, elapsed: Duration },
    /// 刚开始，还没有速率
    Pending { loaded: u64, total: u64 },
    Measured {
        loaded: u64,
        total: u64,
        elapsed: Duration,
        /// 字节/秒
        rate: f64,
        /// 速率为 0 时无法估计
        eta: Option<Duration>,
    },
}

impl ProgressReport {
    pub fn loaded(&self) -> u64 {
        match *self {
            ProgressReport::Indeterminate { loaded, .. }
            | ProgressReport::Pending { loaded, .. }
            | ProgressReport::Measured { loaded, .. } => loaded,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match *self {
            ProgressReport::Indeterminate { .. } => None,
            ProgressReport::Pending { loaded, total } | ProgressReport::Measured { loaded, total, .. } => {
                if total == 0 {
                    Some(100.0)
                } else {
                    Some(loaded as f64 / total as f64 * 100.0)
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started_at: Instant,
    last_emit: Option<Instant>,
    latest: Option<ProgressReport>,
}

impl ProgressTracker {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            last_emit: None,
            latest: None,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn latest(&self) -> Option<ProgressReport> {
        self.latest
    }

    /// 记录一个 `(已发送, 总长度, 时间点)` 采样
    pub fn sample(&mut self, loaded: u64, total: Option<u64>, at: Instant) -> ProgressReport {
        let elapsed = at.saturating_duration_since(self.started_at);
        let report = match total {
            None => ProgressReport::Indeterminate { loaded, elapsed },
            Some(total) if elapsed <= RATE_THRESHOLD => ProgressReport::Pending { loaded, total },
            Some(total) => {
                let rate = loaded as f64 / elapsed.as_secs_f64();
                let remaining = total.saturating_sub(loaded) as f64;
                // 速率为 0 或结果超出 `Duration` 范围时不给 ETA
                let eta = (rate > 0.0)
                    .then(|| Duration::try_from_secs_f64(remaining / rate).ok())
                    .flatten();
                ProgressReport::Measured {
                    loaded,
                    total,
                    elapsed,
                    rate,
                    eta,
                }
            }
        };
        self.latest = Some(report);
        report
    }

    /// 节流：距上次发出不足 [`EMIT_INTERVAL`] 时跳过，最后一个采样总是发出
    pub fn should_emit(&mut self, at: Instant, last: bool) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(previous) => at.saturating_duration_since(previous) >= EMIT_INTERVAL,
        };
        if due || last {
            self.last_emit = Some(at);
            true
        } else {
            false
        }
    }
}

/// 1023 -> `1023 B`，1536 -> `1.5 KiB`
pub fn format_bytes(bytes: u64) -> String {
    format_size(bytes as f64)
}

pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}

fn format_size(bytes: f64) -> String {
    let bytes = if bytes.is_finite() { bytes.max(0.0) } else { 0.0 };
    // log2 对 2 的幂是精确的，floor(log2 / 10) 即 floor(log(bytes) / log(1024))
    let exp = if bytes > 0.0 {
        (bytes.log2() / 10.0).floor().clamp(0.0, (UNITS.len() - 1) as f64) as usize
    } else {
        0
    };
    let value = bytes / 1024f64.powi(exp as i32);
    if exp == 0 {
        format!("{} {}", value.round() as u64, UNITS[exp])
    } else {
        format!("{:.1} {}", (value * 10.0).round() / 10.0, UNITS[exp])
    }
}

/// `H:MM:SS`、`M:SS` 或 `5.0s`
pub fn format_duration(seconds: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    if seconds >= 3600.0 {
        let whole = seconds as u64;
        format!("{}:{:02}:{:02}", whole / 3600, whole % 3600 / 60, whole % 60)
    } else if seconds >= 60.0 {
        let whole = seconds as u64;
        format!("{}:{:02}", whole / 60, whole % 60)
    } else {
        format!("{:.1}s", seconds)
    }
}

/// 单行进度：`42% 1.5 MiB/s 3.0 MiB/7.1 MiB 2.0s/4.8s`
pub fn progress_line(report: &ProgressReport) -> String {
    match *report {
        ProgressReport::Indeterminate { loaded, elapsed } => {
            format!("uploading {} ({})", format_bytes(loaded), format_duration(elapsed.as_secs_f64()))
        }
        ProgressReport::Pending { loaded, total } => {
            format!("uploading {}/{}", format_bytes(loaded), format_bytes(total))
        }
        ProgressReport::Measured {
            loaded,
            total,
            elapsed,
            rate,
            eta,
        } => {
            let spent = elapsed.as_secs_f64();
            let all = match eta {
                Some(eta) => format_duration(spent + eta.as_secs_f64()),
                None => "?".to_string(),
            };
            format!(
                "{:.0}% {} {}/{} {}/{}",
                report.percent().unwrap_or_default(),
                format_rate(rate),
                format_bytes(loaded),
                format_bytes(total),
                format_duration(spent),
                all
            )
        }
    }
}
