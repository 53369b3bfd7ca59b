use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 非 2xx 响应：状态码、状态文本和响应体
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status} {status_text}{}", body_suffix(.body))]
pub struct Rejection {
    pub status: u16,
    pub status_text: String,
    pub body: String,
}

impl Rejection {
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        // 读不到响应体时只保留状态行
        let body = response.text().await.unwrap_or_default();
        Self {
            status: status.as_u16(),
            status_text,
            body,
        }
    }
}

/// `404 Not Found — <body>`，响应体为空时省略后半段
pub fn status_line(status: u16, status_text: &str, body: &str) -> String {
    format!("{} {}{}", status, status_text, body_suffix(body))
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(" — {}", body)
    }
}

#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unreadable entry `{name}`: {reason}")]
    Unreadable { name: String, reason: String },

    #[error("directory cursor for `{0}` was already exhausted")]
    Exhausted(String),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to open {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("upload task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("terminal report with no remaining uploads (expected {expected})")]
    Underflow { expected: u64 },

    #[error("batch is sealed, no more uploads can be registered")]
    Sealed,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    #[error(transparent)]
    Gate(#[from] GateError),
}

#[derive(Debug, Error)]
pub enum ManageError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid request method {0}")]
    Method(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}
