//! 配置文件与默认值。
//!
//! 优先级：默认值 < 配置文件 < 环境变量 / 命令行参数（后两者由 CLI 合并）。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::CountMode;
use crate::error::ConfigError;
use crate::local::DEFAULT_PAGE_SIZE;
use crate::scheduler::UploadOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upload: UploadSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub base_url: Option<String>,
    /// 不设置时不限并发
    pub max_in_flight: Option<usize>,
    /// 上传前先单独计数一遍
    pub count_first: bool,
    pub send_last_modified: bool,
    pub page_size: usize,
    pub connect_timeout_secs: Option<u64>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            max_in_flight: None,
            count_first: true,
            send_last_modified: true,
            page_size: DEFAULT_PAGE_SIZE,
            connect_timeout_secs: Some(10),
        }
    }
}

impl UploadSettings {
    pub fn options(&self) -> UploadOptions {
        UploadOptions {
            max_in_flight: self.max_in_flight,
            send_last_modified: self.send_last_modified,
        }
    }

    pub fn count_mode(&self) -> CountMode {
        if self.count_first {
            CountMode::Prepass
        } else {
            CountMode::Incremental
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `RUST_LOG` 存在时优先
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// 没有配置文件时使用默认值
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let upload = &self.upload;
        if upload.page_size == 0 {
            return Err(ConfigError::Invalid("upload.page_size must be at least 1".into()));
        }
        if upload.max_in_flight == Some(0) {
            return Err(ConfigError::Invalid("upload.max_in_flight must be at least 1".into()));
        }
        if let Some(url) = &upload.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "upload.base_url must be an http(s) URL, got `{}`",
                    url
                )));
            }
        }
        Ok(())
    }
}
