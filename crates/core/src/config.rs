//! 配置：`~/.parley/config.toml`（可选）+ 命令行覆盖。

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::{encoding::read_utf8_text_with_report, model::GenerateOptions, model::RetryConfig};

const APP_DIR: &str = ".parley";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `dummy | openai | openai-api | codex | claude | gemini`
    pub backend: String,
    pub model: Option<String>,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub system_prompt: Option<String>,
    /// 单次生成超时（秒），0 表示不限。
    pub completion_timeout_secs: u64,
    pub stream: bool,
    pub history_dir: Option<PathBuf>,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        let options = GenerateOptions::default();
        Self {
            backend: "claude".to_string(),
            model: None,
            api_url: None,
            api_key: None,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            system_prompt: None,
            completion_timeout_secs: 0,
            stream: true,
            history_dir: None,
            retry: RetryConfig::default(),
        }
    }
}

/// 命令行给出的覆盖项；`None` 表示沿用配置文件。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub api_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
    pub completion_timeout_secs: Option<u64>,
    pub stream: Option<bool>,
    pub history_dir: Option<PathBuf>,
}

impl Config {
    /// 读取配置。
    ///
    /// 显式给出的路径必须存在；默认路径不存在时使用默认值。空文件等同默认值。
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    bail!("config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let (text, report) = read_utf8_text_with_report(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        if report.has_warning() {
            for warning in report.warnings_for(&path) {
                eprintln!("parley: config encoding warning: {warning}");
            }
        }
        Self::from_toml(&text).with_context(|| format!("failed to parse config: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(text)?)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(model) = overrides.model {
            self.model = Some(model);
        }
        if let Some(api_url) = overrides.api_url {
            self.api_url = Some(api_url);
        }
        if let Some(max_tokens) = overrides.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(temperature) = overrides.temperature {
            self.temperature = temperature;
        }
        if let Some(system_prompt) = overrides.system_prompt {
            self.system_prompt = Some(system_prompt);
        }
        if let Some(timeout) = overrides.completion_timeout_secs {
            self.completion_timeout_secs = timeout;
        }
        if let Some(stream) = overrides.stream {
            self.stream = stream;
        }
        if let Some(history_dir) = overrides.history_dir {
            self.history_dir = Some(history_dir);
        }
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        (self.completion_timeout_secs > 0).then(|| Duration::from_secs(self.completion_timeout_secs))
    }

    /// 历史目录：配置值，否则 `~/.parley/history`。
    pub fn history_dir(&self) -> PathBuf {
        match &self.history_dir {
            Some(dir) => dir.clone(),
            None => app_dir().join("history"),
        }
    }

    /// 事件日志目录：与历史目录同级的 `logs`。
    pub fn log_dir(&self) -> PathBuf {
        let history = self.history_dir();
        match history.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("logs"),
            _ => PathBuf::from("logs"),
        }
    }
}

/// `~/.parley`；取不到家目录时退回当前目录下的 `.parley`。
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(APP_DIR))
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_DIR).join("config.toml"))
}
