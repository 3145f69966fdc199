use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::encoding::append_utf8_json_line;

/// 统一结构化日志事件（JSON Line）。
///
/// 用 `trace_id` 串起一次 `generate` 调用内的全部事件，便于按 trace_id 过滤。
/// 字段只做向后兼容扩展。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 一次生成开始。
    GenerationStart {
        ts: String,
        trace_id: String,
        model: String,
        streaming: bool,
        prefill: bool,
        messages: usize,
    },
    /// 一次生成结束（成功、取消或失败）。
    GenerationEnd {
        ts: String,
        trace_id: String,
        ok: bool,
        cancelled: bool,
        committed_len: usize,
        duration_ms: u128,
        error: Option<String>,
    },
    /// 错误分类结果。
    ErrorClassified {
        ts: String,
        category: String,
        status_code: Option<u16>,
        provider_error_code: Option<String>,
        retryable: bool,
        summary: String,
    },
    /// 计划重试。
    RetryScheduled {
        ts: String,
        attempt: u32,
        backoff_ms: u128,
        reason: String,
    },
    /// 重试用尽。
    RetryExhausted {
        ts: String,
        attempts: u32,
        last_error: String,
    },
    /// 历史已写盘。
    HistorySaved {
        ts: String,
        path: String,
        messages: usize,
    },
    /// 历史已加载。
    HistoryLoaded {
        ts: String,
        path: String,
        format: String,
        messages: usize,
    },
    /// 历史相关的可恢复问题（写盘失败、无法解析、rename 失败等）。
    HistoryWarning {
        ts: String,
        path: String,
        message: String,
    },
    /// 历史文件已按标题重命名。
    HistoryRenamed {
        ts: String,
        from: String,
        to: String,
    },
}

/// 事件接收端。
///
/// 由调用方在构造 Orchestrator / HistoryStore 时注入，测试可替换为内存实现。
pub trait EventSink: Send + Sync {
    fn record(&self, event: SessionEvent);
}

/// 丢弃所有事件。
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: SessionEvent) {}
}

/// 在内存中保留全部事件，主要用于测试断言。
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SessionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: SessionEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// 按天滚动的 JSON Line 文件日志：`<dir>/events-YYYYMMDD.log`。
///
/// 写入失败不影响主流程，只在第一次失败时向标准错误输出提示一次。
#[derive(Debug)]
pub struct JsonLineSink {
    dir: PathBuf,
    warned: AtomicBool,
}

impl JsonLineSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            warned: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 当天的日志文件路径。
    pub fn daily_log_path(&self) -> PathBuf {
        let filename = format!("events-{}.log", Local::now().format("%Y%m%d"));
        self.dir.join(filename)
    }

    fn write(&self, event: &SessionEvent) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        append_utf8_json_line(&self.daily_log_path(), &json)
    }
}

impl EventSink for JsonLineSink {
    fn record(&self, event: SessionEvent) {
        if let Err(error) = self.write(&event)
            && !self.warned.swap(true, Ordering::Relaxed)
        {
            eprintln!(
                "parley: failed to write event log {} (ignored): {error}",
                self.daily_log_path().display()
            );
        }
    }
}

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 生成一个新的 trace_id：unix 时间戳 + 单调计数器，十六进制。
pub fn new_trace_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:x}{:x}", now.as_secs(), now.subsec_nanos(), counter)
}

/// 事件时间戳（本地时区，RFC 3339）。
pub fn ts() -> String {
    Local::now().to_rfc3339()
}
