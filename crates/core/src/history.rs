//! 会话历史的持久化。
//!
//! 文件格式：
//! - 结构化 JSON（首选，读写）：`{"backend", "model", "messages": [{role, parts: [{type, text}]}]}`，
//!   读取时也接受裸消息数组；
//! - 旧版 `role: content` 文本（只读），成功读取后立即以结构化格式重写。
//!
//! 写盘一律“同目录临时文件 + rename”，任何时刻被杀都不会留下半截文件。
//! 持久化失败只告警，不中断会话。

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    encoding::{read_utf8_text_with_report, write_utf8_text_atomic},
    error::HistoryError,
    message::{ContentPart, Message, MessageLog, Role},
    observability::{EventSink, SessionEvent, ts},
    title::TitleGenerator,
};

const DEFAULT_PREFIX: &str = "default-history-";
const HISTORY_EXTENSION: &str = "json";
const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Serialize, Deserialize)]
struct HistoryDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<MessageRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageRecord {
    role: String,
    #[serde(default)]
    parts: Vec<PartRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryFile {
    Document(HistoryDocument),
    Bare(Vec<MessageRecord>),
}

/// 序列化为结构化 JSON。
pub fn encode_structured(
    messages: &[Message],
    backend: Option<&str>,
    model: Option<&str>,
) -> Result<String, HistoryError> {
    let records = messages
        .iter()
        .map(|message| MessageRecord {
            role: message.role.as_str().to_string(),
            parts: message
                .parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text(text) => PartRecord {
                        kind: part.kind().to_string(),
                        text: Some(text.clone()),
                    },
                })
                .collect(),
        })
        .collect();

    let document = HistoryDocument {
        backend: backend.map(str::to_string),
        model: model.map(str::to_string),
        messages: records,
    };
    let mut json = serde_json::to_string_pretty(&document)?;
    json.push('\n');
    Ok(json)
}

/// 解析结构化 JSON。未知片段类型是硬错误；内容为空的消息被丢弃。
pub fn decode_structured(text: &str) -> Result<Vec<Message>, HistoryError> {
    let file: HistoryFile =
        serde_json::from_str(text).map_err(|error| HistoryError::Decode(error.to_string()))?;
    let records = match file {
        HistoryFile::Document(document) => document.messages,
        HistoryFile::Bare(records) => records,
    };

    let mut messages = Vec::with_capacity(records.len());
    for record in records {
        let role = Role::parse(&record.role)
            .ok_or_else(|| HistoryError::Decode(format!("unknown role `{}`", record.role)))?;
        let mut parts = Vec::with_capacity(record.parts.len());
        for part in record.parts {
            match part.kind.as_str() {
                "text" => {
                    let text = part.text.ok_or_else(|| {
                        HistoryError::Decode("text part without `text` field".to_string())
                    })?;
                    parts.push(ContentPart::Text(text));
                }
                other => return Err(HistoryError::UnknownPartType(other.to_string())),
            }
        }
        let message = Message { role, parts };
        if !message.content().trim().is_empty() {
            messages.push(message);
        }
    }
    Ok(messages)
}

/// 旧版文本格式的解析结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyDecoded {
    pub messages: Vec<Message>,
    /// 被跳过的行（1 起始行号 + 原因）。
    pub skipped: Vec<(usize, String)>,
}

/// 解析旧版 `role: content` 文本：每个非空行一条消息，在第一个 `": "` 处切分。
pub fn decode_legacy(text: &str) -> Result<LegacyDecoded, HistoryError> {
    let mut decoded = LegacyDecoded {
        messages: Vec::new(),
        skipped: Vec::new(),
    };

    for (index, line) in text.lines().enumerate() {
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let Some((role, content)) = line.split_once(": ") else {
            decoded
                .skipped
                .push((line_number, "missing `role: ` separator".to_string()));
            continue;
        };
        let Some(role) = Role::parse(role) else {
            decoded
                .skipped
                .push((line_number, format!("unknown role `{}`", role.trim())));
            continue;
        };
        if content.trim().is_empty() {
            continue;
        }
        decoded.messages.push(Message::text(role, content));
    }

    if decoded.messages.is_empty() {
        return Err(HistoryError::EmptyLegacy);
    }
    Ok(decoded)
}

/// 默认文件名：`default-history-<YYYYMMDDHHMMSS>.json`。
pub fn default_file_name(stamp: &str) -> String {
    format!("{DEFAULT_PREFIX}{stamp}.{HISTORY_EXTENSION}")
}

/// 文件名是否符合默认命名规则。
pub fn is_default_file_name(name: &str) -> bool {
    let Some(stamp) = name
        .strip_prefix(DEFAULT_PREFIX)
        .and_then(|rest| rest.strip_suffix(".json"))
    else {
        return false;
    };
    stamp.len() == 14 && stamp.bytes().all(|byte| byte.is_ascii_digit())
}

/// 会话时间戳。
pub fn session_stamp() -> String {
    Local::now().format(STAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Naming {
    /// 调用方没有指定文件名，使用会话时间戳命名；会话结束时可按标题重命名。
    Default { stamp: String },
    /// 调用方显式指定的文件，从不重命名。
    Explicit,
}

/// `load` 的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Missing,
    Empty,
    Structured(usize),
    Legacy(usize),
    /// 两种格式都无法解析，日志保持不变。
    Unusable,
}

/// 历史文件存储。
pub struct HistoryStore {
    path: PathBuf,
    naming: Naming,
    backend: Option<String>,
    model: Option<String>,
    events: Arc<dyn EventSink>,
    stderr: Box<dyn Write + Send>,
}

impl HistoryStore {
    /// 在 `dir` 下使用本次会话的默认文件名。
    pub fn in_dir(dir: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self::with_stamp(dir, session_stamp(), events)
    }

    pub fn with_stamp(
        dir: impl Into<PathBuf>,
        stamp: impl Into<String>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let stamp = stamp.into();
        let path = dir.into().join(default_file_name(&stamp));
        Self::build(path, Naming::Default { stamp }, events)
    }

    /// 写入调用方指定的文件。
    pub fn explicit(path: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self::build(path.into(), Naming::Explicit, events)
    }

    fn build(path: PathBuf, naming: Naming, events: Arc<dyn EventSink>) -> Self {
        Self {
            path,
            naming,
            backend: None,
            model: None,
            events,
            stderr: Box::new(io::stderr()),
        }
    }

    /// 写入文件头中的后端/模型信息。
    pub fn with_metadata(mut self, backend: Option<String>, model: Option<String>) -> Self {
        self.backend = backend;
        self.model = model;
        self
    }

    /// 替换告警输出（默认标准错误）。
    pub fn with_stderr(mut self, stderr: Box<dyn Write + Send>) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_explicit(&self) -> bool {
        self.naming == Naming::Explicit
    }

    /// 原子写盘。空日志只确保目录存在，不写文件；返回是否写了文件。
    pub fn try_save(&self, log: &MessageLog) -> Result<bool, HistoryError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|error| HistoryError::io(parent, error))?;
        }
        if log.is_empty() {
            return Ok(false);
        }

        let json = encode_structured(
            log.messages(),
            self.backend.as_deref(),
            self.model.as_deref(),
        )?;
        write_utf8_text_atomic(&self.path, &json)
            .map_err(|error| HistoryError::io(&self.path, error))?;
        Ok(true)
    }

    /// 写盘；失败只告警。返回是否成功。
    pub fn save(&mut self, log: &MessageLog) -> bool {
        match self.try_save(log) {
            Ok(written) => {
                if written {
                    self.events.record(SessionEvent::HistorySaved {
                        ts: ts(),
                        path: self.path.display().to_string(),
                        messages: log.len(),
                    });
                }
                true
            }
            Err(error) => {
                let path = self.path.clone();
                self.warn(&path, &format!("failed to save history: {error}"));
                false
            }
        }
    }

    /// 从 `source` 加载历史，替换 `log` 并保留/归一系统提示。
    ///
    /// 文件缺失、为空或无法解析都不是错误；旧版格式读取成功后立即按结构化格式重写。
    pub fn load(&mut self, source: &Path, log: &mut MessageLog) -> LoadOutcome {
        let (text, report) = match read_utf8_text_with_report(source) {
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return LoadOutcome::Missing,
            Err(error) => {
                self.warn(source, &format!("failed to read history: {error}"));
                return LoadOutcome::Unusable;
            }
        };
        for warning in report.warnings_for(source) {
            self.events.record(SessionEvent::HistoryWarning {
                ts: ts(),
                path: source.display().to_string(),
                message: warning,
            });
        }
        if text.trim().is_empty() {
            return LoadOutcome::Empty;
        }

        let structured_error = match decode_structured(&text) {
            Ok(messages) => {
                let count = messages.len();
                log.replace_with_loaded(messages);
                self.record_loaded(source, "structured", count);
                return LoadOutcome::Structured(count);
            }
            Err(error) => error,
        };

        match decode_legacy(&text) {
            Ok(decoded) => {
                for (line, reason) in &decoded.skipped {
                    self.warn(source, &format!("skipped legacy history line {line}: {reason}"));
                }
                let count = decoded.messages.len();
                log.replace_with_loaded(decoded.messages);
                self.record_loaded(source, "legacy", count);
                self.save(log);
                LoadOutcome::Legacy(count)
            }
            Err(_) => {
                self.warn(
                    source,
                    &format!("could not parse history, starting fresh: {structured_error}"),
                );
                LoadOutcome::Unusable
            }
        }
    }

    /// 会话结束时按标题重命名默认命名的历史文件。
    ///
    /// 显式命名、已重命名或尚未写盘的文件都跳过；失败只告警。返回新路径。
    pub async fn rename(
        &mut self,
        log: &MessageLog,
        titles: &dyn TitleGenerator,
        cancel: &CancellationToken,
    ) -> Option<PathBuf> {
        let Naming::Default { stamp } = &self.naming else {
            return None;
        };
        let stamp = stamp.clone();
        let is_default = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(is_default_file_name);
        if !is_default || !self.path.exists() {
            return None;
        }

        let title = titles.generate_title(cancel, log.messages()).await;
        let target = self.rename_target(&stamp, &title);
        let from = self.path.clone();
        if let Err(error) = fs::rename(&from, &target) {
            self.warn(&from, &format!("failed to rename history file: {error}"));
            return None;
        }

        self.events.record(SessionEvent::HistoryRenamed {
            ts: ts(),
            from: from.display().to_string(),
            to: target.display().to_string(),
        });
        let shown = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let _ = writeln!(self.stderr, "parley: Renamed history to: {shown}");
        self.path = target.clone();
        Some(target)
    }

    /// `<dir>/<stamp>-<title>.json`，重名时追加序号。
    fn rename_target(&self, stamp: &str, title: &str) -> PathBuf {
        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let base = format!("{stamp}-{title}");
        let mut candidate = dir.join(format!("{base}.{HISTORY_EXTENSION}"));
        let mut suffix = 2;
        while candidate.exists() {
            candidate = dir.join(format!("{base}-{suffix}.{HISTORY_EXTENSION}"));
            suffix += 1;
        }
        candidate
    }

    fn record_loaded(&self, source: &Path, format: &str, messages: usize) {
        self.events.record(SessionEvent::HistoryLoaded {
            ts: ts(),
            path: source.display().to_string(),
            format: format.to_string(),
            messages,
        });
    }

    fn warn(&mut self, path: &Path, message: &str) {
        let _ = writeln!(self.stderr, "parley: warning: {message} ({})", path.display());
        self.events.record(SessionEvent::HistoryWarning {
            ts: ts(),
            path: path.display().to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use futures::future::BoxFuture;

    use super::*;
    use crate::{observability::MemorySink, testing::SharedBuffer};

    const STAMP: &str = "20260102030405";

    fn temp_dir() -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("parley-history-test-{nonce}"))
    }

    fn sample_log() -> MessageLog {
        let mut log = MessageLog::new();
        log.set_system_prompt("be brief");
        log.add_user("what is: a colon?");
        log.add_assistant("a punctuation mark\nwith two dots");
        log
    }

    struct FixedTitle(&'static str);

    impl TitleGenerator for FixedTitle {
        fn generate_title<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            _messages: &'a [Message],
        ) -> BoxFuture<'a, String> {
            Box::pin(async move { self.0.to_string() })
        }
    }

    #[test]
    fn structured_round_trip_preserves_messages() {
        let log = sample_log();
        let json = encode_structured(log.messages(), Some("openai"), Some("gpt-4o-mini"))
            .expect("history should encode");
        assert!(json.contains("\"role\": \"human\""));
        assert!(json.contains("\"type\": \"text\""));

        let decoded = decode_structured(&json).expect("history should decode");
        assert_eq!(decoded, log.messages());
    }

    #[test]
    fn structured_decode_accepts_bare_array_and_role_aliases() {
        let decoded = decode_structured(
            r#"[{"role":"user","parts":[{"type":"text","text":"q"}]},
                {"role":"Assistant","parts":[{"type":"text","text":"a"}]}]"#,
        )
        .expect("bare array should decode");
        assert_eq!(decoded, vec![Message::user("q"), Message::assistant("a")]);
    }

    #[test]
    fn unknown_part_type_is_a_named_error() {
        let error = decode_structured(
            r#"{"messages":[{"role":"human","parts":[{"type":"image_url","url":"x"}]}]}"#,
        )
        .expect_err("unknown part type should fail");
        assert!(matches!(error, HistoryError::UnknownPartType(kind) if kind == "image_url"));
    }

    #[test]
    fn legacy_decode_splits_at_first_separator() {
        let decoded = decode_legacy(
            "system: be brief\nUSER: what is: a colon?\n\nnot a message\ntool: ignored\nai: a mark\n",
        )
        .expect("legacy history should decode");

        assert_eq!(
            decoded.messages,
            vec![
                Message::system("be brief"),
                Message::user("what is: a colon?"),
                Message::assistant("a mark"),
            ]
        );
        assert_eq!(decoded.skipped.len(), 2);
        assert_eq!(decoded.skipped[0].0, 4);
    }

    #[test]
    fn legacy_decode_without_messages_fails() {
        assert!(matches!(
            decode_legacy("nothing useful here\n"),
            Err(HistoryError::EmptyLegacy)
        ));
    }

    #[test]
    fn default_name_pattern() {
        assert!(is_default_file_name(&default_file_name(STAMP)));
        assert!(!is_default_file_name("default-history-2026.json"));
        assert!(!is_default_file_name("20260102030405-debug-rust.json"));
        assert!(!is_default_file_name("notes.json"));
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = temp_dir();
        let events = Arc::new(MemorySink::new());
        let mut store = HistoryStore::with_stamp(&dir, STAMP, events.clone());
        let log = sample_log();
        assert!(store.save(&log));
        assert_eq!(store.path(), dir.join("default-history-20260102030405.json"));

        let mut restored = MessageLog::new();
        let outcome = store.load(&dir.join(default_file_name(STAMP)), &mut restored);
        assert_eq!(outcome, LoadOutcome::Structured(3));
        assert_eq!(restored, log);
        assert!(
            events
                .events()
                .iter()
                .any(|event| matches!(event, SessionEvent::HistorySaved { messages: 3, .. }))
        );
    }

    #[test]
    fn saving_empty_log_only_creates_directory() {
        let dir = temp_dir();
        let store = HistoryStore::with_stamp(&dir, STAMP, Arc::new(MemorySink::new()));
        let written = store
            .try_save(&MessageLog::new())
            .expect("empty save should succeed");
        assert!(!written);
        assert!(dir.is_dir());
        assert!(!store.path().exists());
    }

    #[test]
    fn replacement_and_zero_width_chars_survive_save_and_load() {
        let dir = temp_dir();
        let mut store = HistoryStore::with_stamp(&dir, STAMP, Arc::new(MemorySink::new()));
        let mut log = MessageLog::new();
        log.add_user("zero\u{FEFF}width");
        log.add_assistant("decode \u{FFFD} glitch");

        let written = store.try_save(&log).expect("save should succeed");
        assert!(written);

        let path = store.path().to_path_buf();
        let mut restored = MessageLog::new();
        let outcome = store.load(&path, &mut restored);
        assert_eq!(outcome, LoadOutcome::Structured(2));
        assert_eq!(restored, log);
    }

    #[test]
    fn save_replaces_file_without_leaving_temp_files() {
        let dir = temp_dir();
        let store = HistoryStore::explicit(dir.join("chat.json"), Arc::new(MemorySink::new()));
        let mut log = sample_log();
        store.try_save(&log).expect("first save should succeed");
        log.add_user("follow-up");
        store.try_save(&log).expect("second save should succeed");

        let text = fs::read_to_string(store.path()).expect("history should be readable");
        assert_eq!(
            decode_structured(&text).expect("history should decode").len(),
            4
        );
        let leftovers = fs::read_dir(&dir)
            .expect("dir should be listable")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn legacy_file_is_imported_then_upgraded() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).expect("dir should be created");
        let legacy = dir.join("old.txt");
        fs::write(&legacy, "user: hello\r\nassistant: hi there\r\n").expect("fixture written");

        let stderr = SharedBuffer::new();
        let mut store = HistoryStore::explicit(dir.join("old.json"), Arc::new(MemorySink::new()))
            .with_stderr(Box::new(stderr.clone()));
        let mut log = MessageLog::new();
        assert_eq!(store.load(&legacy, &mut log), LoadOutcome::Legacy(2));
        assert_eq!(log.messages()[1], Message::assistant("hi there"));

        let upgraded = fs::read_to_string(store.path()).expect("upgraded file should exist");
        assert_eq!(
            decode_structured(&upgraded).expect("upgraded history should be structured"),
            log.messages()
        );
        assert!(stderr.contents().is_empty());
    }

    #[test]
    fn unusable_file_leaves_log_untouched() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).expect("dir should be created");
        let broken = dir.join("broken.json");
        fs::write(&broken, "{ not json").expect("fixture written");

        let stderr = SharedBuffer::new();
        let mut store = HistoryStore::explicit(dir.join("out.json"), Arc::new(MemorySink::new()))
            .with_stderr(Box::new(stderr.clone()));
        let mut log = MessageLog::new();
        log.add_user("keep me");

        assert_eq!(store.load(&broken, &mut log), LoadOutcome::Unusable);
        assert_eq!(log.len(), 1);
        assert!(stderr.contents().contains("could not parse history"));
    }

    #[test]
    fn missing_file_is_a_no_op() {
        let dir = temp_dir();
        let mut store = HistoryStore::explicit(dir.join("out.json"), Arc::new(MemorySink::new()));
        let mut log = MessageLog::new();
        assert_eq!(
            store.load(&dir.join("absent.json"), &mut log),
            LoadOutcome::Missing
        );
        assert!(log.is_empty());
    }

    #[test]
    fn loading_keeps_existing_system_prompt_when_file_has_none() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).expect("dir should be created");
        let source = dir.join("in.json");
        let mut previous = MessageLog::new();
        previous.add_user("q");
        previous.add_assistant("a");
        fs::write(
            &source,
            encode_structured(previous.messages(), None, None).expect("fixture should encode"),
        )
        .expect("fixture written");

        let mut store = HistoryStore::explicit(dir.join("out.json"), Arc::new(MemorySink::new()));
        let mut log = MessageLog::new();
        log.set_system_prompt("from flags");
        store.load(&source, &mut log);

        assert_eq!(log.system_prompt().as_deref(), Some("from flags"));
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn default_named_history_is_renamed_once() {
        let dir = temp_dir();
        let stderr = SharedBuffer::new();
        let mut store = HistoryStore::with_stamp(&dir, STAMP, Arc::new(MemorySink::new()))
            .with_stderr(Box::new(stderr.clone()));
        let log = sample_log();
        store.save(&log);

        let renamed = store
            .rename(&log, &FixedTitle("colon-basics"), &CancellationToken::new())
            .await
            .expect("default history should be renamed");
        assert_eq!(renamed, dir.join("20260102030405-colon-basics.json"));
        assert!(renamed.exists());
        assert!(!dir.join(default_file_name(STAMP)).exists());
        assert!(stderr.contents().contains("Renamed history to: 20260102030405-colon-basics.json"));

        let again = store
            .rename(&log, &FixedTitle("other"), &CancellationToken::new())
            .await;
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn explicit_history_is_never_renamed() {
        let dir = temp_dir();
        let path = dir.join(default_file_name(STAMP));
        let mut store = HistoryStore::explicit(&path, Arc::new(MemorySink::new()));
        let log = sample_log();
        store.save(&log);

        let renamed = store
            .rename(&log, &FixedTitle("ignored"), &CancellationToken::new())
            .await;
        assert!(renamed.is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn rename_avoids_clobbering_existing_file() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).expect("dir should be created");
        fs::write(dir.join("20260102030405-dup.json"), "{}").expect("fixture written");

        let mut store = HistoryStore::with_stamp(&dir, STAMP, Arc::new(MemorySink::new()))
            .with_stderr(Box::new(SharedBuffer::new()));
        let log = sample_log();
        store.save(&log);
        let renamed = store
            .rename(&log, &FixedTitle("dup"), &CancellationToken::new())
            .await
            .expect("rename should succeed");
        assert_eq!(renamed, dir.join("20260102030405-dup-2.json"));
    }
}
