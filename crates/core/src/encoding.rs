use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 文本编码检查结果。
///
/// 读取历史/配置文件时若做了兼容处理，通过该结构显式告知上层。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextEncodingReport {
    /// 读取时是否检测到 UTF-8 BOM 头。
    pub had_utf8_bom: bool,
    /// 文本是否发生了行尾标准化（CRLF/CR -> LF）。
    pub normalized_line_endings: bool,
}

impl TextEncodingReport {
    /// 将编码检查结果转换为可直接展示的告警文本。
    pub fn warnings_for(&self, path: &Path) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.had_utf8_bom {
            warnings.push(format!("stripped UTF-8 BOM while reading {}", path.display()));
        }
        if self.normalized_line_endings {
            warnings.push(format!(
                "normalized CRLF/CR line endings to LF while reading {}",
                path.display()
            ));
        }
        warnings
    }

    pub fn has_warning(&self) -> bool {
        self.had_utf8_bom || self.normalized_line_endings
    }
}

/// 读取 UTF-8 文本并返回编码检查结果。
///
/// - 兼容 UTF-8 BOM；
/// - CRLF/CR 统一为 LF；
/// - 非 UTF-8 输入返回 `InvalidData`。
pub fn read_utf8_text_with_report(path: &Path) -> io::Result<(String, TextEncodingReport)> {
    let bytes = fs::read(path)?;
    decode_utf8_text(path, &bytes)
}

/// 对已读入内存的字节做与 [`read_utf8_text_with_report`] 相同的解码。
pub fn decode_utf8_text(path: &Path, bytes: &[u8]) -> io::Result<(String, TextEncodingReport)> {
    if bytes.is_empty() {
        return Ok((String::new(), TextEncodingReport::default()));
    }

    let mut report = TextEncodingReport::default();
    let text_bytes = if bytes.starts_with(&UTF8_BOM) {
        report.had_utf8_bom = true;
        &bytes[UTF8_BOM.len()..]
    } else {
        bytes
    };

    let decoded = std::str::from_utf8(text_bytes).map_err(|error| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("file is not valid UTF-8: {} ({error})", path.display()),
        )
    })?;

    let normalized = normalize_to_lf(decoded);
    report.normalized_line_endings = normalized != decoded;
    Ok((normalized, report))
}

/// 以“临时文件 + rename”的方式原子替换目标文件。
///
/// 在 rename 之前任何时刻进程被杀，目标路径都保持旧内容（或不存在）。
pub fn write_utf8_text_atomic(path: &Path, content: &str) -> io::Result<()> {
    let staged = stage_utf8_text(path, content)?;
    commit_staged_text(&staged, path)
}

/// 原子写入的第一阶段：在目标同目录写出并落盘临时文件，返回其路径。
pub fn stage_utf8_text(path: &Path, content: &str) -> io::Result<PathBuf> {
    let normalized = normalize_to_lf(content);
    let staged = staging_path_for(path);

    let mut file = fs::File::create(&staged)?;
    let written = file
        .write_all(normalized.as_bytes())
        .and_then(|()| file.sync_all());
    if let Err(error) = written {
        let _ = fs::remove_file(&staged);
        return Err(error);
    }
    Ok(staged)
}

/// 原子写入的第二阶段：把临时文件 rename 到目标路径。
pub fn commit_staged_text(staged: &Path, path: &Path) -> io::Result<()> {
    if let Err(error) = fs::rename(staged, path) {
        let _ = fs::remove_file(staged);
        return Err(error);
    }
    Ok(())
}

/// 追加一行 UTF-8 JSON Line 日志。
///
/// 输入中不允许包含换行符，保证一行一条事件。
pub fn append_utf8_json_line(path: &Path, line: &str) -> io::Result<()> {
    let normalized = normalize_to_lf(line);
    if normalized.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON line contains a newline: {}", path.display()),
        ));
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(normalized.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// 临时文件与目标同目录，保证 rename 不跨文件系统。
fn staging_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("history");
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let counter = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        ".{file_name}.{}-{nonce:x}{counter:x}.tmp",
        std::process::id()
    );
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(tmp_name),
        _ => PathBuf::from(tmp_name),
    }
}

/// 将行尾统一转换为 LF。
fn normalize_to_lf(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }

    let normalized_crlf = text.replace("\r\n", "\n");
    normalized_crlf.replace('\r', "\n")
}
