use anyhow::Error;
use serde::{Deserialize, Serialize};

use super::RequestCancelled;

/// 标准化错误分类。
///
/// 把各家 provider/网关返回的异构错误体归一为稳定语义，重试层只看分类，不看文案。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthError,
    RateLimited,
    TransientNetwork,
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::TransientNetwork => "transient_network",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// 只有限流和瞬时网络故障值得重试。
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimited | ErrorCategory::TransientNetwork
        )
    }
}

/// 分类结果详情。
///
/// 保留 status/provider code/摘要文案，便于日志直接展示分类依据。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
    pub provider_error_code: Option<String>,
    pub summary: String,
}

impl ClassifiedError {
    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

/// 错误分类器。
#[derive(Debug, Default, Clone)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(&self, error: &Error) -> ClassifiedError {
        let message = format!("{error:#}");
        let summary = first_line_summary(&message, 200);

        if error.chain().any(|cause| cause.is::<RequestCancelled>()) {
            return ClassifiedError {
                category: ErrorCategory::Cancelled,
                status_code: None,
                provider_error_code: None,
                summary,
            };
        }

        let normalized = message.to_ascii_lowercase();
        let status_code = extract_status_code(&normalized);
        let provider_error_code = extract_provider_error_code(&normalized);
        let category = classify_category(&normalized, status_code, provider_error_code.as_deref());

        ClassifiedError {
            category,
            status_code,
            provider_error_code,
            summary,
        }
    }
}

fn classify_category(
    normalized: &str,
    status_code: Option<u16>,
    provider_error_code: Option<&str>,
) -> ErrorCategory {
    if is_auth_error(normalized, status_code, provider_error_code) {
        return ErrorCategory::AuthError;
    }
    if is_rate_limited(normalized, status_code, provider_error_code) {
        return ErrorCategory::RateLimited;
    }
    if is_transient_network(normalized, status_code) {
        return ErrorCategory::TransientNetwork;
    }
    ErrorCategory::Unknown
}

fn is_auth_error(
    normalized: &str,
    status_code: Option<u16>,
    provider_error_code: Option<&str>,
) -> bool {
    if matches!(status_code, Some(401 | 403)) {
        return true;
    }

    if has_any(
        normalized,
        &[
            "unauthorized",
            "forbidden",
            "invalid api key",
            "invalid_api_key",
            "authentication failed",
            "api key is not configured",
            "permission denied",
        ],
    ) {
        return true;
    }

    provider_error_code.is_some_and(|code| {
        has_any(
            code,
            &[
                "invalid_api_key",
                "unauthorized",
                "forbidden",
                "authentication_error",
            ],
        )
    })
}

fn is_rate_limited(
    normalized: &str,
    status_code: Option<u16>,
    provider_error_code: Option<&str>,
) -> bool {
    if status_code == Some(429) {
        return true;
    }

    if has_any(
        normalized,
        &[
            "rate limit",
            "rate_limited",
            "too many requests",
            "overloaded",
        ],
    ) {
        return true;
    }

    provider_error_code
        .is_some_and(|code| has_any(code, &["rate_limit", "rate_limited", "too_many_requests"]))
}

fn is_transient_network(normalized: &str, status_code: Option<u16>) -> bool {
    if matches!(status_code, Some(408 | 500 | 502 | 503 | 504)) {
        return true;
    }

    has_any(
        normalized,
        &[
            "timeout",
            "timed out",
            "connection reset",
            "connection refused",
            "temporary failure",
            "temporarily unavailable",
            "dns",
            "network is unreachable",
            "broken pipe",
            "unexpected eof",
            "gateway timeout",
            "connection aborted",
        ],
    )
}

fn extract_status_code(normalized: &str) -> Option<u16> {
    for marker in ["\"status\":", "status code", "status="] {
        if let Some(code) = extract_status_after_marker(normalized, marker) {
            return Some(code);
        }
    }

    normalized
        .split(|ch: char| !ch.is_ascii_digit())
        .find_map(|token| {
            if token.len() != 3 {
                return None;
            }
            let value = token.parse::<u16>().ok()?;
            (400..=599).contains(&value).then_some(value)
        })
}

fn extract_status_after_marker(normalized: &str, marker: &str) -> Option<u16> {
    let index = normalized.find(marker)?;
    let suffix = normalized.get(index + marker.len()..)?;
    let digits = suffix
        .chars()
        .skip_while(|ch| !ch.is_ascii_digit())
        .take_while(|ch| ch.is_ascii_digit())
        .collect::<String>();
    if digits.len() != 3 {
        return None;
    }
    let value = digits.parse::<u16>().ok()?;
    (400..=599).contains(&value).then_some(value)
}

fn extract_provider_error_code(normalized: &str) -> Option<String> {
    for marker in ["\"code\":\"", "\"code\": \"", "code="] {
        if let Some(value) = extract_token_after_marker(normalized, marker) {
            return Some(value);
        }
    }
    None
}

fn extract_token_after_marker(text: &str, marker: &str) -> Option<String> {
    let index = text.find(marker)?;
    let suffix = text.get(index + marker.len()..)?;
    let token = suffix
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        .collect::<String>();
    if token.is_empty() { None } else { Some(token) }
}

fn first_line_summary(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text).trim();
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let mut shortened = first_line
        .chars()
        .take(max_chars.saturating_sub(2))
        .collect::<String>();
    shortened.push_str("..");
    shortened
}

fn has_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| text.contains(needle))
}
