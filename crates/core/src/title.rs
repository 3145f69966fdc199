//! 会话标题生成，用于把默认命名的历史文件重命名为可读的名字。

use std::{sync::Arc, time::Duration};

use chrono::Local;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    message::Message,
    model::{GenerateOptions, Model},
};

const TITLE_PROMPT: &str = "Generate a kebab case title for the following conversation. \
An example is debug-rust-code or explain-quantum-mechanics. Reply with the title only.";
const TITLE_MESSAGE_LIMIT: usize = 10;
const MAX_SLUG_LEN: usize = 50;

/// 标题生成器。永不失败：出错时返回确定性的兜底标题。
pub trait TitleGenerator: Send + Sync {
    fn generate_title<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
    ) -> BoxFuture<'a, String>;
}

/// 借用会话模型生成标题。
pub struct ModelTitleGenerator {
    model: Arc<dyn Model>,
    timeout: Duration,
}

impl ModelTitleGenerator {
    pub fn new(model: Arc<dyn Model>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    async fn ask_model(&self, cancel: &CancellationToken, messages: &[Message]) -> Option<String> {
        let mut prompt = String::from(TITLE_PROMPT);
        for message in messages.iter().take(TITLE_MESSAGE_LIMIT) {
            prompt.push('\n');
            prompt.push_str(message.role.as_str());
            prompt.push_str(": ");
            prompt.push_str(&message.content());
        }

        let request = [Message::user(prompt)];
        let options = GenerateOptions {
            max_tokens: 32,
            temperature: 0.2,
        };
        let call = self.model.generate(cancel, &request, &options);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            outcome = tokio::time::timeout(self.timeout, call) => outcome.ok()?.ok()?,
        };

        let slug = slugify(response.first_content()?);
        if slug.is_empty() { None } else { Some(slug) }
    }
}

impl TitleGenerator for ModelTitleGenerator {
    fn generate_title<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        messages: &'a [Message],
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            if messages.len() < 2 {
                return "empty-chat".to_string();
            }
            match self.ask_model(cancel, messages).await {
                Some(slug) => slug,
                None => fallback_title(),
            }
        })
    }
}

/// 兜底标题：`chat-<YYYYMMDDHHMMSS>`。
pub fn fallback_title() -> String {
    format!("chat-{}", Local::now().format("%Y%m%d%H%M%S"))
}

/// 规整成文件名安全的 kebab-case：小写 ASCII 字母数字和 `-`，最长 50 个字符。
pub fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len().min(MAX_SLUG_LEN));
    let mut pending_dash = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    slug.trim_end_matches('-').to_string()
}
