//! 会话消息与消息日志。

use std::fmt;

/// 消息角色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// 结构化历史文件中使用的角色名。
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "human",
            Role::Assistant => "ai",
        }
    }

    /// 解析角色名（大小写不敏感），兼容常见别名。
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Role::System),
            "user" | "human" => Some(Role::User),
            "ai" | "assistant" | "model" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息内容片段。
///
/// 封闭的和类型：新增片段类型时，所有 `match` 都必须显式处理。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
}

impl ContentPart {
    pub fn kind(&self) -> &'static str {
        match self {
            ContentPart::Text(_) => "text",
        }
    }
}

/// 一条带角色的消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// 拼接全部文本片段。
    pub fn content(&self) -> String {
        let mut content = String::new();
        for part in &self.parts {
            match part {
                ContentPart::Text(text) => content.push_str(text),
            }
        }
        content
    }
}

/// 按时间顺序排列的会话消息。
///
/// 不变量：
/// - 至多一条 System 消息，且位于下标 0；
/// - 去除首尾空白后为空的内容不会被追加。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 追加用户消息；空白输入不做任何事。返回是否追加。
    pub fn add_user(&mut self, text: &str) -> bool {
        self.push_non_blank(Role::User, text)
    }

    /// 追加助手消息；空白输入不做任何事。返回是否追加。
    pub fn add_assistant(&mut self, text: &str) -> bool {
        self.push_non_blank(Role::Assistant, text)
    }

    /// 设置系统提示：已存在且内容不同则原地更新，否则插入到下标 0。
    pub fn set_system_prompt(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                if first.content() != text {
                    *first = Message::system(text);
                }
            }
            _ => self.messages.insert(0, Message::system(text)),
        }
    }

    pub fn system_prompt(&self) -> Option<String> {
        self.messages
            .first()
            .filter(|message| message.role == Role::System)
            .map(Message::content)
    }

    /// 最近一条用户消息的文本。
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(Message::content)
    }

    /// 用磁盘上加载的消息整体替换当前日志。
    ///
    /// 加载前已存在的系统提示：若加载结果自带 System 消息则丢弃，否则保留在下标 0。
    /// 加载结果中位置不对或重复的 System 消息会被归一，只保留第一条并移到开头。
    pub fn replace_with_loaded(&mut self, loaded: Vec<Message>) {
        let previous_system = self.system_prompt();

        let mut system = None;
        let mut rest = Vec::with_capacity(loaded.len());
        for message in loaded {
            if message.role == Role::System {
                if system.is_none() {
                    system = Some(message);
                }
            } else {
                rest.push(message);
            }
        }

        self.messages = rest;
        match (system, previous_system) {
            (Some(system), _) => self.messages.insert(0, system),
            (None, Some(previous)) => self.set_system_prompt(&previous),
            (None, None) => {}
        }
    }

    fn push_non_blank(&mut self, role: Role, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        self.messages.push(Message::text(role, text));
        true
    }
}
