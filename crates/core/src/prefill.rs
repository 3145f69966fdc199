/// 下一轮助手回复的预填内容（单槽位、只消费一次）。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefill {
    pending: Option<String>,
}

impl Prefill {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置预填内容：去掉尾部空白后覆盖尚未消费的旧值；空内容等同于清空。
    pub fn set(&mut self, text: &str) {
        let trimmed = text.trim_end_matches([' ', '\t', '\n', '\r']);
        self.pending = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }

    /// 取出并清空当前值；这是读取预填内容的唯一途径。
    pub fn take_for_turn(&mut self) -> Option<String> {
        self.pending.take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
