//! 会话运行：单次补全与交互式循环。
//!
//! 取消令牌分两层：会话令牌贯穿整个会话，每轮生成使用它的子令牌。
//! 第一次 Ctrl-C 只取消当前这一轮；1 秒内再按一次（或空闲时按下）结束会话。

use std::{
    collections::VecDeque,
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines, Stdin},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::CompletionError,
    history::{HistoryStore, LoadOutcome},
    message::Role,
    orchestrator::Orchestrator,
    title::TitleGenerator,
};

const DOUBLE_INTERRUPT_WINDOW: Duration = Duration::from_secs(1);
const PROMPT: &str = ">>> ";

/// 交互循环中单行输入的处理结果（非成功分支）。
#[derive(Debug, Error)]
pub enum LoopError {
    /// 空输入，重新提示。
    #[error("empty input")]
    EmptyInput,
    /// `/last`：把上一条用户消息交还给输入端编辑。
    #[error("use last message")]
    UseLastMessage(String),
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// 行输入源。
pub trait InputSource: Send {
    /// 读取下一行；`Ok(None)` 表示输入结束。
    fn next_line(&mut self) -> BoxFuture<'_, io::Result<Option<String>>>;
}

/// 从标准输入逐行读取。
pub struct StdinLines {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinLines {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinLines {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSource for StdinLines {
    fn next_line(&mut self) -> BoxFuture<'_, io::Result<Option<String>>> {
        Box::pin(self.lines.next_line())
    }
}

/// 预先准备好的输入行。
#[derive(Debug, Default)]
pub struct ScriptedInput {
    lines: VecDeque<String>,
}

impl ScriptedInput {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

impl InputSource for ScriptedInput {
    fn next_line(&mut self) -> BoxFuture<'_, io::Result<Option<String>>> {
        let line = self.lines.pop_front();
        Box::pin(async move { Ok(line) })
    }
}

/// 一次中断的处理结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    CancelledTurn,
    EndedSession,
}

#[derive(Debug, Default)]
struct InterruptState {
    turn: Option<CancellationToken>,
    last: Option<Instant>,
}

/// 中断（Ctrl-C）控制器。
#[derive(Debug)]
pub struct Interrupts {
    session: CancellationToken,
    state: Mutex<InterruptState>,
}

impl Interrupts {
    pub fn new(session: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            session,
            state: Mutex::new(InterruptState::default()),
        })
    }

    pub fn session(&self) -> &CancellationToken {
        &self.session
    }

    /// 开始新一轮，返回本轮令牌（会话令牌的子令牌）。
    pub fn begin_turn(&self) -> CancellationToken {
        let turn = self.session.child_token();
        self.lock().turn = Some(turn.clone());
        turn
    }

    pub fn end_turn(&self) {
        self.lock().turn = None;
    }

    /// 处理一次中断：有进行中的轮次则只取消该轮；1 秒内的第二次中断或空闲时的中断结束会话。
    pub fn interrupt(&self) -> InterruptAction {
        let now = Instant::now();
        let mut state = self.lock();
        let repeated = state
            .last
            .is_some_and(|last| now.duration_since(last) < DOUBLE_INTERRUPT_WINDOW);
        state.last = Some(now);

        match state.turn.as_ref() {
            Some(turn) if !repeated && !turn.is_cancelled() => {
                turn.cancel();
                InterruptAction::CancelledTurn
            }
            _ => {
                self.session.cancel();
                InterruptAction::EndedSession
            }
        }
    }

    /// 监听 Ctrl-C，直到会话结束。
    pub fn listen_for_ctrl_c(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.session.cancelled() => break,
                    signal = tokio::signal::ctrl_c() => {
                        if signal.is_err() || self.interrupt() == InterruptAction::EndedSession {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InterruptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 会话：编排器 + 历史存储 + 标题生成。
pub struct Session {
    orchestrator: Orchestrator,
    history: HistoryStore,
    titles: Arc<dyn TitleGenerator>,
    streaming: bool,
    stderr: Box<dyn Write + Send>,
}

impl Session {
    pub fn new(
        orchestrator: Orchestrator,
        history: HistoryStore,
        titles: Arc<dyn TitleGenerator>,
        streaming: bool,
    ) -> Self {
        Self {
            orchestrator,
            history,
            titles,
            streaming,
            stderr: Box::new(io::stderr()),
        }
    }

    /// 替换提示/告警输出（默认标准错误）。
    pub fn with_stderr(mut self, stderr: Box<dyn Write + Send>) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator {
        &mut self.orchestrator
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// 准备会话初始状态：先设系统提示，再加载历史。
    ///
    /// 历史文件自带 System 消息时以文件为准，否则保留这里给出的系统提示。
    pub fn restore(
        &mut self,
        system_prompt: Option<&str>,
        history_in: Option<&Path>,
    ) -> Option<LoadOutcome> {
        if let Some(system_prompt) = system_prompt {
            self.orchestrator.set_system_prompt(system_prompt);
        }
        history_in.map(|source| self.load_history(source))
    }

    /// 加载历史并立即写回输出文件。
    pub fn load_history(&mut self, source: &Path) -> LoadOutcome {
        let outcome = self.history.load(source, self.orchestrator.log_mut());
        self.history.save(self.orchestrator.log());
        outcome
    }

    fn pending_user_turn(&self) -> bool {
        self.orchestrator
            .log()
            .last()
            .is_some_and(|message| message.role == Role::User)
    }

    /// 生成一轮回复，补一个换行并写盘。
    async fn turn(&mut self, cancel: &CancellationToken) -> Result<String, CompletionError> {
        let result = self.orchestrator.generate(cancel, self.streaming).await;
        if !matches!(result, Err(CompletionError::EmptyResponse)) {
            self.orchestrator.write_output("\n");
        }
        self.history.save(self.orchestrator.log());
        result
    }

    /// 单次模式：日志以用户消息结尾时生成一次。
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), CompletionError> {
        if !self.pending_user_turn() {
            self.history.save(self.orchestrator.log());
            return Ok(());
        }
        self.turn(cancel).await.map(|_| ())
    }

    /// 处理交互循环中的一行输入。
    pub async fn process(&mut self, cancel: &CancellationToken, input: &str) -> Result<(), LoopError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(LoopError::EmptyInput);
        }
        if input == "/last" {
            return match self.orchestrator.log().last_user_text() {
                Some(text) => Err(LoopError::UseLastMessage(text)),
                None => {
                    self.note("No previous message to edit.");
                    Err(LoopError::EmptyInput)
                }
            };
        }
        if let Some(prefill) = input.strip_prefix("/prefill ") {
            self.orchestrator.set_prefill(prefill);
            self.note("Prefill set for the next reply.");
            return Ok(());
        }

        self.orchestrator.add_user_message(input);
        self.turn(cancel).await?;
        Ok(())
    }

    /// 交互模式。输入结束或会话令牌被取消时退出，退出前写盘并按标题重命名。
    pub async fn run_interactive(
        &mut self,
        interrupts: &Interrupts,
        input: &mut dyn InputSource,
    ) -> Result<()> {
        self.note(
            "Running in continuous mode. Ctrl+C interrupts a reply, Ctrl+C twice or Ctrl+D exits. /last offers your previous message for resending.",
        );

        if self.pending_user_turn() {
            let turn = interrupts.begin_turn();
            let initial = self.turn(&turn).await;
            interrupts.end_turn();
            self.report(initial.map(|_| ()).map_err(LoopError::from));
        }

        // `/last` 交还的消息：下一行为空时原样重发。
        let mut offered: Option<String> = None;
        loop {
            if interrupts.session().is_cancelled() {
                break;
            }
            let _ = write!(self.stderr, "{PROMPT}");
            let _ = self.stderr.flush();

            let line = tokio::select! {
                biased;
                _ = interrupts.session().cancelled() => break,
                line = input.next_line() => line.context("failed to read input")?,
            };
            let Some(line) = line else {
                break;
            };
            let line = match offered.take() {
                Some(previous) if line.trim().is_empty() => previous,
                _ => line,
            };

            let turn = interrupts.begin_turn();
            let result = self.process(&turn, &line).await;
            interrupts.end_turn();
            offered = self.report(result);
        }

        let _ = writeln!(self.stderr);
        self.finish().await;
        Ok(())
    }

    /// 会话收尾：写盘，再用独立令牌按标题重命名（标题生成自带超时）。
    pub async fn finish(&mut self) {
        self.history.save(self.orchestrator.log());
        let cancel = CancellationToken::new();
        self.history
            .rename(self.orchestrator.log(), self.titles.as_ref(), &cancel)
            .await;
    }

    /// 向用户报告一轮的结果；`/last` 时返回交还的消息。
    fn report(&mut self, result: Result<(), LoopError>) -> Option<String> {
        match result {
            Ok(()) | Err(LoopError::EmptyInput) => {}
            Err(LoopError::UseLastMessage(text)) => {
                self.note(&format!(
                    "Last message (press Enter to send it again, or type an edited version):\n{text}"
                ));
                return Some(text);
            }
            Err(LoopError::Completion(CompletionError::Cancelled)) => {
                self.note("Response interrupted. Press Ctrl+C again to exit.");
            }
            Err(LoopError::Completion(error)) => {
                let _ = writeln!(self.stderr, "parley: error: {error}");
            }
        }
        None
    }

    fn note(&mut self, message: &str) {
        let _ = writeln!(self.stderr, "\x1b[38;5;240mparley: {message}\x1b[0m");
    }
}

/// 第一轮输入的来源：文件（`-` 表示标准输入）、字符串、位置参数。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSpec {
    pub files: Vec<String>,
    pub strings: Vec<String>,
    pub args: Vec<String>,
}

impl InputSpec {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.strings.is_empty() && self.args.is_empty()
    }

    /// 按“文件、字符串、参数”的顺序拼接全部输入；位置参数之间用空格分隔。
    pub async fn read_all(&self) -> Result<String> {
        let mut input = String::new();
        for file in &self.files {
            if file == "-" {
                let mut stdin = String::new();
                tokio::io::stdin()
                    .read_to_string(&mut stdin)
                    .await
                    .context("failed to read stdin")?;
                input.push_str(&stdin);
            } else {
                let text = tokio::fs::read_to_string(file)
                    .await
                    .with_context(|| format!("failed to read input file: {file}"))?;
                input.push_str(&text);
            }
        }
        for text in &self.strings {
            input.push_str(text);
        }
        input.push_str(&self.args.join(" "));
        Ok(input)
    }
}
