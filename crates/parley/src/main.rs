use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use parley_core::{
    Config, ConfigOverrides, HistoryStore, InputSpec, Interrupts, Orchestrator, Session,
    StdinLines,
    model::build_model,
    observability::{EventSink, JsonLineSink},
    title::ModelTitleGenerator,
};
use tokio_util::sync::CancellationToken;

const TITLE_TIMEOUT: Duration = Duration::from_secs(10);

/// 命令行 LLM 对话客户端。
#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Chat with an LLM from the command line")]
struct Args {
    /// Keep the conversation going after the first reply.
    #[arg(short, long)]
    continuous: bool,
    /// Input text (repeatable).
    #[arg(short, long = "input")]
    input: Vec<String>,
    /// Input file, `-` for stdin (repeatable).
    #[arg(short, long = "file")]
    file: Vec<String>,
    /// Prompt words.
    args: Vec<String>,
    #[arg(short, long)]
    system_prompt: Option<String>,
    /// Text the assistant reply starts with.
    #[arg(short, long)]
    prefill: Option<String>,
    /// dummy | openai | openai-api | codex | claude | gemini
    #[arg(short, long)]
    backend: Option<String>,
    #[arg(short, long)]
    model: Option<String>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(short = 't', long)]
    max_tokens: Option<u32>,
    #[arg(short = 'T', long)]
    temperature: Option<f64>,
    /// Request the whole reply at once instead of streaming it.
    #[arg(long)]
    no_stream: bool,
    /// Load conversation history from this file.
    #[arg(short = 'I', long)]
    history_in: Option<PathBuf>,
    /// Write conversation history to this file.
    #[arg(short = 'O', long)]
    history_out: Option<PathBuf>,
    #[arg(long)]
    history_dir: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Per-reply timeout in seconds, 0 disables it.
    #[arg(long)]
    completion_timeout: Option<u64>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            backend: self.backend.clone(),
            model: self.model.clone(),
            api_url: self.api_url.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system_prompt: self.system_prompt.clone(),
            completion_timeout_secs: self.completion_timeout,
            stream: self.no_stream.then_some(false),
            history_dir: self.history_dir.clone(),
        }
    }

    fn input_spec(&self) -> InputSpec {
        InputSpec {
            files: self.file.clone(),
            strings: self.input.clone(),
            args: self.args.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    config.apply(args.overrides());

    let events: Arc<dyn EventSink> = Arc::new(JsonLineSink::new(config.log_dir()));
    let model = build_model(&config, events.clone())?;

    let orchestrator = Orchestrator::new(model.clone(), events.clone())
        .with_options(config.generate_options())
        .with_completion_timeout(config.completion_timeout());
    let history = match &args.history_out {
        Some(path) => HistoryStore::explicit(path, events.clone()),
        None => HistoryStore::in_dir(config.history_dir(), events.clone()),
    }
    .with_metadata(Some(config.backend.clone()), config.model.clone());
    let titles = Arc::new(ModelTitleGenerator::new(model, TITLE_TIMEOUT));
    let mut session = Session::new(orchestrator, history, titles, config.stream);

    session.restore(config.system_prompt.as_deref(), args.history_in.as_deref());
    let input = args.input_spec();
    if !input.is_empty() {
        let text = input.read_all().await?;
        session.orchestrator_mut().add_user_message(&text);
    }
    if let Some(prefill) = &args.prefill {
        session.orchestrator_mut().set_prefill(prefill);
    }

    let interrupts = Interrupts::new(CancellationToken::new());
    let listener = interrupts.clone().listen_for_ctrl_c();

    if args.continuous {
        session
            .run_interactive(&interrupts, &mut StdinLines::new())
            .await?;
        listener.abort();
        return Ok(());
    }

    let turn = interrupts.begin_turn();
    let result = session.run_once(&turn).await;
    interrupts.end_turn();
    listener.abort();
    if let Err(error) = result {
        eprintln!("parley: error: {error}");
        std::process::exit(1);
    }
    Ok(())
}
