//! localagent command line
//!
//! One-shot when a message is given, otherwise a line REPL. Ctrl-C cancels
//! the running turn; in `ask` mode confirmations are answered on stdin.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::{pin_mut, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use localagent::agent::{Conversation, Engine, HistoryStore, TurnEvent};
use localagent::config::{EngineConfig, SafeMode};
use localagent::model::OllamaBackend;
use localagent::runtime::{ExecutionStatus, OutputSegment};
use localagent::safety::{ChannelConfirmer, PendingConfirmation};
use localagent::tracing::{init_tracing, shutdown_tracing, DEFAULT_OTLP_ENDPOINT};
use localagent::{FileHistoryStore, MemoryHistoryStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "localagent", version, about = "Let a local language model run code on this machine")]
struct Cli {
    /// JSON configuration file
    #[arg(long, short, env = "LOCALAGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Conversation to continue; a new one is created when omitted
    #[arg(long)]
    conversation: Option<String>,

    /// Override the safe mode (off, ask, auto)
    #[arg(long)]
    safe_mode: Option<SafeMode>,

    /// Export spans over OTLP
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_OTLP_ENDPOINT)]
    otlp: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    /// Directory for saved conversations
    #[arg(long, conflicts_with = "no_history")]
    history_dir: Option<PathBuf>,

    /// Keep conversations in memory only
    #[arg(long)]
    no_history: bool,

    /// Print runtime health as JSON and exit
    #[arg(long)]
    health: bool,

    /// Message to run; starts a REPL when empty
    message: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_tracing("localagent", cli.otlp.as_deref(), cli.json_logs) {
        eprintln!("[localagent] failed to initialize tracing: {e}");
    }

    let result = run(cli).await;
    shutdown_tracing();
    if let Err(e) = result {
        eprintln!("[localagent] {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(mode) = cli.safe_mode {
        config.safety.mode = mode;
    }

    let history: Arc<dyn HistoryStore> = if cli.no_history {
        Arc::new(MemoryHistoryStore::new())
    } else {
        match &cli.history_dir {
            Some(dir) => Arc::new(FileHistoryStore::new(dir)?),
            None => Arc::new(FileHistoryStore::default_store()?),
        }
    };

    let backend = Arc::new(OllamaBackend::from_config(&config.model)?);
    let (confirmer, mut confirmations) = ChannelConfirmer::new(1);
    let engine = Engine::new(config, backend, Arc::new(confirmer), history)?;

    if cli.health {
        let report = engine.health().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        engine.shutdown().await;
        return Ok(());
    }

    let conversation = cli
        .conversation
        .clone()
        .unwrap_or_else(|| Conversation::generate().id);
    let mut lines = stdin_lines();

    if !cli.message.is_empty() {
        let message = cli.message.join(" ");
        run_one(&engine, &conversation, &message, &mut confirmations, &mut lines).await;
    } else {
        println!("[localagent] conversation {conversation} (safe mode: {})", engine.config().safety.mode);
        println!("[localagent] /reset clears the conversation, /health shows runtimes, /exit quits");
        loop {
            print!("> ");
            let _ = std::io::stdout().flush();
            let line = tokio::select! {
                line = lines.recv() => line,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };
            match line.trim() {
                "" => continue,
                "/exit" | "/quit" => break,
                "/reset" => {
                    engine.reset_conversation(&conversation).await?;
                    println!("[localagent] conversation reset");
                }
                "/health" => {
                    let report = engine.health().await;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                message => {
                    run_one(&engine, &conversation, message, &mut confirmations, &mut lines).await;
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Run one turn, printing events as they arrive
async fn run_one(
    engine: &Engine,
    conversation: &str,
    message: &str,
    confirmations: &mut mpsc::Receiver<PendingConfirmation>,
    lines: &mut mpsc::Receiver<String>,
) {
    let events = engine.run_turn(conversation, message);
    pin_mut!(events);
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => print_event(&event),
                Some(Err(e)) => eprintln!("\n[ERROR] {e}"),
                None => break,
            },
            Some(pending) = confirmations.recv() => ask(pending, lines).await,
            _ = tokio::signal::ctrl_c() => {
                if engine.cancel_turn(conversation) {
                    eprintln!("\n[localagent] cancelling...");
                }
            }
        }
    }
}

async fn ask(pending: PendingConfirmation, lines: &mut mpsc::Receiver<String>) {
    let block = &pending.request.block;
    println!("\n[SAFETY] {} ({})", pending.request.reason, block.language);
    println!("[SAFETY] Run this code? [y/N] ");
    let _ = std::io::stdout().flush();
    match lines.recv().await.as_deref().map(str::trim) {
        Some("y") | Some("Y") | Some("yes") => pending.approve(),
        _ => pending.deny(Some("declined at the prompt".to_string())),
    }
}

fn print_event(event: &TurnEvent) {
    match event {
        TurnEvent::Routed(decision) => {
            tracing::debug!(path = decision.path.as_str(), "Routed");
        }
        TurnEvent::AssistantDelta(text) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        TurnEvent::ParseIssue(issue) => eprintln!("\n[PARSE] {issue}"),
        TurnEvent::Block(block) => {
            println!("\n┌─ {} block {} ─────────────────────────", block.language, block.ordinal);
            for line in block.source.lines() {
                println!("│ {line}");
            }
            println!("├─ output ─────────────────────────────────");
        }
        TurnEvent::Safety { .. } => {}
        TurnEvent::Output { segment, .. } => match segment {
            OutputSegment::Text(line) => println!("│ {line}"),
            OutputSegment::Error(line) => println!("│ [stderr] {line}"),
            OutputSegment::Image { mime, data_base64 } => {
                println!("│ [image {mime}, {} bytes base64]", data_base64.len())
            }
        },
        TurnEvent::Result(result) => {
            let mark = match result.status {
                ExecutionStatus::Success => "✅",
                _ => "❌",
            };
            let truncated = if result.truncated { ", output truncated" } else { "" };
            println!(
                "└─ {mark} {} ({} ms{truncated})",
                result.status, result.duration_ms
            );
        }
        TurnEvent::Warning(warning) => eprintln!("\n[WARN] {warning:?}"),
        TurnEvent::Done(summary) => {
            println!(
                "\n[localagent] done: {} ({} model calls, {} blocks)",
                summary.reason.as_str(),
                summary.turns,
                summary.blocks
            );
        }
    }
}

/// Stdin lines, shared by the REPL and confirmation prompts
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}
