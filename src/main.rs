use std::io::Write;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use opspilot::agent_core::ToolOutcome;
use opspilot::{find_config_path, load_config, ConversationEngine, EngineEvent, QueryResult};

/// Capacity of the streaming event channel.
const EVENT_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "opspilot")]
#[command(
    author,
    version,
    about = "Ask natural-language questions about cluster state and audit history"
)]
struct Cli {
    /// Path to opspilot.yaml.
    config: String,

    /// The question to answer.
    question: String,

    /// Print the answer as it is generated.
    #[arg(long)]
    stream: bool,

    /// Extra context appended to the question.
    #[arg(long)]
    context: Option<String>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    opspilot::init_tracing(cli.json_logs);

    let path = find_config_path(Some(&cli.config))?;
    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    let mut engine = ConversationEngine::from_config(&config)?;

    let outcome = if cli.stream {
        run_streaming(&mut engine, &cli.question, cli.context.as_deref()).await
    } else {
        engine
            .execute_query(&cli.question, cli.context.as_deref())
            .await
            .map(|result| {
                println!("{}", result.response);
                result
            })
            .map_err(anyhow::Error::from)
    };

    engine.close().await;

    let result = outcome?;
    print_tool_trail(&result);
    Ok(())
}

async fn run_streaming(
    engine: &mut ConversationEngine,
    question: &str,
    context: Option<&str>,
) -> anyhow::Result<QueryResult> {
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Text { content } => {
                    let _ = write!(stdout, "{content}");
                    let _ = stdout.flush();
                }
                EngineEvent::ToolCall { invocation } => {
                    eprintln!("\n→ {}", invocation.name);
                }
                EngineEvent::ToolResult { outcome } => {
                    eprintln!("{}", trail_line(&outcome));
                }
                EngineEvent::Done { .. } => {
                    let _ = writeln!(stdout);
                }
            }
        }
    });

    let result = engine.execute_query_stream(question, context, tx).await;
    printer.await.context("stream printer task failed")?;
    Ok(result?)
}

fn print_tool_trail(result: &QueryResult) {
    if result.tool_results.is_empty() {
        return;
    }
    eprintln!("\ntools used:");
    for outcome in &result.tool_results {
        eprintln!("{}", trail_line(outcome));
    }
}

fn trail_line(outcome: &ToolOutcome) -> String {
    match (&outcome.error, outcome.success) {
        (_, true) => format!("  [ok] {} ({} ms)", outcome.name, outcome.duration_ms),
        (Some(error), false) => format!(
            "  [failed] {} ({} ms): {error}",
            outcome.name, outcome.duration_ms
        ),
        (None, false) => format!("  [failed] {} ({} ms)", outcome.name, outcome.duration_ms),
    }
}
