//! Agentic Pipeline - Entry Point
//!
//! Runs one intent end-to-end and prints the run report as JSON on stdout.
//! Logs go to stderr.

use agentic_pipeline::agent::FailureMode;
use agentic_pipeline::{Config, Orchestrator};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn print_usage() {
    println!("Agentic Pipeline v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: agentic-pipeline [OPTIONS] <intent...>");
    println!();
    println!("Options:");
    println!("  --json-logs          Log to stderr as JSON");
    println!("  --abort-on-failure   Stop at the first failed step");
    println!("  --help, -h           Show this help");
    println!();
    println!("Environment variables:");
    println!("  AGENTIC_PROVIDER     anthropic | openai | offline (default: anthropic)");
    println!("  ANTHROPIC_API_KEY    Claude API key");
    println!("  OPENAI_API_KEY       OpenAI API key");
    println!("  AGENTIC_PLANNER      template | llm (default: template)");
    println!("  AGENTIC_SEARCH_URL   JSON search endpoint for search_web");
    println!("  AGENTIC_CACHE_BACKEND memory | redis (default: memory)");
    println!("  REDIS_URL            Redis URL for the shared cache");
    println!("  AGENTIC_CACHE_TTL    Default cache TTL in seconds");
    println!("  AGENTIC_POLICY_PATH  TOML governor policy");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().skip(1).collect();
    let json_logs = args.iter().any(|a| a == "--json-logs");
    let abort_on_failure = args.iter().any(|a| a == "--abort-on-failure");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    let intent = args
        .iter()
        .filter(|a| !a.starts_with("--") && a.as_str() != "-h")
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");

    if help_mode {
        print_usage();
        return Ok(());
    }

    if intent.trim().is_empty() {
        print_usage();
        std::process::exit(2);
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    // stdout carries the report, so logs always go to stderr
    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Agentic Pipeline v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if abort_on_failure {
        config.failure_mode = FailureMode::Abort;
    }

    let orchestrator = Orchestrator::from_config(&config).await?;
    let report = orchestrator.run(&intent, None).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.aborted {
        std::process::exit(1);
    }

    Ok(())
}
