use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use nexus_intake::{pipeline_from_env, IntakePipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEMO_DEBRIEF: &str = "Great call with Acme. Budget resolved today. Decision maker is \
David Chen—C-H-E-N. I'll send the SOC 2 evidence by Friday 5pm.";
const DEMO_BOOKMARK: &str = "What about SSO pricing for the pilot? Bookmark that";

#[derive(Debug, Parser)]
#[command(name = "nexus-cli")]
#[command(about = "Opportunity field reconciler command-line interface")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "NEXUS_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Seed the demo, run a debrief and a bookmark, print the resulting state
    Demo {
        #[arg(long)]
        transcript: Option<String>,
    },
    /// Ingest transcripts, then run the expiry sweep as of some hours from now
    Sweep {
        #[arg(long = "transcript")]
        transcripts: Vec<String>,
        #[arg(long, default_value_t = 24)]
        advance_hours: i64,
    },
}

fn init_tracing(log_level: &str, json_logs: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn print_json<T: serde::Serialize>(label: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).with_context(|| format!("serializing {label}"))?;
    println!("== {label}\n{text}");
    Ok(())
}

async fn run_demo(pipeline: &IntakePipeline, transcript: Option<String>) -> Result<()> {
    let outcome = pipeline
        .storytime(transcript.as_deref().unwrap_or(DEMO_DEBRIEF))
        .await?;
    println!("insight: {}", outcome.insight);
    print_json("changes", &outcome.changes)?;

    let bookmark = pipeline.bookmark(DEMO_BOOKMARK).await?;
    println!("{}: {}", bookmark.banner, bookmark.item.title);

    print_json("record", &pipeline.ledger().snapshot().await)?;
    print_json("audit", &pipeline.ledger().audit().await)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command.unwrap_or(Commands::Demo { transcript: None }) {
        Commands::Serve { port } => nexus_web::serve_from_env(port).await?,
        Commands::Demo { transcript } => {
            let pipeline = pipeline_from_env().await?;
            run_demo(&pipeline, transcript).await?;
        }
        Commands::Sweep {
            transcripts,
            advance_hours,
        } => {
            let at = TimeDelta::try_hours(advance_hours)
                .and_then(|ahead| Utc::now().checked_add_signed(ahead))
                .with_context(|| format!("advancing {advance_hours}h is out of range"))?;
            let pipeline = pipeline_from_env().await?;
            for transcript in &transcripts {
                pipeline.storytime(transcript).await?;
            }
            let promoted = pipeline.sweep_at(at).await;
            info!(promoted = promoted.len(), %at, "sweep complete");
            print_json("promoted", &promoted)?;
        }
    }

    Ok(())
}
