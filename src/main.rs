use clap::{Parser, Subcommand};
use prediction_indexer::config::Config;
use prediction_indexer::supervisor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "prediction-indexer")]
#[command(about = "Prediction market ingestion: historical backfill, live stream, fan-out")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the historical backfill daemon (main + recent-scan workers)
    History,
    /// Run the live pipeline with the websocket fan-out server
    Realtime,
    /// Process a closed epoch range once and exit
    Process {
        /// First epoch to process (inclusive)
        #[arg(long)]
        from: u64,
        /// Last epoch to process (inclusive)
        #[arg(long)]
        to: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,prediction_indexer=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let outcome = match cli.command {
        Command::History => supervisor::run_history(cfg).await,
        Command::Realtime => supervisor::run_realtime(cfg).await,
        Command::Process { from, to } => match supervisor::run_process_range(cfg, from, to).await {
            Ok(report) => {
                println!(
                    "processed epochs {from}..={to}: {} committed, {} skipped, {} failed",
                    report.committed, report.skipped, report.failed
                );
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = outcome {
        tracing::error!(error = %e, "daemon terminated with error");
        std::process::exit(2);
    }
}
