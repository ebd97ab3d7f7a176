//! rowpipe CLI - parallel single-table copy between databases.

use clap::Parser;
use rowpipe::{Config, CopyEngine, PipeError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "rowpipe")]
#[command(about = "Parallel single-table copy between databases")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "rowpipe.yaml")]
    config: PathBuf,

    /// Override number of parallel workers
    #[arg(long)]
    degree: Option<usize>,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), PipeError> {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);
    if cli.degree.is_some() {
        config.copy.degree = cli.degree;
    }

    let summary = CopyEngine::new(config).run().await?;

    println!("\nCopy {}", if summary.success() { "completed!" } else { "finished with failures" });
    println!("  Rows: {}/{}", summary.rows_copied, summary.row_count);
    println!("  Workers: {}", summary.degree);
    println!("  Duration: {:.2}s", summary.elapsed.as_secs_f64());
    for w in summary.workers.iter().filter(|w| w.error.is_some()) {
        println!(
            "  Worker {} failed on [{}, {}): {}",
            w.worker,
            w.start,
            w.end,
            w.error.as_deref().unwrap_or("")
        );
    }

    match summary.workers.iter().find(|w| w.error.is_some()) {
        None => Ok(()),
        Some(w) => Err(PipeError::worker(
            w.worker,
            w.error.clone().unwrap_or_default(),
        )),
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
