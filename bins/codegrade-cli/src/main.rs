mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use codegrade_common::config::BackendKind;
use codegrade_common::types::ReportMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codegrade")]
#[command(about = "Codegrade CLI - Grade submissions locally and inspect configuration", long_about = None)]
struct Cli {
    /// Language profiles file
    #[arg(long, global = true, default_value = "config/languages.json")]
    languages: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a source file against an exercise; exits 1 unless every case passes
    Grade {
        /// Exercise file ({"exercises": [...]})
        #[arg(short, long, default_value = "config/exercises.json")]
        exercise: PathBuf,

        /// Exercise id within the file
        #[arg(short, long)]
        id: String,

        /// Language identifier (e.g., python, cpp)
        #[arg(short, long)]
        language: String,

        /// Source file to grade
        #[arg(short, long)]
        source: PathBuf,

        /// Report mode (full, fail-fast); defaults to the exercise setting
        #[arg(short, long)]
        report: Option<ReportMode>,

        /// Compile once and reuse the artifact for every case
        #[arg(long)]
        compile_once: bool,

        /// Sandbox backend (process, container)
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },

    /// List configured languages
    Languages,

    /// Check languages.json and an exercise file
    Validate {
        #[arg(short, long, default_value = "config/exercises.json")]
        exercises: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Grade {
            exercise,
            id,
            language,
            source,
            report,
            compile_once,
            backend,
        } => {
            let passed = commands::grade(commands::GradeArgs {
                languages: &cli.languages,
                exercises: &exercise,
                exercise_id: &id,
                language: &language,
                source: &source,
                report,
                compile_once,
                backend,
            })
            .await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Languages => {
            commands::list_languages(&cli.languages)?;
        }
        Commands::Validate { exercises } => {
            commands::validate(&cli.languages, &exercises)?;
        }
    }

    Ok(())
}
