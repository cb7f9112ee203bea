use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;

#[derive(Parser, Debug)]
#[command(name = "strider-cli")]
#[command(about = "Random access frame extraction from H.264/HEVC MP4 files")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GlobalOpts {
    /// JSON output format (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable progress bar output (useful for scripts/CI)
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a video index for an MP4 file
    Index(commands::index::IndexArgs),
    /// Show video index metadata
    Info(commands::info::InfoArgs),
    /// Decode selected frames to JPEG files
    Extract(commands::extract::ExtractArgs),
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.global.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Index(args) => commands::index::run(&cli.global, args),
        Commands::Info(args) => commands::info::run(&cli.global, args),
        Commands::Extract(args) => commands::extract::run(&cli.global, args),
    }
}
