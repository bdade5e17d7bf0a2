use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use demo_chain::demo::{self, EofPolicy, ScanOptions, ScanReport};
use demo_chain::session::{self, ChainOptions};
use demo_chain::vdm;
use dotenvy::dotenv;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(version, about = "Chain Source engine demos for automated playback")]
struct Args {
    /// Accept demos that end without a Stop message
    #[arg(long, global = true, env = "DEMO_CHAIN_ALLOW_MISSING_STOP", default_value_t = false)]
    allow_missing_stop: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the last tick recorded in a demo
    Scan {
        /// Demo file (.dem)
        demo: PathBuf,

        /// Print a JSON summary instead of the bare tick
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Write the playback script for one demo
    Vdm {
        /// Demo file (.dem)
        demo: PathBuf,

        /// Demo to play next, relative to the game directory; exits when omitted
        #[arg(long)]
        next: Option<PathBuf>,
    },
    /// Write chained playback scripts for every demo in a session folder
    Chain {
        /// Folder holding the session's demos
        session_dir: PathBuf,

        /// Game directory that playdemo paths are resolved against
        #[arg(long, env = "DEMO_CHAIN_GAME_DIR")]
        game_dir: PathBuf,

        /// Scan workers (0 = one per CPU)
        #[arg(long, env = "DEMO_CHAIN_JOBS", default_value_t = 0)]
        jobs: usize,
    },
}

#[derive(Debug, Serialize)]
struct ScanSummary<'a> {
    demo: &'a Path,
    #[serde(flatten)]
    report: ScanReport,
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let scan = ScanOptions {
        eof_policy: if args.allow_missing_stop { EofPolicy::SoftEnd } else { EofPolicy::Strict },
    };

    match args.command {
        Command::Scan { demo, json } => {
            let report = demo::scan_report(&demo, &scan).with_context(|| format!("scan {:?}", demo))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ScanSummary { demo: &demo, report })?);
            } else {
                match report.last_tick {
                    Some(tick) => println!("{tick}"),
                    None => println!("none"),
                }
            }
        }
        Command::Vdm { demo, next } => {
            let end_tick = demo::scan_with(&demo, &scan).with_context(|| format!("scan {:?}", demo))?;
            let script = vdm::build(&demo, end_tick, next.as_deref()).with_context(|| format!("build script for {:?}", demo))?;
            println!("{}", script.display());
        }
        Command::Chain { session_dir, game_dir, jobs } => {
            let chained = session::chain_session(&ChainOptions { session_dir: session_dir.clone(), game_dir, jobs, scan })
                .with_context(|| format!("chain session {:?}", session_dir))?;
            for link in &chained {
                println!(
                    "{} (end tick {}) -> {}",
                    link.script.display(),
                    link.end_tick,
                    link.next.as_deref().unwrap_or("exit")
                );
            }
            eprintln!("Wrote {} scripts.", chained.len());
        }
    }
    Ok(())
}
