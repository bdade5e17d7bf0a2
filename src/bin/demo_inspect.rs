use anyhow::{Context, Result};
use clap::Parser;
use demo_chain::demo::{DemoReader, EofPolicy, MessageType, ScanOptions};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;


#[derive(Debug, Parser)]
#[command(about = "Walk a recorded demo and summarize its message stream")]
struct Args {
    /// Input demo to read (.dem)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Print every message header as it is read
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Accept demos that end without a Stop message
    #[arg(long, default_value_t = false)]
    allow_missing_stop: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let options = ScanOptions {
        eof_policy: if args.allow_missing_stop { EofPolicy::SoftEnd } else { EofPolicy::Strict },
    };
    let rdr = BufReader::new(File::open(&args.input).with_context(|| format!("open {:?}", args.input))?);
    let mut messages = DemoReader::with_options(rdr, &options).context("read demo header")?.messages();

    let mut counts: BTreeMap<MessageType, u64> = BTreeMap::new();
    let mut payload_bytes = 0u64;
    let mut last_tick = None;
    for msg in messages.by_ref() {
        let msg = msg.with_context(|| format!("after {} messages", counts.values().sum::<u64>()))?;
        *counts.entry(msg.kind).or_default() += 1;
        payload_bytes += u64::from(msg.payload_len.unwrap_or(0));
        if msg.tick >= 0 { last_tick = Some(msg.tick); }
        if args.dump {
            let kind = format!("{:?}", msg.kind);
            match msg.payload_len {
                Some(len) => println!("{:#010x} {:<12} tick={:<8} len={}", msg.offset, kind, msg.tick, len),
                None => println!("{:#010x} {:<12} tick={}", msg.offset, kind, msg.tick),
            }
        }
    }

    for (kind, n) in &counts {
        eprintln!("{:<12} {}", format!("{:?}", kind), n);
    }
    eprintln!(
        "Read {} messages ({} payload bytes), stopped at {:#x}. Last tick: {}.",
        counts.values().sum::<u64>(),
        payload_bytes,
        messages.position(),
        last_tick.map_or_else(|| "none".to_string(), |t| t.to_string())
    );
    Ok(())
}
