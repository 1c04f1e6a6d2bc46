use clap::Parser;
use procmux::{Chunk, OpEngineFactory, Runtime, RuntimeSettings};
use serde::Serialize;
use std::io::{self, Read};

/// Run a procmux script as the initial process and emit a JSON run report.
#[derive(Parser, Debug)]
#[command(name = "procmux-cli", about = "Run a procmux script and emit a JSON run report")]
struct Args {
    /// Read the script from a file instead of stdin
    #[arg(long)]
    file: Option<std::path::PathBuf>,

    /// Worker threads (default: 4)
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Idle interpreters kept for reuse (default: 0)
    #[arg(long, default_value_t = 0)]
    recycle: usize,
}

#[derive(Serialize)]
struct RunReport {
    workers: usize,
    idle_interpreters: usize,
    cached_chunks: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    // Read the script source.
    let source = if let Some(path) = args.file {
        std::fs::read_to_string(&path).unwrap_or_else(|e| {
            eprintln!("Error reading file: {e}");
            std::process::exit(1);
        })
    } else {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).unwrap_or_else(|e| {
            eprintln!("Error reading stdin: {e}");
            std::process::exit(1);
        });
        buf
    };

    let settings = RuntimeSettings {
        workers: args.workers,
        recycle_max: args.recycle,
        ..RuntimeSettings::default()
    };
    let runtime = Runtime::new(settings, Box::new(OpEngineFactory::new()))
        .unwrap_or_else(|e| {
            eprintln!("Error starting runtime: {e}");
            std::process::exit(1);
        });

    if let Err(e) = runtime.new_process(Chunk::Source(source)) {
        eprintln!("Error loading script: {e}");
        std::process::exit(1);
    }
    runtime.wait();

    let report = RunReport {
        workers: runtime.workers(),
        idle_interpreters: runtime.idle_interpreters(),
        cached_chunks: runtime.cached_chunks(),
    };
    let json = serde_json::to_string(&report).expect("RunReport is always serializable");
    println!("{json}");
}
