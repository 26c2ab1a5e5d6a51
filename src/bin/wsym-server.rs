//! The `wsym-server` daemon (spec.md §6): parses CLI flags, builds the
//! module cache, and runs the line-framed JSON-RPC loop over stdin/stdout.

use std::io::{self, BufReader};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Symbol server for debugging WebAssembly modules with DWARF debug info.
#[derive(Parser, Debug)]
#[command(name = "wsym-server", version)]
struct Args {
    /// Appends a directory to the module search path used to resolve
    /// `addRawModule`'s relative `url`s. May be repeated.
    #[arg(short = 'I', value_name = "dir")]
    search_path: Vec<PathBuf>,

    /// Keep temp files materialized from inline `addRawModule` payloads
    /// instead of deleting them when their cache entry is dropped.
    #[arg(long)]
    keep_temp_modules: bool,

    /// Size, in 64KiB Wasm pages, of each generated formatter's scratch
    /// pad (not in spec.md; parameterizes what the original left implicit
    /// in the debuggee's `sbrk`/`__heap_base` assumptions).
    #[arg(long, default_value_t = wsym_rpc::dispatcher::DEFAULT_SCRATCH_PAD_PAGES)]
    scratch_pad_pages: u32,

    /// Increase log verbosity (may be repeated).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(io::stderr)
        .init();

    let stdin = io::stdin();
    let stdout = io::stdout();
    wsym_cli::serve(
        args.search_path,
        args.keep_temp_modules,
        args.scratch_pad_pages,
        BufReader::new(stdin.lock()),
        stdout.lock(),
    )
}
