//! `wsym-cli`: wires `wsym-module`'s cache and `wsym-rpc`'s dispatcher into
//! the `wsym-server` binary (spec.md §6).
//!
//! Factored out of `src/bin/wsym-server.rs` so integration tests can drive
//! the dispatcher over in-memory streams instead of spawning a process.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use wsym_module::ModuleCache;
use wsym_rpc::Dispatcher;

pub fn serve(
    search_paths: Vec<PathBuf>,
    keep_temp_modules: bool,
    scratch_pad_pages: u32,
    input: impl BufRead,
    output: impl Write,
) -> anyhow::Result<()> {
    let cache = ModuleCache::new(search_paths, keep_temp_modules);
    let mut dispatcher = Dispatcher::new(cache, scratch_pad_pages);
    wsym_rpc::run(&mut dispatcher, input, output)
}
