//! Variable value formatting: the shared runtime (spec.md §4.3) and the
//! per-variable code generator (spec.md §4.2).

pub mod printer;
pub mod runtime;

pub use printer::{generate_code, generate_module};
