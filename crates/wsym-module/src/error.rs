//! Error taxonomy for the symbol server, mirroring §7's three wire-visible
//! categories. Everything else in the workspace returns `anyhow::Result`
//! (the teacher's convention for library/CLI-facing fallible code) and is
//! folded into [`SymbolServerError::Internal`] at the crate boundary that
//! talks to `wsym-rpc`.

#[derive(Debug, thiserror::Error)]
pub enum SymbolServerError {
    /// The requested module, location, or variable does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself was malformed (bad params, unknown method).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Anything else: codegen failure, I/O error, DWARF parse failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SymbolServerError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        SymbolServerError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for SymbolServerError {
    fn from(err: anyhow::Error) -> Self {
        SymbolServerError::Internal(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, SymbolServerError>;
