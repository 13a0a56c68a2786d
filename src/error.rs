use std::io;

use thiserror::Error;

/// Everything that can go wrong in either phase. All errors are fatal to the
/// current invocation; the entry point turns them into a one-line diagnostic.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse ELF record: {0}")]
    ParseElf(String),

    #[error("invalid ELF: {0}")]
    InvalidElf(String),

    #[error("{0}")]
    AsmSyntax(String),

    #[error("{0}")]
    AsmSizeMismatch(String),

    #[error("symbol lookup failed: {0}")]
    SymbolLookup(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Config(String),
}

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::ParseElf(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
