use thiserror::Error;

use crate::Word;

/// Everything that can go wrong while loading or running bytecode.
///
/// Loader errors abort the load and surface to the caller; the partially
/// constructed module is left reset. Runtime faults terminate the offending
/// thread only, the environment keeps ticking.
#[derive(Debug, Error)]
pub enum Error {
    #[error("read error: {0}")]
    Read(String),

    #[error("unrecognised bytecode magic 0x{0:08X}")]
    BadFormat(u32),

    #[error("bytecode truncated: {0}")]
    Truncated(&'static str),

    #[error("bad {id} chunk: {reason}")]
    BadChunk { id: String, reason: &'static str },

    #[error("unresolved import {name:?}")]
    UnresolvedImport { name: String },

    #[error("divide by zero at code index {0}")]
    DivideByZero(u32),

    #[error("data stack underflow at code index {0}")]
    StackUnderflow(u32),

    #[error("data stack overflow at code index {0}")]
    StackOverflow(u32),

    #[error("branch out of code range: {0}")]
    BadBranch(u32),

    #[error("unknown call-func index {0}")]
    BadCallFunc(Word),

    #[error("call-func failed: {0}")]
    CallFunc(String),
}

impl Error {
    /// True for faults contained to a single thread.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Error::DivideByZero(_)
                | Error::StackUnderflow(_)
                | Error::StackOverflow(_)
                | Error::BadBranch(_)
                | Error::BadCallFunc(_)
                | Error::CallFunc(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Read(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
