use std::io;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("reader already closed")]
    AlreadyClosed,

    #[error("close upstream error: {source}")]
    Close {
        #[from]
        source: io::Error,
    },
}

impl SplitError {
    pub fn close<E: Into<io::Error>>(e: E) -> Self {
        Self::Close { source: e.into() }
    }

    pub fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed)
    }
}

impl From<SplitError> for io::Error {
    fn from(e: SplitError) -> Self {
        match e {
            SplitError::Close { source } => source,
            e @ SplitError::AlreadyClosed => io::Error::other(e),
        }
    }
}

/// An upstream read failure, shared by every reader of a split.
///
/// Readers report it as the payload of an [`io::Error`] of the same kind. The error upstream
/// returned is kept whole and is reachable through [`UpstreamError::get_ref`].
#[derive(Error, Debug, Clone)]
#[error(transparent)]
pub struct UpstreamError(Arc<io::Error>);

impl UpstreamError {
    pub fn new(e: io::Error) -> Self {
        Self(Arc::new(e))
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.0.kind()
    }

    pub fn get_ref(&self) -> &io::Error {
        &self.0
    }
}
