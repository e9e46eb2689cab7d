//! The byte source a splitter reads from.
//!
//! An [`Upstream`] is an asynchronous reader that also knows how to close itself. The splitter is
//! its only owner: it pulls bytes from it on demand and closes it once, after the last split
//! reader has been closed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// A readable and closable byte stream.
pub trait Upstream: AsyncRead + Unpin + Send {
    /// Releases the stream. Called at most once by its owner.
    fn close(&mut self) -> io::Result<()>;
}

impl<U: Upstream + ?Sized> Upstream for Box<U> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Wraps a reader without close semantics; closing it always succeeds.
#[derive(Debug)]
pub struct NopClose<R> {
    inner: R,
}

impl<R> NopClose<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for NopClose<R> {
    #[inline]
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<R: AsyncRead + Unpin + Send> Upstream for NopClose<R> {
    #[inline]
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
