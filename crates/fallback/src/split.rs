//! Lazy fan-out of one upstream byte stream into several independent readers.
//!
//! [`split`] turns a single [`Upstream`] into `n` [`SplitReader`]s. Each reader, read to
//! exhaustion, yields exactly the upstream content in order, whatever the relative pace of the
//! other readers.
//!
//! # Design
//!
//! - Upstream is only read when a reader asks for bytes beyond the high-water mark, and only for
//!   the shortfall. Every byte is pulled from upstream exactly once, however many readers exist.
//! - Upstream is read into a scratch buffer owned by the split, and only the bytes received are
//!   copied into a chunk. The chunk is queued on every live reader as a reference-counted
//!   [`Bytes`], so the memory held is bounded by the gap between the fastest and the slowest live
//!   reader, whatever the size of the reads asking for it.
//! - End of stream and upstream errors are recorded once and surfaced to a reader only after it
//!   drained its own queue, so no reader loses bytes it was entitled to.
//! - Readers live in an arena of slots. Closing a reader frees its slot's queue; closing the last
//!   live reader closes upstream. A reader dropped without being closed closes itself.
//! - Upstream only keeps the waker of the reader that polled it last. A reader that finds
//!   upstream not ready parks its own waker in its slot, and parked readers are woken whenever
//!   another reader makes upstream progress, stops waiting on upstream, or closes. Readers of one
//!   split can therefore be driven from different tasks.
//!
//! Readers also implement [`http_body::Body`], so a handler can consume its request body either
//! as an [`AsyncRead`] or frame by frame.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker, ready};

use bytes::{Buf, Bytes, BytesMut};
use http_body::{Body, Frame};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, trace, warn};

use crate::error::{SplitError, UpstreamError};
use crate::upstream::Upstream;

/// Default capacity of a frame produced when a [`SplitReader`] is polled as a [`Body`].
pub const DEFAULT_FRAME_SIZE: usize = 8 * 1024;

/// Options applied to every reader of one split.
#[derive(Debug, Clone, Copy)]
pub struct SplitOptions {
    frame_size: usize,
}

impl SplitOptions {
    pub fn new() -> Self {
        Self { frame_size: DEFAULT_FRAME_SIZE }
    }

    /// Sets the buffer size used for each [`Body`] frame, at least one byte.
    pub fn frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size.max(1);
        self
    }
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `upstream` into `n` readers with default options.
pub fn split<U: Upstream>(upstream: U, n: usize) -> Vec<SplitReader<U>> {
    split_with(upstream, n, SplitOptions::default())
}

/// Splits `upstream` into `n` readers.
///
/// Splitting into zero readers closes `upstream` right away.
pub fn split_with<U: Upstream>(upstream: U, n: usize, options: SplitOptions) -> Vec<SplitReader<U>> {
    let shared = Shared::new_shared(upstream, n);
    (0..n).map(|id| SplitReader::new(id, Arc::clone(&shared), options)).collect()
}

/// Splits `upstream` into a fixed number of readers.
pub fn split_array<U: Upstream, const N: usize>(upstream: U) -> [SplitReader<U>; N] {
    let shared = Shared::new_shared(upstream, N);
    std::array::from_fn(|id| SplitReader::new(id, Arc::clone(&shared), SplitOptions::default()))
}

#[derive(Debug)]
enum Terminal {
    Eof,
    Failed(UpstreamError),
}

impl Terminal {
    fn to_result(&self) -> io::Result<()> {
        match self {
            Terminal::Eof => Ok(()),
            Terminal::Failed(e) => Err(io::Error::new(e.kind(), e.clone())),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    live: bool,
    bytes_read: u64,
    pending: VecDeque<Bytes>,
    waker: Option<Waker>,
}

impl Slot {
    fn live() -> Self {
        Self { live: true, ..Self::default() }
    }

    fn park(&mut self, waker: &Waker) {
        match &mut self.waker {
            Some(parked) if parked.will_wake(waker) => {}
            parked => *parked = Some(waker.clone()),
        }
    }

    fn buffered(&self) -> usize {
        self.pending.iter().map(Bytes::len).sum()
    }

    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        let mut copied = 0;
        while buf.remaining() > 0 {
            let Some(front) = self.pending.front_mut() else {
                break;
            };

            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                self.pending.pop_front();
            }
            copied += n;
        }

        self.bytes_read += copied as u64;
        copied
    }
}

struct Shared<U> {
    upstream: U,
    scratch: Vec<u8>,
    high_water_mark: u64,
    upstream_reads: u64,
    slots: Vec<Slot>,
    active: usize,
    terminal: Option<Terminal>,
}

impl<U: Upstream> Shared<U> {
    fn new_shared(mut upstream: U, n: usize) -> Arc<Mutex<Self>> {
        if n == 0 {
            debug!("split into zero readers, closing upstream");
            if let Err(e) = upstream.close() {
                warn!(cause = %e, "failed to close upstream");
            }
        }

        let slots = (0..n).map(|_| Slot::live()).collect();
        Arc::new(Mutex::new(Self { upstream, scratch: Vec::new(), high_water_mark: 0, upstream_reads: 0, slots, active: n, terminal: None }))
    }

    fn is_live(&self, id: usize) -> bool {
        self.slots[id].live
    }

    fn poll_read(&mut self, id: usize, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.slots[id].live {
            return Poll::Ready(Err(SplitError::AlreadyClosed.into()));
        }

        self.slots[id].waker = None;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let target = self.slots[id].bytes_read + buf.remaining() as u64;
        if target > self.high_water_mark && self.terminal.is_none() {
            // bytes_read never exceeds the high-water mark, so the shortfall fits the caller's buffer
            let shortfall = usize::try_from(target - self.high_water_mark).unwrap_or(buf.remaining());
            match self.poll_upstream(cx, shortfall) {
                Poll::Ready(()) => self.wake_parked(id),
                Poll::Pending if self.slots[id].pending.is_empty() => {
                    self.slots[id].park(cx.waker());
                    return Poll::Pending;
                }
                // upstream now holds this reader's waker although it is served from its queue
                Poll::Pending => self.wake_parked(id),
            }
        }

        if self.slots[id].drain_into(buf) > 0 {
            return Poll::Ready(Ok(()));
        }

        match &self.terminal {
            Some(terminal) => Poll::Ready(terminal.to_result()),
            // a live reader below the high-water mark always has queued bytes
            None => unreachable!("split reader {id} has neither queued bytes nor a terminal condition"),
        }
    }

    fn poll_upstream(&mut self, cx: &mut Context<'_>, shortfall: usize) -> Poll<()> {
        if self.scratch.len() < shortfall {
            self.scratch.resize(shortfall, 0);
        }
        let mut read_buf = ReadBuf::new(&mut self.scratch[..shortfall]);
        let polled = Pin::new(&mut self.upstream).poll_read(cx, &mut read_buf);
        let received = read_buf.filled().len();

        match polled {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(())) if received == 0 => {
                debug!(high_water_mark = self.high_water_mark, "upstream reached end of stream");
                self.terminal = Some(Terminal::Eof);
                self.scratch = Vec::new();
            }
            Poll::Ready(Ok(())) => {
                let bytes = Bytes::copy_from_slice(&self.scratch[..received]);
                self.high_water_mark += received as u64;
                for slot in self.slots.iter_mut().filter(|slot| slot.live) {
                    slot.pending.push_back(bytes.clone());
                }
            }
            Poll::Ready(Err(e)) => {
                debug!(cause = %e, high_water_mark = self.high_water_mark, "upstream read failed");
                self.terminal = Some(Terminal::Failed(UpstreamError::new(e)));
                self.scratch = Vec::new();
            }
        }

        self.upstream_reads += 1;
        trace!(requested = shortfall, received, high_water_mark = self.high_water_mark, "pulled from upstream");
        Poll::Ready(())
    }

    fn wake_parked(&mut self, except: usize) {
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if id != except {
                if let Some(waker) = slot.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    fn close(&mut self, id: usize) -> Result<(), SplitError> {
        let slot = &mut self.slots[id];
        if !slot.live {
            return Err(SplitError::AlreadyClosed);
        }

        slot.live = false;
        slot.pending = VecDeque::new();
        slot.waker = None;
        self.active -= 1;
        // upstream may hold the waker of the reader going away
        self.wake_parked(id);

        if self.active == 0 {
            debug!(high_water_mark = self.high_water_mark, upstream_reads = self.upstream_reads, "last split reader closed, closing upstream");
            return self.upstream.close().map_err(SplitError::close);
        }
        Ok(())
    }
}

/// One of the independent readers produced by [`split`].
pub struct SplitReader<U: Upstream> {
    id: usize,
    shared: Arc<Mutex<Shared<U>>>,
    options: SplitOptions,
}

impl<U: Upstream> SplitReader<U> {
    fn new(id: usize, shared: Arc<Mutex<Shared<U>>>, options: SplitOptions) -> Self {
        Self { id, shared, options }
    }

    fn lock(&self) -> MutexGuard<'_, Shared<U>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Bytes this reader has delivered so far.
    pub fn bytes_read(&self) -> u64 {
        self.lock().slots[self.id].bytes_read
    }

    /// Bytes pulled from upstream but not yet delivered by this reader.
    pub fn buffered(&self) -> usize {
        self.lock().slots[self.id].buffered()
    }

    /// Bytes pulled from upstream by all readers together.
    pub fn high_water_mark(&self) -> u64 {
        self.lock().high_water_mark
    }

    pub fn is_closed(&self) -> bool {
        !self.lock().is_live(self.id)
    }

    /// Closes this reader. Upstream is closed, and its result returned, when this was the last
    /// live reader of the split.
    pub fn close(&mut self) -> Result<(), SplitError> {
        self.lock().close(self.id)
    }
}

impl<U: Upstream> fmt::Debug for SplitReader<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitReader").field("id", &self.id).field("options", &self.options).finish_non_exhaustive()
    }
}

impl<U: Upstream> Drop for SplitReader<U> {
    fn drop(&mut self) {
        let mut shared = self.lock();
        if shared.is_live(self.id) {
            if let Err(e) = shared.close(self.id) {
                warn!(id = self.id, cause = %e, "failed to close split reader on drop");
            }
        }
    }
}

impl<U: Upstream> AsyncRead for SplitReader<U> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let id = self.id;
        self.lock().poll_read(id, cx, buf)
    }
}

impl<U: Upstream> Upstream for SplitReader<U> {
    fn close(&mut self) -> io::Result<()> {
        SplitReader::close(self).map_err(io::Error::from)
    }
}

impl<U: Upstream> Body for SplitReader<U> {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let mut buf = BytesMut::with_capacity(this.options.frame_size);
        match ready!(tokio_util::io::poll_read_buf(Pin::new(this), cx, &mut buf)) {
            Ok(0) => Poll::Ready(None),
            Ok(_) => Poll::Ready(Some(Ok(Frame::data(buf.freeze())))),
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }
}
