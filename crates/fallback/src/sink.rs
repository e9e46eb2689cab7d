//! The write side of a handler.
//!
//! A [`Handler`](crate::Handler) never returns its response; it writes it into a
//! [`ResponseSink`]. This module provides the sink contract and [`CapturedResponse`], an
//! in-memory sink that records what a handler wrote so the output can be inspected before it is
//! kept or thrown away.

use std::io;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::Full;

/// Where a handler writes its response.
pub trait ResponseSink: Send {
    /// The response headers, mutable until the head is sent.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sets the response status.
    ///
    /// Only the first meaningful call is guaranteed to be honoured; what later calls do is up to
    /// the sink, but they never alter bytes already sent.
    fn set_status(&mut self, status: StatusCode);

    /// Appends bytes to the response body.
    fn write(&mut self, data: Bytes) -> io::Result<()>;
}

/// A response recorded in memory.
///
/// Setting the status twice overwrites it, and writing never sets a status implicitly.
#[derive(Debug, Default)]
pub struct CapturedResponse {
    headers: Option<HeaderMap>,
    status: Option<StatusCode>,
    body: BytesMut,
}

impl CapturedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last status set, `None` if the handler never set one.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replays the recorded response into `sink`.
    ///
    /// Every recorded header name replaces the values `sink` had for it. The status is only set
    /// when one was recorded, and an empty body is not written.
    pub fn flush_to<S: ResponseSink + ?Sized>(self, sink: &mut S) -> io::Result<()> {
        if let Some(headers) = self.headers {
            // extend replaces the values of every name it yields
            sink.headers_mut().extend(headers);
        }

        if let Some(status) = self.status {
            sink.set_status(status);
        }

        if !self.body.is_empty() {
            sink.write(self.body.freeze())?;
        }
        Ok(())
    }

    /// Converts the recording into a response, defaulting the status to `200 OK`.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body.freeze()));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        if let Some(headers) = self.headers {
            *response.headers_mut() = headers;
        }
        response
    }
}

impl ResponseSink for CapturedResponse {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.headers.get_or_insert_with(HeaderMap::new)
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.body.extend_from_slice(&data);
        Ok(())
    }
}
