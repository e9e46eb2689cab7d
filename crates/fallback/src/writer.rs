use std::io;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::Full;
use tracing::warn;

use crate::sink::ResponseSink;

/// A [`ResponseSink`] with the commit rules of a network response writer.
///
/// The head is committed by the first `set_status`, or by the first `write` with an implicit
/// `200 OK`. After that, further status changes are ignored and header edits are not sent.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    headers: HeaderMap,
    head: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_committed(&self) -> bool {
        self.head.is_some()
    }

    /// The committed status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|(status, _)| *status)
    }

    fn commit(&mut self, status: StatusCode) {
        let headers = std::mem::take(&mut self.headers);
        self.head = Some((status, headers));
    }

    /// Finishes the response. An untouched writer yields an empty `200 OK`.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let (status, headers) = self.head.unwrap_or((StatusCode::OK, self.headers));
        let mut response = Response::new(Full::new(self.body.freeze()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

impl ResponseSink for ResponseWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn set_status(&mut self, status: StatusCode) {
        match &self.head {
            Some((committed, _)) => {
                warn!(committed = %committed, ignored = %status, "superfluous set_status on committed response");
            }
            None => self.commit(status),
        }
    }

    fn write(&mut self, data: Bytes) -> io::Result<()> {
        if self.head.is_none() {
            self.commit(StatusCode::OK);
        }
        self.body.extend_from_slice(&data);
        Ok(())
    }
}
