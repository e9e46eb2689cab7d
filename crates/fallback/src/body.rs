use std::error::Error;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;

use crate::split::DEFAULT_FRAME_SIZE;
use crate::upstream::{NopClose, Upstream};

/// The request body handed to every [`Handler`](crate::Handler).
///
/// It boxes any [`Upstream`], which lets a split reader be wrapped again and split a second time
/// when alternatives are chained.
pub struct RequestBody {
    inner: Box<dyn Upstream>,
}

impl RequestBody {
    pub fn new<U: Upstream + 'static>(upstream: U) -> Self {
        Self { inner: Box::new(upstream) }
    }

    pub fn empty() -> Self {
        Self::from(Bytes::new())
    }

    /// Adapts a streaming [`Body`], for instance the request body of an HTTP server.
    ///
    /// Trailers are ignored; closing the adapted body is a no-op, the body is released on drop.
    pub fn from_body<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let stream = body.into_data_stream().map_err(io::Error::other);
        Self::new(NopClose::new(StreamReader::new(stream)))
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody").finish_non_exhaustive()
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::new(NopClose::new(io::Cursor::new(bytes)))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::from(Bytes::from(value))
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::from(Bytes::from(value))
    }
}

impl From<&'static str> for RequestBody {
    fn from(value: &'static str) -> Self {
        Self::from(Bytes::from_static(value.as_bytes()))
    }
}

impl AsyncRead for RequestBody {
    #[inline]
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Upstream for RequestBody {
    #[inline]
    fn close(&mut self) -> io::Result<()> {
        RequestBody::close(self)
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut buf = BytesMut::with_capacity(DEFAULT_FRAME_SIZE);
        match ready!(tokio_util::io::poll_read_buf(self, cx, &mut buf)) {
            Ok(0) => Poll::Ready(None),
            Ok(_) => Poll::Ready(Some(Ok(Frame::data(buf.freeze())))),
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Full, StreamBody};
    use tokio::io::AsyncReadExt;

    fn check_send<T: Send>() {}

    #[test]
    fn is_send() {
        check_send::<RequestBody>();
    }

    #[tokio::test]
    async fn string_body_reads_fully() {
        let mut body = RequestBody::from("hello world".to_string());

        let mut out = String::new();
        body.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn empty_body_ends_immediately() {
        let mut body = RequestBody::empty();

        assert!(body.frame().await.is_none());
        assert!(body.close().is_ok());
    }

    #[tokio::test]
    async fn adapts_full_body() {
        let body = RequestBody::from_body(Full::new(Bytes::from_static(b"full body")));

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"full body"));
    }

    #[tokio::test]
    async fn adapts_stream_body_and_its_error() {
        let chunks: Vec<Result<Frame<Bytes>, io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"ab"))),
            Ok(Frame::data(Bytes::from_static(b"cd"))),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated")),
        ];
        let mut body = RequestBody::from_body(StreamBody::new(futures::stream::iter(chunks)));

        let mut buf = [0u8; 4];
        body.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        let err = body.read(&mut buf).await.unwrap_err();
        assert_eq!(err.to_string(), "truncated");
    }
}
