//! Speculative fallback between handlers.
//!
//! An [`Alternative`] serves a request with a primary handler against a [`CapturedResponse`].
//! When the captured status equals the configured trigger, the captured response is thrown away
//! and a fallback handler serves the same request again, reading the same body, straight into the
//! caller's sink. Otherwise the captured response is replayed to the caller.
//!
//! ```
//! use http::StatusCode;
//! use micro_fallback::{attempt, handler_fn, Alternative};
//! # use http::Response;
//! # let cache = handler_fn(|_req| async { Response::new("cached") });
//! # let origin = handler_fn(|_req| async { Response::new("origin") });
//! # let archive = handler_fn(|_req| async { Response::new("archive") });
//!
//! let alternative: Alternative = attempt(cache)
//!     .when_status(StatusCode::NOT_FOUND)
//!     .then(origin)
//!     .when_status(StatusCode::GONE)
//!     .then(archive);
//! ```
//!
//! The body is split lazily, see [`crate::split`], so a primary that reads nothing causes no
//! upstream read and a primary that reads part of the body leaves all of it to the fallback.
//!
//! Only the HTTP response is speculative. Anything else the primary did before answering with the
//! trigger status, such as writing to a downstream system, is not undone; handlers placed in
//! front of a fallback must be safe to abandon.

use std::fmt;

use async_trait::async_trait;
use http::request::Parts;
use http::{Request, StatusCode};
use tracing::{debug, warn};

use crate::body::RequestBody;
use crate::handler::Handler;
use crate::sink::{CapturedResponse, ResponseSink};
use crate::split::split_array;

/// Starts building an [`Alternative`] that tries `handler` first.
pub fn attempt<H: Handler + 'static>(handler: H) -> AlternativeBuilder {
    AlternativeBuilder::new(handler)
}

pub struct AlternativeBuilder {
    try_handler: Box<dyn Handler>,
    when_status: Option<StatusCode>,
}

impl AlternativeBuilder {
    pub fn new<H: Handler + 'static>(try_handler: H) -> Self {
        Self { try_handler: Box::new(try_handler), when_status: None }
    }

    /// The status of the primary response that makes the fallback run.
    pub fn when_status(mut self, status: StatusCode) -> Self {
        self.when_status = Some(status);
        self
    }

    /// Finishes the alternative with its fallback handler.
    ///
    /// Without a trigger status the result always answers with the primary handler.
    pub fn then<H: Handler + 'static>(self, then_handler: H) -> Alternative {
        if self.when_status.is_none() {
            warn!("alternative built without a trigger status, its fallback handler will never run");
        }
        Alternative { try_handler: self.try_handler, when_status: self.when_status, then_handler: Box::new(then_handler) }
    }
}

impl fmt::Debug for AlternativeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlternativeBuilder").field("when_status", &self.when_status).finish_non_exhaustive()
    }
}

/// A primary handler, a trigger status and a fallback handler.
///
/// `Alternative` is itself a [`Handler`], so it can be the fallback of another alternative, or,
/// through [`Alternative::when_status`], the primary of one.
pub struct Alternative {
    try_handler: Box<dyn Handler>,
    when_status: Option<StatusCode>,
    then_handler: Box<dyn Handler>,
}

impl Alternative {
    pub fn new<T, E>(try_handler: T, when_status: Option<StatusCode>, then_handler: E) -> Self
    where
        T: Handler + 'static,
        E: Handler + 'static,
    {
        Self { try_handler: Box::new(try_handler), when_status, then_handler: Box::new(then_handler) }
    }

    /// Starts a further alternative that tries this one first.
    pub fn when_status(self, status: StatusCode) -> AlternativeBuilder {
        AlternativeBuilder::new(self).when_status(status)
    }

    pub fn trigger_status(&self) -> Option<StatusCode> {
        self.when_status
    }

    fn falls_back_on(&self, status: Option<StatusCode>) -> bool {
        matches!((self.when_status, status), (Some(trigger), Some(status)) if trigger == status)
    }
}

impl fmt::Debug for Alternative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alternative").field("when_status", &self.when_status).finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for Alternative {
    async fn serve(&self, req: Request<RequestBody>, sink: &mut dyn ResponseSink) {
        let (parts, body) = req.into_parts();
        let [primary_body, mut fallback_body] = split_array(body);

        let mut captured = CapturedResponse::new();
        self.try_handler.serve(clone_request(&parts, RequestBody::new(primary_body)), &mut captured).await;

        if !self.falls_back_on(captured.status()) {
            if let Err(e) = fallback_body.close() {
                warn!(cause = %e, "failed to close unused fallback body");
            }
            if let Err(e) = captured.flush_to(sink) {
                warn!(cause = %e, "failed to write captured response");
            }
            return;
        }

        debug!(status = ?captured.status(), method = %parts.method, uri = %parts.uri, "primary handler returned trigger status, serving fallback");
        drop(captured);
        self.then_handler.serve(clone_request(&parts, RequestBody::new(fallback_body)), sink).await;
    }
}

fn clone_request(parts: &Parts, body: RequestBody) -> Request<RequestBody> {
    let mut req = Request::new(body);
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts.uri.clone();
    *req.version_mut() = parts.version;
    *req.headers_mut() = parts.headers.clone();
    *req.extensions_mut() = parts.extensions.clone();
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, respond};
    use crate::upstream::Upstream;
    use bytes::Bytes;
    use http::{HeaderValue, Method, Response};
    use http::response::Parts;
    use http_body_util::BodyExt;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

    const TEST_HEADER: &str = "x-test";

    /// Answers with a fixed status, tagging the response with its designation.
    struct StatusHandler {
        status: StatusCode,
        designation: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl StatusHandler {
        fn new(status: StatusCode, designation: &'static str) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (Self { status, designation, calls: Arc::clone(&calls) }, calls)
        }
    }

    #[async_trait]
    impl Handler for StatusHandler {
        async fn serve(&self, _req: Request<RequestBody>, sink: &mut dyn ResponseSink) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sink.headers_mut().insert(TEST_HEADER, HeaderValue::from_static(self.designation));
            sink.set_status(self.status);
            sink.write(Bytes::from(format!("{} response", self.designation))).unwrap();
        }
    }

    fn status_handler(status: StatusCode, designation: &'static str) -> StatusHandler {
        StatusHandler::new(status, designation).0
    }

    /// Reads `len` bytes of the body, then answers with `status`.
    struct PartialReader {
        len: usize,
        status: StatusCode,
    }

    #[async_trait]
    impl Handler for PartialReader {
        async fn serve(&self, mut req: Request<RequestBody>, sink: &mut dyn ResponseSink) {
            let mut buf = vec![0u8; self.len];
            req.body_mut().read_exact(&mut buf).await.unwrap();
            sink.set_status(self.status);
            sink.write(Bytes::from(buf)).unwrap();
        }
    }

    fn echo() -> impl Handler {
        handler_fn(|req: Request<RequestBody>| async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::new(body)
        })
    }

    #[derive(Default)]
    struct Counters {
        reads: AtomicUsize,
        closes: AtomicUsize,
    }

    struct CountingUpstream {
        inner: io::Cursor<Bytes>,
        counters: Arc<Counters>,
    }

    impl CountingUpstream {
        fn new(content: &'static str) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (Self { inner: io::Cursor::new(Bytes::from_static(content.as_bytes())), counters: Arc::clone(&counters) }, counters)
        }
    }

    impl AsyncRead for CountingUpstream {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl Upstream for CountingUpstream {
        fn close(&mut self) -> io::Result<()> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn serve(handler: &impl Handler, req: Request<RequestBody>) -> (Parts, String) {
        let (parts, body) = respond(handler, req).await.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        (parts, String::from_utf8(body.to_vec()).unwrap())
    }

    fn get() -> Request<RequestBody> {
        Request::new(RequestBody::empty())
    }

    #[tokio::test]
    async fn fallback_runs_on_trigger_status() {
        let alternative = attempt(status_handler(StatusCode::NOT_FOUND, "primary"))
            .when_status(StatusCode::NOT_FOUND)
            .then(status_handler(StatusCode::OK, "secondary"));

        let (response, body) = serve(&alternative, get()).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get(TEST_HEADER).unwrap(), "secondary");
        assert_eq!(response.headers.len(), 1);
        assert_eq!(body, "secondary response");
    }

    #[tokio::test]
    async fn primary_response_is_kept_on_other_status() {
        let (secondary, secondary_calls) = StatusHandler::new(StatusCode::OK, "secondary");
        let alternative =
            attempt(status_handler(StatusCode::OK, "primary")).when_status(StatusCode::NOT_FOUND).then(secondary);

        let (response, body) = serve(&alternative, get()).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get(TEST_HEADER).unwrap(), "primary");
        assert_eq!(body, "primary response");
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_trigger_status_passes_primary_through() {
        let (secondary, secondary_calls) = StatusHandler::new(StatusCode::OK, "secondary");
        let alternative = Alternative::new(status_handler(StatusCode::NOT_FOUND, "primary"), None, secondary);

        let (response, body) = serve(&alternative, get()).await;

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.headers.get(TEST_HEADER).unwrap(), "primary");
        assert_eq!(body, "primary response");
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn builder_without_trigger_passes_primary_through() {
        let alternative = attempt(status_handler(StatusCode::NOT_FOUND, "primary")).then(status_handler(StatusCode::OK, "secondary"));
        assert_eq!(alternative.trigger_status(), None);

        let (response, _) = serve(&alternative, get()).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn nested_alternatives_chain() {
        let chain = attempt(status_handler(StatusCode::NOT_FOUND, "primary")).when_status(StatusCode::NOT_FOUND).then(
            attempt(status_handler(StatusCode::FORBIDDEN, "secondary"))
                .when_status(StatusCode::FORBIDDEN)
                .then(status_handler(StatusCode::OK, "tertiary")),
        );

        let (response, body) = serve(&chain, get()).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get(TEST_HEADER).unwrap(), "tertiary");
        assert_eq!(body, "tertiary response");
    }

    #[tokio::test]
    async fn alternative_when_status_extends_the_chain() {
        let chain = attempt(status_handler(StatusCode::NOT_FOUND, "primary"))
            .when_status(StatusCode::NOT_FOUND)
            .then(status_handler(StatusCode::FORBIDDEN, "secondary"))
            .when_status(StatusCode::FORBIDDEN)
            .then(status_handler(StatusCode::OK, "tertiary"));

        assert_eq!(chain.trigger_status(), Some(StatusCode::FORBIDDEN));

        let (response, body) = serve(&chain, get()).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body, "tertiary response");
    }

    #[tokio::test]
    async fn chain_stops_at_first_non_trigger_status() {
        let (tertiary, tertiary_calls) = StatusHandler::new(StatusCode::OK, "tertiary");
        let chain = attempt(status_handler(StatusCode::NOT_FOUND, "primary"))
            .when_status(StatusCode::NOT_FOUND)
            .then(attempt(status_handler(StatusCode::CREATED, "secondary")).when_status(StatusCode::FORBIDDEN).then(tertiary));

        let (response, body) = serve(&chain, get()).await;

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(body, "secondary response");
        assert_eq!(tertiary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_reads_the_whole_body_after_partial_primary_read() {
        let (upstream, counters) = CountingUpstream::new("some.data.to.test");
        let alternative = attempt(PartialReader { len: 5, status: StatusCode::NOT_FOUND })
            .when_status(StatusCode::NOT_FOUND)
            .then(echo());

        let req = Request::builder().method(Method::POST).uri("/upload").body(RequestBody::new(upstream)).unwrap();
        let (response, body) = serve(&alternative, req).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body, "some.data.to.test");
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chained_fallbacks_each_see_the_whole_body() {
        let (upstream, counters) = CountingUpstream::new("replayed twice");
        let chain = attempt(PartialReader { len: 3, status: StatusCode::NOT_FOUND })
            .when_status(StatusCode::NOT_FOUND)
            .then(attempt(PartialReader { len: 8, status: StatusCode::FORBIDDEN }).when_status(StatusCode::FORBIDDEN).then(echo()));

        let (response, body) = serve(&chain, Request::new(RequestBody::new(upstream))).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body, "replayed twice");
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pass_through_closes_upstream_without_reading_it() {
        let (upstream, counters) = CountingUpstream::new("never read");
        let alternative = attempt(status_handler(StatusCode::OK, "primary"))
            .when_status(StatusCode::NOT_FOUND)
            .then(echo());

        let (response, _) = serve(&alternative, Request::new(RequestBody::new(upstream))).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(counters.reads.load(Ordering::SeqCst), 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pass_through_keeps_primary_body_read() {
        let alternative = attempt(PartialReader { len: 4, status: StatusCode::OK })
            .when_status(StatusCode::NOT_FOUND)
            .then(echo());

        let (response, body) = serve(&alternative, Request::new(RequestBody::from("body"))).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body, "body");
    }

    #[derive(Clone, Debug, PartialEq)]
    struct RequestTag(&'static str);

    #[tokio::test]
    async fn fallback_sees_the_original_request_head() {
        let inspect = handler_fn(|req: Request<RequestBody>| async move {
            let tag = req.extensions().get::<RequestTag>().cloned();
            let summary = format!(
                "{} {} {:?} {} {:?}",
                req.method(),
                req.uri(),
                req.version(),
                req.headers().get("x-request-id").and_then(|v| v.to_str().ok()).unwrap_or("-"),
                tag.map(|t| t.0),
            );
            Response::new(summary)
        });
        let alternative =
            attempt(status_handler(StatusCode::NOT_FOUND, "primary")).when_status(StatusCode::NOT_FOUND).then(inspect);

        let req = Request::builder()
            .method(Method::PUT)
            .uri("/items/7?force=true")
            .version(http::Version::HTTP_11)
            .header("x-request-id", "abc-123")
            .extension(RequestTag("tagged"))
            .body(RequestBody::empty())
            .unwrap();
        let (_, body) = serve(&alternative, req).await;

        assert_eq!(body, "PUT /items/7?force=true HTTP/1.1 abc-123 Some(\"tagged\")");
    }

    /// Writes nothing at all.
    struct Silent;

    #[async_trait]
    impl Handler for Silent {
        async fn serve(&self, _req: Request<RequestBody>, _sink: &mut dyn ResponseSink) {}
    }

    #[tokio::test]
    async fn primary_without_status_is_not_a_trigger() {
        let (secondary, secondary_calls) = StatusHandler::new(StatusCode::OK, "secondary");
        let alternative = attempt(Silent).when_status(StatusCode::NOT_FOUND).then(secondary);

        let (response, body) = serve(&alternative, get()).await;

        assert_eq!(response.status, StatusCode::OK);
        assert!(response.headers.is_empty());
        assert!(body.is_empty());
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }
}
