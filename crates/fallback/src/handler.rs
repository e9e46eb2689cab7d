use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use tracing::warn;

use crate::body::RequestBody;
use crate::sink::ResponseSink;
use crate::writer::ResponseWriter;

/// Serves a request by writing its response into a sink.
///
/// There is no return value: completion is observed only through what was written to `sink`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, req: Request<RequestBody>, sink: &mut dyn ResponseSink);
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Box<H> {
    async fn serve(&self, req: Request<RequestBody>, sink: &mut dyn ResponseSink) {
        (**self).serve(req, sink).await;
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn serve(&self, req: Request<RequestBody>, sink: &mut dyn ResponseSink) {
        (**self).serve(req, sink).await;
    }
}

/// A [`Handler`] built from an async function returning a whole response.
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut, B> Handler for HandlerFn<F>
where
    F: Fn(Request<RequestBody>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<B>> + Send,
    B: Into<Bytes> + Send,
{
    async fn serve(&self, req: Request<RequestBody>, sink: &mut dyn ResponseSink) {
        let (parts, body) = (self.f)(req).await.into_parts();

        sink.headers_mut().extend(parts.headers);
        sink.set_status(parts.status);

        let body: Bytes = body.into();
        if !body.is_empty() {
            if let Err(e) = sink.write(body) {
                warn!(cause = %e, "failed to write response body");
            }
        }
    }
}

pub fn handler_fn<F, Fut, B>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<RequestBody>) -> Fut,
    Fut: Future<Output = Response<B>>,
    B: Into<Bytes>,
{
    HandlerFn { f }
}

/// Serves `req` with `handler` and returns the finished response.
///
/// The handler writes into a [`ResponseWriter`], so the usual commit rules apply.
pub async fn respond<H: Handler + ?Sized>(handler: &H, req: Request<RequestBody>) -> Response<Full<Bytes>> {
    let mut writer = ResponseWriter::new();
    handler.serve(req, &mut writer).await;
    writer.into_response()
}
