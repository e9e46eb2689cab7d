use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::BodyExt;
use micro_fallback::{attempt, handler_fn, respond, Handler, RequestBody, ResponseSink};
use tokio::io::AsyncReadExt;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Peeks at the start of the body and only serves documents it knows.
struct Cache {
    known_prefix: &'static [u8],
}

#[async_trait]
impl Handler for Cache {
    async fn serve(&self, mut req: Request<RequestBody>, sink: &mut dyn ResponseSink) {
        let mut prefix = vec![0u8; self.known_prefix.len()];
        let hit = req.body_mut().read_exact(&mut prefix).await.is_ok() && prefix == self.known_prefix;

        if hit {
            sink.headers_mut().insert("x-served-by", HeaderValue::from_static("cache"));
            sink.set_status(StatusCode::OK);
            if let Err(e) = sink.write(Bytes::from_static(b"cached copy\n")) {
                warn!(cause = %e, "failed to write cached copy");
            }
        } else {
            sink.set_status(StatusCode::NOT_FOUND);
        }
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let origin = handler_fn(|req: Request<RequestBody>| async move {
        if req.headers().contains_key("x-origin-down") {
            return Response::builder().status(StatusCode::SERVICE_UNAVAILABLE).body(Bytes::new()).unwrap();
        }
        let body = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
        Response::builder()
            .header("x-served-by", "origin")
            .header(http::header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref())
            .body(Bytes::from(format!("origin stored {} bytes\n", body.len())))
            .unwrap()
    });
    let archive = handler_fn(|_req: Request<RequestBody>| async { Response::new("served from archive\n") });

    let chain = Arc::new(
        attempt(Cache { known_prefix: b"doc-1" })
            .when_status(StatusCode::NOT_FOUND)
            .then(origin)
            .when_status(StatusCode::SERVICE_UNAVAILABLE)
            .then(archive),
    );

    let requests = vec![
        Request::post("/documents").body(RequestBody::from("doc-1: hello")).unwrap(),
        Request::post("/documents").body(RequestBody::from("doc-2: a new document")).unwrap(),
        Request::post("/documents").header("x-origin-down", "1").body(RequestBody::from("doc-3")).unwrap(),
    ];

    for request in requests {
        let response = respond(&chain, request).await;
        let served_by = response.headers().get("x-served-by").and_then(|v| v.to_str().ok()).unwrap_or("-").to_string();
        let status = response.status();
        let body = response.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
        info!(%status, %served_by, body = %String::from_utf8_lossy(&body).trim_end(), "served request");
    }
}
