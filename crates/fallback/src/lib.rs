//! Speculative fallback dispatch for HTTP handlers
//!
//! Some handlers can only tell they cannot serve a request after having read (part of) its body:
//! a cache that misses, a shard that does not own the key, an upload target that rejects the
//! payload. This crate lets a second handler serve the *same* request in that case, without
//! reading the body from the network twice and without buffering it whole up front.
//!
//! # Example
//!
//! ```no_run
//! use http::{Request, Response, StatusCode};
//! use micro_fallback::{attempt, handler_fn, respond, RequestBody};
//!
//! #[tokio::main]
//! async fn main() {
//!     let local = handler_fn(|_req: Request<RequestBody>| async {
//!         let mut response = Response::new("not here");
//!         *response.status_mut() = StatusCode::NOT_FOUND;
//!         response
//!     });
//!     let remote = handler_fn(|_req: Request<RequestBody>| async { Response::new("found remotely") });
//!
//!     let alternative = attempt(local).when_status(StatusCode::NOT_FOUND).then(remote);
//!
//!     let request = Request::post("/lookup").body(RequestBody::from("key=42")).unwrap();
//!     let response = respond(&alternative, request).await;
//!     assert_eq!(response.status(), StatusCode::OK);
//! }
//! ```
//!
//! # Architecture
//!
//! - [`split`]: fans one [`Upstream`] byte stream out to independent [`SplitReader`]s, reading
//!   upstream lazily and buffering only what some reader has not consumed yet
//! - [`sink`]: the [`ResponseSink`] contract and [`CapturedResponse`], an in-memory sink
//! - [`alternative`]: [`Alternative`], which tries a primary handler against a captured sink and
//!   falls back to a second handler on a trigger status
//!
//! Handlers implement [`Handler`], either directly or through [`handler_fn`]. They receive a
//! [`RequestBody`], which is both an [`tokio::io::AsyncRead`] and an [`http_body::Body`].
//! [`respond`] runs a handler against a [`ResponseWriter`] and hands back an [`http::Response`],
//! for servers built around request to response functions.
//!
//! # Error Handling
//!
//! - [`SplitError`]: closing a split reader twice, or failing to close upstream
//! - [`UpstreamError`]: an upstream read failure, handed to every reader as the payload of a
//!   [`std::io::Error`] once it drained the bytes buffered before the failure
//!
//! Handler failures have no error channel: a failing handler answers with a status code, and
//! that status is what an [`Alternative`] inspects.

pub mod alternative;
pub mod sink;
pub mod split;

mod body;
mod error;
mod handler;
mod upstream;
mod writer;

pub use alternative::attempt;
pub use alternative::Alternative;
pub use alternative::AlternativeBuilder;
pub use body::RequestBody;
pub use error::SplitError;
pub use error::UpstreamError;
pub use handler::handler_fn;
pub use handler::respond;
pub use handler::Handler;
pub use handler::HandlerFn;
pub use sink::CapturedResponse;
pub use sink::ResponseSink;
pub use split::split;
pub use split::SplitOptions;
pub use split::SplitReader;
pub use upstream::NopClose;
pub use upstream::Upstream;
pub use writer::ResponseWriter;
