//! throttled-http: a concurrency-limited HTTP/HTTPS client.
//!
//! # Overview
//!
//! Every request is queued on its *endpoint* (`scheme://host:port/`) and
//! dispatched only while both the endpoint's and the client's outstanding
//! counts are below their ceilings. Callers get a future (or a stream)
//! immediately; dispatch always happens later, on the client's Tokio runtime.
//!
//! # Guarantees
//!
//! - **Bounded concurrency**: per-endpoint and client-wide ceilings are never
//!   exceeded; queued requests leave their endpoint queue in FIFO order
//! - **Exactly one outcome**: each request resolves or rejects once, and its
//!   concurrency slot is released once, whatever way it ends
//! - **Streaming before dispatch**: a [`DuplexStream`] accepts writes and
//!   reads while its request is still queued
//! - **Completion-ordered batches**: batch futures resolve in the order the
//!   responses finish
//!
//! # Module Structure
//!
//! - `client`: [`HttpClient`], option resolution, endpoint lookup, enqueueing
//! - `endpoint`: per-endpoint FIFO queues and counters
//! - `dispatch`: drain loop and per-request execution
//! - `duplex`: the caller-facing streaming adapter
//! - `agent` / `tls`: connection reuse and rustls configuration
//! - `body` / `decode`: timed request bodies and decoded response bodies
//! - `timing`: lifecycle milestones
//! - [`tracing_compat`]: optional tracing integration (`tracing-integration` feature)
//!
//! # Example
//!
//! ```no_run
//! use http::HeaderMap;
//! use throttled_http::{ClientConfig, HttpClient, Many, RequestOptions};
//!
//! # async fn demo() -> Result<(), throttled_http::ClientError> {
//! let client = HttpClient::with_config(ClientConfig::default().max_concurrent(2))?;
//! let futures = client.get_batch(
//!     ["http://localhost:8080/a", "http://localhost:8080/b"],
//!     Many::default(),
//!     &RequestOptions::new(),
//! )?;
//! for future in futures {
//!     let response = future.await?;
//!     println!("{} {}", response.request.url, response.status_code);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

mod agent;
mod body;
mod client;
mod config;
mod decode;
mod dispatch;
mod duplex;
mod endpoint;
mod error;
mod response;
mod timing;
mod tls;
pub mod tracing_compat;

pub use agent::{Agent, AgentBuilder, DEFAULT_IDLE_TIMEOUT};
pub use body::{BoxError, RequestBody};
pub use client::{HttpClient, Many};
pub use config::{
    ClientConfig, ConfigError, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RESPONSE_SIZE,
    DEFAULT_MAX_TOTAL_CONCURRENT, DEFAULT_TIMEOUT, DEFAULT_WRITE_BUFFER_SIZE, RequestOptions,
};
pub use decode::ContentEncoding;
pub use duplex::DuplexStream;
pub use endpoint::{ClientStats, EndpointKey, EndpointStats};
pub use error::{ClientError, HttpClientError, HttpErrorKind};
pub use response::{
    BatchResponses, HttpResponse, RequestDescriptor, ResponseFuture, ResponseHeaders,
    ResponseResult,
};
pub use timing::Timings;
pub use tls::{TlsError, TlsOptions, client_config as tls_client_config};
