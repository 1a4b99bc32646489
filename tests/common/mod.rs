//! Shared integration test utilities: logging setup, phase macros, and an
//! in-process HTTP/HTTPS test server.

#![allow(dead_code, unused_imports)]

use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub use throttled_http::{
    ClientConfig, ClientError, HttpClient, Many, RequestOptions, TlsOptions,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ServerBody = UnsyncBoxBody<Bytes, BoxError>;

static INIT_LOGGING: Once = Once::new();

/// Install a `tracing` subscriber honoring `RUST_LOG` (once per process).
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("throttled_http=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = %$name, "==== test start ====");
    };
}

#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::info!(section = %$name, "---- section ----");
    };
}

#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "==== test complete ====");
    };
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {
        tracing::info!(test = %$name, $($field = ?$value),+, "==== test complete ====");
    };
}

#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                expected = ?$expected,
                actual = ?$actual,
                "assertion failed: {}",
                $msg
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Request accounting shared by one or more test servers.
#[derive(Debug, Default)]
pub struct ServerStats {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

impl ServerStats {
    fn enter(&self) -> InFlight<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        InFlight(self)
    }

    /// Highest number of handlers running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Handlers running now.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a ServerStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An HTTP (or HTTPS) server running on the test's runtime.
pub struct TestServer {
    pub addr: SocketAddr,
    pub stats: Arc<ServerStats>,
    scheme: &'static str,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Plain HTTP server with its own stats.
    pub async fn start() -> Self {
        Self::start_with_stats(Arc::new(ServerStats::default())).await
    }

    /// Plain HTTP server recording into `stats`.
    pub async fn start_with_stats(stats: Arc<ServerStats>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let server_stats = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let stats = Arc::clone(&server_stats);
                tokio::spawn(serve(TokioIo::new(stream), stats));
            }
        });
        Self {
            addr,
            stats,
            scheme: "http",
            task,
        }
    }

    /// HTTPS server with a fresh self-signed certificate for `localhost`.
    /// Returns the server and the certificate as PEM.
    pub async fn start_tls() -> (Self, String) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
            .expect("generate certificate");
        let cert_pem = certified.cert.pem();
        let cert_der: CertificateDer<'static> = certified.cert.der().clone();
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .expect("server certificate");
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let stats = Arc::new(ServerStats::default());
        let server_stats = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let stats = Arc::clone(&server_stats);
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => serve(TokioIo::new(tls), stats).await,
                        Err(err) => tracing::debug!(error = %err, "tls handshake failed"),
                    }
                });
            }
        });
        (
            Self {
                addr,
                stats,
                scheme: "https",
                task,
            },
            cert_pem,
        )
    }

    /// URL of `path` on this server via `127.0.0.1`.
    pub fn url(&self, path: &str) -> String {
        format!("{}://127.0.0.1:{}{path}", self.scheme, self.addr.port())
    }

    /// URL of `path` on this server via `localhost`.
    pub fn localhost_url(&self, path: &str) -> String {
        format!("{}://localhost:{}{path}", self.scheme, self.addr.port())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<I>(io: I, stats: Arc<ServerStats>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let stats = Arc::clone(&stats);
        async move { Ok::<_, Infallible>(route(req, &stats).await) }
    });
    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        tracing::debug!(error = %err, "test connection ended");
    }
}

fn full(body: impl Into<Bytes>) -> ServerBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed_unsync()
}

fn respond(status: StatusCode, body: ServerBody) -> Response<ServerBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Data chunks produced every `interval`; `stall` keeps the body open after
/// the last chunk without ever ending it.
fn chunks(parts: Vec<&'static str>, interval: Duration, stall: bool) -> ServerBody {
    let stream = futures_lite::stream::unfold(0usize, move |index| {
        let parts = parts.clone();
        async move {
            if index >= parts.len() {
                if stall {
                    std::future::pending::<()>().await;
                }
                return None;
            }
            tokio::time::sleep(interval).await;
            let frame: Result<Frame<Bytes>, BoxError> =
                Ok(Frame::data(Bytes::from_static(parts[index].as_bytes())));
            Some((frame, index + 1))
        }
    });
    StreamBody::new(stream).boxed_unsync()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip");
    encoder.finish().expect("gzip")
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("deflate");
    encoder.finish().expect("deflate")
}

/// Size of the `/large_response` body.
pub const LARGE_RESPONSE_SIZE: usize = 256 * 1024;

async fn route(req: Request<Incoming>, stats: &ServerStats) -> Response<ServerBody> {
    let _in_flight = stats.enter();
    let path = req.uri().path().to_owned();
    tracing::debug!(method = %req.method(), %path, "test server request");

    if matches!(*req.method(), Method::PUT | Method::PATCH | Method::DELETE) {
        return respond(StatusCode::OK, full(req.method().as_str().to_owned()));
    }

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["ok"] => respond(StatusCode::OK, full("OK")),
        ["delay", ms] => {
            let ms: u64 = ms.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            respond(StatusCode::OK, full(ms.to_string()))
        }
        ["timeout"] => {
            std::future::pending::<()>().await;
            unreachable!()
        }
        ["timeout_with_data"] => respond(
            StatusCode::OK,
            chunks(vec!["partial"], Duration::ZERO, true),
        ),
        ["large_response"] => respond(StatusCode::OK, full(vec![b'x'; LARGE_RESPONSE_SIZE])),
        ["chunked"] => respond(
            StatusCode::OK,
            chunks(
                vec!["chunk1", "chunk2", "chunk3"],
                Duration::from_millis(5),
                false,
            ),
        ),
        ["echo"] => {
            let body = req.into_body().map_err(BoxError::from).boxed_unsync();
            respond(StatusCode::OK, body)
        }
        ["gzip"] => {
            let mut response = respond(StatusCode::OK, full(gzip(b"ok")));
            response
                .headers_mut()
                .insert("content-encoding", "gzip".parse().expect("header"));
            response
        }
        ["deflate"] => {
            let mut response = respond(StatusCode::OK, full(deflate(b"ok")));
            response
                .headers_mut()
                .insert("content-encoding", "deflate".parse().expect("header"));
            response
        }
        ["auth"] => {
            let auth = req
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_owned();
            respond(StatusCode::OK, full(auth))
        }
        ["cookies"] => {
            let mut response = respond(StatusCode::OK, full(""));
            let headers = response.headers_mut();
            headers.append("set-cookie", "a=1".parse().expect("header"));
            headers.append("set-cookie", "b=2".parse().expect("header"));
            headers.append("x-multi", "one".parse().expect("header"));
            headers.append("x-multi", "two".parse().expect("header"));
            response
        }
        ["status", code] => {
            let status = code
                .parse::<u16>()
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::BAD_REQUEST);
            respond(status, full(status.as_str().to_owned()))
        }
        _ => respond(StatusCode::NOT_FOUND, full("not found")),
    }
}

/// Build a client, panicking on configuration errors.
pub fn client(config: ClientConfig) -> HttpClient {
    HttpClient::with_config(config).expect("client")
}

/// No per-call overrides.
pub fn no_options() -> RequestOptions {
    RequestOptions::new()
}
