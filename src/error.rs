//! Error types.
//!
//! Usage errors ([`ClientError::InvalidUsage`],
//! [`ClientError::UnsupportedProtocol`], [`ClientError::InvalidUrl`]) are
//! returned synchronously before anything is queued. Everything that happens
//! after dispatch rejects the request's [`ResponseFuture`] exactly once.
//!
//! [`HttpClientError`] is reserved for failures the client itself decides on
//! (timeouts and oversize bodies). Transport failures such as a refused
//! connection are passed through unmodified as [`ClientError::Transport`].
//!
//! [`ResponseFuture`]: crate::ResponseFuture

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::response::RequestDescriptor;
use crate::timing::Timings;
use crate::tls::TlsError;

/// Why the client itself failed a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpErrorKind {
    /// The decoded response body exceeded `max_response_size`.
    ResponseTooLarge,
    /// No complete response within the configured timeout.
    Timeout,
}

impl HttpErrorKind {
    /// Human-readable message for this kind.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ResponseTooLarge => "Response too large",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for HttpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A request failure decided by the client (timeout, oversize body).
///
/// Carries the timings gathered up to the failure and the originating
/// request, so batch callers can correlate failures.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HttpClientError {
    /// Failure kind.
    pub kind: HttpErrorKind,
    /// Message (`"Timeout"`, `"Response too large"`).
    pub message: String,
    /// Response status code, if a response head had arrived.
    pub status_code: Option<u16>,
    /// Timings up to the failure.
    pub timings: Timings,
    /// The request that failed.
    pub request: RequestDescriptor,
}

impl HttpClientError {
    /// Stable error name for logging and matching.
    pub const NAME: &'static str = "HttpClientError";

    pub(crate) fn new(
        kind: HttpErrorKind,
        status_code: Option<u16>,
        timings: Timings,
        request: RequestDescriptor,
    ) -> Self {
        Self {
            kind,
            message: kind.message().to_owned(),
            status_code,
            timings,
            request,
        }
    }

    /// Returns [`Self::NAME`].
    #[must_use]
    pub const fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// Errors returned by [`HttpClient`](crate::HttpClient) operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The call mixes options that cannot be combined.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
    /// The URL scheme is neither `http` nor `https`.
    #[error("unknown url type: {0}")]
    UnsupportedProtocol(String),
    /// The URL could not be parsed.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// The URL as given.
        url: String,
        /// Parser message.
        reason: String,
    },
    /// Timeout or oversize response.
    #[error(transparent)]
    Http(#[from] HttpClientError),
    /// Connection, DNS, TLS handshake or protocol failure from the transport.
    #[error(transparent)]
    Transport(#[from] hyper_util::client::legacy::Error),
    /// Body transfer or content decoding failed after the response head.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A streaming request was destroyed before it completed.
    #[error("stream destroyed")]
    StreamDestroyed,
    /// TLS configuration could not be built.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// Client configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The client was built outside a Tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    /// The completion was dropped without an outcome (runtime shut down).
    #[error("request cancelled before completion")]
    Cancelled,
}

impl ClientError {
    /// Returns the client-decided failure, if this is one.
    #[must_use]
    pub const fn as_http(&self) -> Option<&HttpClientError> {
        match self {
            Self::Http(err) => Some(err),
            _ => None,
        }
    }

    /// True for [`HttpErrorKind::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.as_http()
            .is_some_and(|err| err.kind == HttpErrorKind::Timeout)
    }

    /// True for [`HttpErrorKind::ResponseTooLarge`].
    #[must_use]
    pub fn is_too_large(&self) -> bool {
        self.as_http()
            .is_some_and(|err| err.kind == HttpErrorKind::ResponseTooLarge)
    }

    /// True for errors returned before anything was queued.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::InvalidUsage(_) | Self::UnsupportedProtocol(_) | Self::InvalidUrl { .. }
        )
    }

    /// True when the transport failed to establish a connection.
    #[must_use]
    pub fn is_connect(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_connect(),
            _ => false,
        }
    }
}
