//! Optional tracing integration.
//!
//! With the `tracing-integration` feature enabled this module re-exports the
//! `tracing` event macros. Without it the macros expand to nothing, so call
//! sites never need their own `cfg` guards.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// No-op `trace!` (tracing disabled).
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __throttled_http_noop_trace {
        ($($arg:tt)*) => {};
    }

    /// No-op `debug!` (tracing disabled).
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __throttled_http_noop_debug {
        ($($arg:tt)*) => {};
    }

    /// No-op `info!` (tracing disabled).
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __throttled_http_noop_info {
        ($($arg:tt)*) => {};
    }

    /// No-op `warn!` (tracing disabled).
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __throttled_http_noop_warn {
        ($($arg:tt)*) => {};
    }

    /// No-op `error!` (tracing disabled).
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __throttled_http_noop_error {
        ($($arg:tt)*) => {};
    }
}

#[cfg(not(feature = "tracing-integration"))]
pub use crate::{
    __throttled_http_noop_debug as debug, __throttled_http_noop_error as error,
    __throttled_http_noop_info as info, __throttled_http_noop_trace as trace,
    __throttled_http_noop_warn as warn,
};
