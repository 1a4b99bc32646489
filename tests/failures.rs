//! Timeouts, size limits, transport errors and synchronous rejections.

#[macro_use]
mod common;

use std::time::Duration;

use common::*;
use http::{HeaderMap, Method};
use throttled_http::HttpErrorKind;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

// ============================================================================
// Client-decided failures
// ============================================================================

#[tokio::test]
async fn timeout_before_response_head() {
    init_test("timeout_before_response_head");
    let server = TestServer::start().await;
    let client = client(ClientConfig::default().timeout(Duration::from_millis(100)));

    let err = client
        .get(&server.url("/timeout"), HeaderMap::new(), &no_options())
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err:?}");

    let http = err.as_http().unwrap();
    assert_eq!(http.kind, HttpErrorKind::Timeout);
    assert_eq!(http.message, "Timeout");
    assert_eq!(http.status_code, None);
    assert_eq!(http.request.url, server.url("/timeout"));
    assert!(http.timings.total() >= Duration::from_millis(100));
    test_complete!("timeout_before_response_head");
}

#[tokio::test]
async fn timeout_while_reading_body_keeps_status() {
    init_test("timeout_while_reading_body_keeps_status");
    let server = TestServer::start().await;
    let client = client(ClientConfig::default());
    let options = RequestOptions::new().timeout(Duration::from_millis(100));

    let err = client
        .get(&server.url("/timeout_with_data"), HeaderMap::new(), &options)
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.as_http().unwrap().status_code, Some(200));
    test_complete!("timeout_while_reading_body_keeps_status");
}

#[tokio::test]
async fn oversized_response_is_rejected() {
    init_test("oversized_response_is_rejected");
    let server = TestServer::start().await;
    let client = client(ClientConfig::default().max_response_size(LARGE_RESPONSE_SIZE / 4));

    let err = client
        .get(&server.url("/large_response"), HeaderMap::new(), &no_options())
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is_too_large(), "unexpected error: {err:?}");
    let http = err.as_http().unwrap();
    assert_eq!(http.message, "Response too large");
    assert_eq!(http.status_code, Some(200));

    test_section!("exact limit is accepted");
    let options = RequestOptions::new().max_response_size(LARGE_RESPONSE_SIZE);
    let response = client
        .get(&server.url("/large_response"), HeaderMap::new(), &options)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.data.len(), LARGE_RESPONSE_SIZE);
    test_complete!("oversized_response_is_rejected");
}

#[tokio::test]
async fn failures_release_their_slot() {
    init_test("failures_release_their_slot");
    let server = TestServer::start().await;
    let client = client(
        ClientConfig::default()
            .max_concurrent(1)
            .timeout(Duration::from_millis(80))
            .max_response_size(1024),
    );

    let timed_out = client
        .get(&server.url("/timeout"), HeaderMap::new(), &no_options())
        .unwrap();
    let too_large = client
        .get(&server.url("/large_response"), HeaderMap::new(), &no_options())
        .unwrap();
    let ok = client
        .get(&server.url("/ok"), HeaderMap::new(), &no_options())
        .unwrap();

    assert!(timed_out.await.unwrap_err().is_timeout());
    assert!(too_large.await.unwrap_err().is_too_large());
    let response = ok.await.unwrap();
    assert_eq!(response.text(), "OK");
    assert_eq!(client.stats().outstanding, 0);
    test_complete!("failures_release_their_slot");
}

#[tokio::test]
async fn error_statuses_still_resolve() {
    init_test("error_statuses_still_resolve");
    let server = TestServer::start().await;
    let client = client(ClientConfig::default());

    let response = client
        .get(&server.url("/status/503"), HeaderMap::new(), &no_options())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.status_code, 503);
    assert_eq!(response.status_message, "Service Unavailable");
    assert!(!response.is_success());
    test_complete!("error_statuses_still_resolve");
}

// ============================================================================
// Transport failures
// ============================================================================

#[tokio::test]
async fn connection_refused_is_a_connect_error() {
    init_test("connection_refused_is_a_connect_error");
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = client(ClientConfig::default().max_concurrent(1));

    let url = format!("http://127.0.0.1:{port}/");
    let futures = client
        .get_batch([&url, &url], Many::default(), &no_options())
        .unwrap();
    for future in futures {
        let err = future.await.unwrap_err();
        assert!(err.is_connect(), "unexpected error: {err:?}");
    }
    assert_eq!(client.stats().outstanding, 0);
    test_complete!("connection_refused_is_a_connect_error");
}

// ============================================================================
// Synchronous rejections
// ============================================================================

#[tokio::test]
async fn unsupported_protocol_is_rejected_synchronously() {
    init_test("unsupported_protocol_is_rejected_synchronously");
    let client = client(ClientConfig::default());

    let err = client
        .get("ftp://localhost/file", HeaderMap::new(), &no_options())
        .unwrap_err();
    assert!(matches!(err, ClientError::UnsupportedProtocol(_)));
    assert_eq!(err.to_string(), "unknown url type: ftp://localhost/file");
    assert!(client.stats().endpoints.is_empty());
    test_complete!("unsupported_protocol_is_rejected_synchronously");
}

#[tokio::test]
async fn one_bad_url_rejects_the_whole_batch() {
    init_test("one_bad_url_rejects_the_whole_batch");
    let server = TestServer::start().await;
    let client = client(ClientConfig::default());

    let urls = [server.url("/ok"), "::not a url".to_owned()];
    let err = client
        .get_batch(&urls, Many::default(), &no_options())
        .unwrap_err();
    assert!(err.is_usage());
    assert!(matches!(err, ClientError::InvalidUrl { .. }));
    assert_eq!(client.stats().queued(), 0);
    assert_eq!(server.stats.total(), 0);
    test_complete!("one_bad_url_rejects_the_whole_batch");
}

#[tokio::test]
async fn stream_flags_are_rejected_outside_request_stream() {
    init_test("stream_flags_are_rejected_outside_request_stream");
    let server = TestServer::start().await;
    let client = client(ClientConfig::default());
    let urls = [server.url("/ok"), server.url("/ok")];

    let err = client
        .get_batch(&urls, Many::default(), &RequestOptions::new().stream())
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid usage: stream can not be mixed with batch");

    let err = client
        .request(
            Method::GET,
            &server.url("/ok"),
            HeaderMap::new(),
            None,
            &RequestOptions::new().write_stream(),
        )
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidUsage(_)));
    test_complete!("stream_flags_are_rejected_outside_request_stream");
}

#[tokio::test]
async fn zero_limits_are_configuration_errors() {
    init_test("zero_limits_are_configuration_errors");
    let err = HttpClient::with_config(ClientConfig::default().max_concurrent(0)).unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));

    let server = TestServer::start().await;
    let client = client(ClientConfig::default());
    let err = client
        .get(
            &server.url("/ok"),
            HeaderMap::new(),
            &RequestOptions::new().timeout(Duration::ZERO),
        )
        .unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
    test_complete!("zero_limits_are_configuration_errors");
}
