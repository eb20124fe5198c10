use std::collections::BTreeMap;
use std::time::Duration;

use harvester_engine::{FailureKind, FetchSettings, FetchStrategy, ReqwestFetcher};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn fetcher_returns_body_and_kept_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .insert_header("X-Ignored", "1")
                .set_body_raw("<html>ok</html>", "text/html; charset=utf-8"),
        )
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(FetchSettings::default()).unwrap();
    let url = format!("{}/doc", server.uri());
    let request = fetcher.request_identity(&url);

    let page = fetcher.fetch(&request).await.expect("fetch ok");
    assert_eq!(page.status, 200);
    assert_eq!(page.final_url, url);
    assert!(page.content_type().unwrap().starts_with("text/html"));
    assert_eq!(page.headers.get("etag").map(String::as_str), Some("\"v1\""));
    assert!(!page.headers.contains_key("x-ignored"));
    assert_eq!(page.body, b"<html>ok</html>");
}

#[tokio::test]
async fn configured_headers_and_cookies_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .and(header("x-token", "secret"))
        .and(header("cookie", "lang=en; session=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<p>in</p>", "text/html"))
        .expect(1)
        .mount(&server)
        .await;

    let settings = FetchSettings {
        headers: BTreeMap::from([("X-Token".to_string(), "secret".to_string())]),
        cookies: BTreeMap::from([
            ("session".to_string(), "abc".to_string()),
            ("lang".to_string(), "en".to_string()),
        ]),
        ..FetchSettings::default()
    };
    let fetcher = ReqwestFetcher::new(settings).unwrap();
    let request = fetcher.request_identity(&format!("{}/private", server.uri()));
    assert_eq!(
        request.headers().get("x-token").map(String::as_str),
        Some("secret")
    );

    let page = fetcher.fetch(&request).await.expect("fetch ok");
    assert_eq!(page.body, b"<p>in</p>");
}

#[tokio::test]
async fn not_found_is_permanent_and_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(FetchSettings::default()).unwrap();

    let missing = fetcher.request_identity(&format!("{}/missing", server.uri()));
    let err = fetcher.fetch(&missing).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::HttpStatus(404));
    assert!(!err.is_transient());

    let broken = fetcher.request_identity(&format!("{}/broken", server.uri()));
    let err = fetcher.fetch(&broken).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::HttpStatus(503));
    assert!(err.is_transient());
}

#[tokio::test]
async fn fetcher_times_out_on_slow_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(250))
                .set_body_string("slow"),
        )
        .mount(&server)
        .await;

    let settings = FetchSettings {
        request_timeout: Duration::from_millis(50),
        ..FetchSettings::default()
    };
    let fetcher = ReqwestFetcher::new(settings).unwrap();
    let request = fetcher.request_identity(&format!("{}/slow", server.uri()));

    let err = fetcher.fetch(&request).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Timeout);
    assert!(err.is_transient());
}

#[tokio::test]
async fn fetcher_rejects_too_large_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/large"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .insert_header("Content-Length", "11")
                .set_body_string("01234567890"),
        )
        .mount(&server)
        .await;

    let settings = FetchSettings {
        max_bytes: 10,
        ..FetchSettings::default()
    };
    let fetcher = ReqwestFetcher::new(settings).unwrap();
    let request = fetcher.request_identity(&format!("{}/large", server.uri()));

    let err = fetcher.fetch(&request).await.unwrap_err();
    assert_eq!(
        err.kind,
        FailureKind::TooLarge {
            max_bytes: 10,
            actual: Some(11)
        }
    );
    assert!(!err.is_transient());
}

#[tokio::test]
async fn fetcher_rejects_disallowed_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/image"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 4], "image/png"))
        .mount(&server)
        .await;

    let fetcher = ReqwestFetcher::new(FetchSettings::default()).unwrap();
    let request = fetcher.request_identity(&format!("{}/image", server.uri()));

    let err = fetcher.fetch(&request).await.unwrap_err();
    assert_eq!(
        err.kind,
        FailureKind::UnsupportedContentType {
            content_type: "image/png".into()
        }
    );
}

#[tokio::test]
async fn invalid_url_fails_without_network() {
    let fetcher = ReqwestFetcher::new(FetchSettings::default()).unwrap();
    let request = fetcher.request_identity("not a url");

    let err = fetcher.fetch(&request).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::InvalidUrl);
}
