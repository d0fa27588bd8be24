//! Full proxy against a mock GitHub server over real HTTP.

use bytes::Bytes;
use ghcache::{GhCacheBuilder, HttpTransport, HttpTransportConfig, RoundTrip};
use mockito::{Matcher, Server};
use std::sync::Arc;

fn get(path: &str, token: &str) -> http::Request<Bytes> {
    http::Request::get(path)
        .header("authorization", format!("token {}", token))
        .header("user-agent", "ghproxy-tests/1.0")
        .body(Bytes::new())
        .unwrap()
}

async fn proxy_for(server: &Server) -> ghcache::GhCache {
    let upstream = HttpTransport::new(&HttpTransportConfig::new(server.url())).unwrap();
    GhCacheBuilder::new().build(Arc::new(upstream)).await.unwrap()
}

#[tokio::test]
async fn test_miss_then_revalidated() {
    let mut server = Server::new_async().await;
    let fresh = server
        .mock("GET", "/repos/o/r")
        .match_header("if-none-match", Matcher::Missing)
        .match_header("authorization", "token a")
        .with_status(200)
        .with_header("etag", "\"abc\"")
        .with_header("x-ratelimit-remaining", "4999")
        .with_body(r#"{"full_name":"o/r"}"#)
        .expect(1)
        .create_async()
        .await;
    let not_modified = server
        .mock("GET", "/repos/o/r")
        .match_header("if-none-match", "\"abc\"")
        .with_status(304)
        .with_header("etag", "\"abc\"")
        .expect(1)
        .create_async()
        .await;

    let proxy = proxy_for(&server).await;

    let first = proxy.round_trip(get("/repos/o/r", "a")).await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers()["x-cache-mode"], "MISS");
    assert_eq!(first.headers()["cache-control"], "no-cache");
    assert!(first.headers().contains_key("x-prow-request-date"));

    let second = proxy.round_trip(get("/repos/o/r", "a")).await.unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.headers()["x-cache-mode"], "REVALIDATED");
    assert_eq!(second.body(), &Bytes::from_static(br#"{"full_name":"o/r"}"#));

    fresh.assert_async().await;
    not_modified.assert_async().await;
}

#[tokio::test]
async fn test_caller_conditional_request_changed() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/user")
        .match_header("if-none-match", "\"stale\"")
        .with_status(200)
        .with_header("etag", "\"new\"")
        .with_body("{}")
        .create_async()
        .await;

    let proxy = proxy_for(&server).await;
    let mut req = get("/user", "a");
    req.headers_mut().insert("if-none-match", "\"stale\"".parse().unwrap());
    let resp = proxy.round_trip(req).await.unwrap();
    assert_eq!(resp.headers()["x-cache-mode"], "CHANGED");
}

#[tokio::test]
async fn test_errors_are_not_stored() {
    let mut server = Server::new_async().await;
    let missing = server
        .mock("GET", "/repos/o/gone")
        .with_status(404)
        .with_body(r#"{"message":"Not Found"}"#)
        .expect(2)
        .create_async()
        .await;

    let proxy = proxy_for(&server).await;
    for _ in 0..2 {
        let resp = proxy.round_trip(get("/repos/o/gone", "a")).await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.headers()["x-cache-mode"], "NO-STORE");
    }
    missing.assert_async().await;
}

#[tokio::test]
async fn test_graphql_is_never_stored() {
    let mut server = Server::new_async().await;
    let graphql = server
        .mock("POST", "/graphql")
        .with_status(200)
        .with_body(r#"{"data":{}}"#)
        .create_async()
        .await;

    let proxy = proxy_for(&server).await;
    let req = http::Request::post("/graphql")
        .header("authorization", "token a")
        .body(Bytes::from_static(br#"{"query":"{ viewer { login } }"}"#))
        .unwrap();
    let resp = proxy.round_trip(req).await.unwrap();
    assert_eq!(resp.headers()["x-cache-mode"], "NO-STORE");
    graphql.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_upstream_is_an_error() {
    let upstream = HttpTransport::new(&HttpTransportConfig::new("http://127.0.0.1:1")).unwrap();
    let proxy = GhCacheBuilder::new().build(Arc::new(upstream)).await.unwrap();
    let err = proxy.round_trip(get("/user", "a")).await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {}", err);
}
