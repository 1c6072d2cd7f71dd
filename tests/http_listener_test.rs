//! End-to-end tests for the HTTP capture listener

mod common;

use common::{action, predicate, Fixture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use vigil::listener::http::HttpListener;
use vigil::listener::{Limits, Listener};
use vigil::models::{Probe, ProbeResponse, Protocol};
use vigil::rules::Rule;
use vigil::storage::{RequestQuery, RequestStore};

async fn start(fx: &Fixture) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = HttpListener::from_listener(listener, Arc::clone(&fx.ctx), None).unwrap();
    let addr = http.local_addr();
    tokio::spawn(async move {
        let _ = http.run().await;
    });
    addr
}

/// Sends one raw request with `Connection: close` and returns the full response text
async fn send_raw(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut response))
        .await
        .expect("no HTTP response")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

fn status(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn get(host: &str, path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n")
}

#[tokio::test]
async fn test_request_to_zone_is_recorded() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    let addr = start(&fx).await;

    let body = "token=abc";
    let request = format!(
        "POST /cb?x=1 HTTP/1.1\r\nHost: img.alice.ssrf.uk:8080\r\nX-Probe: yes\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = send_raw(addr, &request).await;
    assert_eq!(status(&response), 200);

    assert!(fx.wait_for_records(1).await);
    let records = fx.store.query(&zone.fqdn, &RequestQuery::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.protocol, Protocol::Http);
    assert_eq!(record.fqdn, "img.alice.ssrf.uk");
    assert_eq!(record.reqsummary, "POST /cb?x=1");
    match &record.request {
        Probe::Http(h) => {
            assert_eq!(h.body, "token=abc");
            assert_eq!(h.query.as_deref(), Some("x=1"));
            assert_eq!(h.header("x-probe"), Some("yes"));
            assert!(!h.tls);
        }
        other => panic!("unexpected probe {:?}", other),
    }
}

#[tokio::test]
async fn test_unowned_host_is_not_found() {
    let fx = Fixture::new();
    fx.zone("alice");
    let addr = start(&fx).await;

    let response = send_raw(addr, &get("example.com", "/")).await;
    assert_eq!(status(&response), 404);

    let apex = send_raw(addr, &get("ssrf.uk", "/")).await;
    assert_eq!(status(&apex), 404);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.store.is_empty());
}

#[tokio::test]
async fn test_missing_host_is_bad_request() {
    let fx = Fixture::new();
    let addr = start(&fx).await;

    let response = send_raw(addr, "GET / HTTP/1.0\r\n\r\n").await;
    assert_eq!(status(&response), 400);
}

#[tokio::test]
async fn test_rule_overrides_response() {
    let fx = Fixture::new();
    let zone = fx.zone("alice");
    fx.rules.add_rule(
        Rule::new(
            &zone.fqdn,
            "teapot",
            Protocol::Http,
            0,
            &[
                predicate("http.path", "/brew"),
                action("http.status", "418"),
                action("http.header", "X-Served-By: vigil"),
                action("http.body", "short and stout"),
            ],
        )
        .unwrap(),
    );
    let addr = start(&fx).await;

    let response = send_raw(addr, &get("alice.ssrf.uk", "/brew")).await;
    assert_eq!(status(&response), 418);
    assert!(response.to_ascii_lowercase().contains("x-served-by: vigil"));
    assert!(response.ends_with("short and stout"));

    let fallthrough = send_raw(addr, &get("alice.ssrf.uk", "/other")).await;
    assert_eq!(status(&fallthrough), 200);

    assert!(fx.wait_for_records(2).await);
    let records = fx.store.query(&zone.fqdn, &RequestQuery::default()).await.unwrap();
    let teapot = records
        .iter()
        .find(|r| r.rule_matched.is_some())
        .expect("matched record");
    match &teapot.response {
        ProbeResponse::Http(h) => assert_eq!(h.status, 418),
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let mut fx = Fixture::new();
    let limits = Limits {
        max_http_body_bytes: 16,
        ..fx.ctx.limits.clone()
    };
    fx.ctx = Arc::new(vigil::listener::CaptureContext::new(
        Arc::clone(&fx.registry),
        Arc::clone(&fx.rules),
        Arc::clone(&fx.ctx.recorder),
        limits,
    ));
    fx.zone("alice");
    let addr = start(&fx).await;

    let body = "x".repeat(64);
    let request = format!(
        "POST / HTTP/1.1\r\nHost: alice.ssrf.uk\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = send_raw(addr, &request).await;
    assert_eq!(status(&response), 413);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.store.is_empty());
}
