//! End-to-end pipeline scenarios, run against the real HTTP server and
//! a small in-process stub standing in for both the origin and the
//! upstream transform service. Mirrors scenarios S1-S6 from the design
//! notes; S2/S3 share one test since S3 ranges over the entry S2
//! establishes. Byte counts for S1-S3 are the scenario's own numbers
//! (2 MiB / 14 MiB / a 5 MiB+5 MiB+4,194,304-byte chunk split); S4-S6
//! use small surrogate sizes since their point is concurrency and
//! routing behavior, not payload size.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use threshold::config::{Args, ConfigDocument};
use threshold::options::TransformOptions;
use threshold::origin::{OriginSpec, SourceSpec, SourceType};
use threshold::pipeline::ServiceContext;
use threshold::server::AppState;

// ---- stub origin / transform service -------------------------------------

#[derive(Clone)]
struct StubConfig {
    get_body: Bytes,
    content_type: &'static str,
    head_content_length: Option<u64>,
    get_delay: Duration,
}

struct StubState {
    config: StubConfig,
    fetch_count: AtomicUsize,
}

async fn spawn_stub(config: StubConfig) -> (SocketAddr, Arc<StubState>) {
    let state = Arc::new(StubState { config, fetch_count: AtomicUsize::new(0) });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let st = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            let st = Arc::clone(&st);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let st = Arc::clone(&st);
                    async move { stub_handler(st, req).await }
                });
                let _ = http1::Builder::new().serve_connection(io, svc).await;
            });
        }
    });
    (addr, state)
}

async fn stub_handler(state: Arc<StubState>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() == Method::HEAD {
        let mut builder = Response::builder();
        if let Some(len) = state.config.head_content_length {
            builder = builder.header(hyper::header::CONTENT_LENGTH, len.to_string());
        }
        return Ok(builder.body(Full::new(Bytes::new())).unwrap());
    }

    state.fetch_count.fetch_add(1, Ordering::SeqCst);
    if !state.config.get_delay.is_zero() {
        tokio::time::sleep(state.config.get_delay).await;
    }
    Ok(Response::builder()
        .header(hyper::header::CONTENT_TYPE, state.config.content_type)
        .header(hyper::header::CONTENT_LENGTH, state.config.get_body.len().to_string())
        .body(Full::new(state.config.get_body.clone()))
        .unwrap())
}

// ---- threshold server under test ------------------------------------------

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

async fn spawn_proxy(document: ConfigDocument, patch: impl FnOnce(&mut Args)) -> SocketAddr {
    let mut args = Args::parse_from(["threshold"]);
    patch(&mut args);
    args.listen = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let addr = args.listen;

    let ctx = ServiceContext::new(args, document);
    let state = Arc::new(AppState::new(ctx));
    tokio::spawn(threshold::run(state));
    wait_until_accepting(addr).await;
    addr
}

async fn wait_until_accepting(addr: SocketAddr) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server at {addr} never came up");
}

fn origin(name: &str, matcher: &str, base_url: &str) -> OriginSpec {
    OriginSpec {
        name: name.to_string(),
        matcher: matcher.to_string(),
        capture_groups: None,
        sources: vec![SourceSpec { source_type: SourceType::Remote, url: Some(base_url.to_string()), auth: None, priority: 0 }],
        defaults: None,
        auth: None,
    }
}

// ---- S1: single-entry store then hit --------------------------------------

#[tokio::test]
async fn s1_single_entry_store_then_hit() {
    let body = Bytes::from(vec![0x11u8; 2 * 1024 * 1024]);
    let (stub_addr, stub) = spawn_stub(StubConfig {
        get_body: body.clone(),
        content_type: "video/mp4",
        head_content_length: Some(body.len() as u64),
        get_delay: Duration::ZERO,
    })
    .await;

    let mut derivatives = HashMap::new();
    derivatives.insert(
        "mobile".to_string(),
        TransformOptions { width: Some(480), height: Some(360), quality: Some(threshold::options::Quality::Medium), ..Default::default() },
    );
    let document = ConfigDocument {
        origins: vec![origin("videos1", r"^/videos/sample1\.mp4$", &format!("http://{stub_addr}"))],
        derivatives,
        ..Default::default()
    };
    let addr = spawn_proxy(document, |_| {}).await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/videos/sample1.mp4?derivative=mobile");

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    assert_eq!(first.headers().get("x-video-chunked").unwrap(), "false");
    assert_eq!(first.headers().get("x-kv-cache-key").unwrap(), "video:videos/sample1.mp4:derivative=mobile");
    let first_body = first.bytes().await.unwrap();
    assert_eq!(first_body.len(), body.len());
    assert!(first_body.iter().all(|&b| b == 0x11));

    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::OK);
    assert_eq!(second.headers().get("x-cache-status").unwrap(), "HIT");
    assert_eq!(second.headers().get("x-cache-source").unwrap(), "KV");
    assert_eq!(second.headers().get("x-video-storage").unwrap(), "single");
    assert!(second.headers().get(reqwest::header::CACHE_CONTROL).unwrap().to_str().unwrap().starts_with("public, max-age="));
    assert!(second.headers().contains_key("x-kv-cache-age"));
    assert!(second.headers().contains_key("x-kv-cache-ttl"));
    let second_body = second.bytes().await.unwrap();
    assert_eq!(second_body, first_body);

    assert_eq!(stub.fetch_count.load(Ordering::SeqCst), 1, "upstream transform should only run once");
}

// ---- S2 + S3: chunked store, then a satisfiable range slice ---------------

#[tokio::test]
async fn s2_chunked_store_then_s3_range_slice() {
    let total = 14 * 1024 * 1024usize;
    let mut raw = vec![0u8; total];
    for (i, b) in raw.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let body = Bytes::from(raw);

    let (stub_addr, stub) = spawn_stub(StubConfig {
        get_body: body.clone(),
        content_type: "video/mp4",
        head_content_length: Some(body.len() as u64),
        get_delay: Duration::ZERO,
    })
    .await;

    let document = ConfigDocument { origins: vec![origin("videos2", r"^/videos/big2\.mp4$", &format!("http://{stub_addr}"))], ..Default::default() };
    let addr = spawn_proxy(document, |args| {
        args.single_entry_max_bytes = 1024 * 1024;
        args.standard_chunk_size_bytes = 5 * 1024 * 1024;
    })
    .await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/videos/big2.mp4");

    let full = client.get(&url).send().await.unwrap();
    assert_eq!(full.status(), reqwest::StatusCode::OK);
    assert_eq!(full.headers().get("x-video-chunked").unwrap(), "true");
    assert_eq!(full.headers().get("x-video-storage").unwrap(), "chunked");
    assert_eq!(full.headers().get("x-video-total-size").unwrap(), "14680064");
    // No derivative, no explicit params -- the key has no trailing colon.
    assert_eq!(full.headers().get("x-kv-cache-key").unwrap(), "video:videos/big2.mp4");
    let full_body = full.bytes().await.unwrap();
    assert_eq!(full_body.len(), total);
    assert_eq!(full_body, body);

    let ranged = client.get(&url).header(reqwest::header::RANGE, "bytes=5242880-10485759").send().await.unwrap();
    assert_eq!(ranged.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(ranged.headers().get(reqwest::header::CONTENT_RANGE).unwrap(), "bytes 5242880-10485759/14680064");
    assert_eq!(ranged.headers().get(reqwest::header::CONTENT_LENGTH).unwrap(), "5242880");
    let slice = ranged.bytes().await.unwrap();
    assert_eq!(slice.len(), 5_242_880);
    assert_eq!(slice, body.slice(5_242_880..=10_485_759));

    assert_eq!(stub.fetch_count.load(Ordering::SeqCst), 1, "the range request must be served from the cached chunks, not re-fetched");
}

// ---- S4: concurrent requests for the same uncached path coalesce ----------

#[tokio::test]
async fn s4_concurrent_misses_coalesce_to_one_upstream_fetch() {
    let body = Bytes::from_static(b"coalesced video bytes");
    let (stub_addr, stub) = spawn_stub(StubConfig {
        get_body: body.clone(),
        content_type: "video/mp4",
        head_content_length: Some(body.len() as u64),
        get_delay: Duration::from_millis(150),
    })
    .await;

    let document = ConfigDocument { origins: vec![origin("videos4", r"^/videos/new4\.mp4$", &format!("http://{stub_addr}"))], ..Default::default() };
    let addr = spawn_proxy(document, |_| {}).await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/videos/new4.mp4");

    let (a, b) = tokio::join!(client.get(&url).send(), client.get(&url).send());
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.status(), reqwest::StatusCode::OK);
    assert_eq!(b.status(), reqwest::StatusCode::OK);
    let a_body = a.bytes().await.unwrap();
    let b_body = b.bytes().await.unwrap();
    assert_eq!(a_body, body);
    assert_eq!(b_body, body);

    assert_eq!(stub.fetch_count.load(Ordering::SeqCst), 1, "concurrent requests for the same transform must coalesce to one upstream fetch");
}

// ---- S5: oversized source bypasses transform+cache entirely ---------------

#[tokio::test]
async fn s5_oversized_source_bypasses_cache() {
    let body = Bytes::from(vec![0x55u8; 5000]);
    let (stub_addr, stub) = spawn_stub(StubConfig {
        get_body: body.clone(),
        content_type: "video/mp4",
        head_content_length: Some(5000),
        get_delay: Duration::ZERO,
    })
    .await;

    let document = ConfigDocument { origins: vec![origin("videos5", r"^/videos/huge5\.mp4$", &format!("http://{stub_addr}"))], ..Default::default() };
    let addr = spawn_proxy(document, |args| {
        args.oversized_ceiling_bytes = 1000;
    })
    .await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/videos/huge5.mp4");

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers().get("x-video-exceeds-256mib").unwrap(), "true");
    assert_eq!(resp.headers().get("x-direct-stream").unwrap(), "true");
    let resp_body = resp.bytes().await.unwrap();
    assert_eq!(resp_body, body);

    // A second identical request must hit the origin again -- the bypass
    // path never touches the cache.
    let _ = client.get(&url).send().await.unwrap();
    assert_eq!(stub.fetch_count.load(Ordering::SeqCst), 2);
}

// ---- S6: imwidth-based derivative autoselect shares one cache key ---------

#[tokio::test]
async fn s6_imwidth_autoselect_shares_cache_key_across_values() {
    let body = Bytes::from(vec![0x66u8; 1024]);
    let (stub_addr, stub) = spawn_stub(StubConfig {
        get_body: body.clone(),
        content_type: "video/mp4",
        head_content_length: Some(1024),
        get_delay: Duration::ZERO,
    })
    .await;

    let mut derivatives = HashMap::new();
    derivatives.insert("mobile".to_string(), TransformOptions { width: Some(320), ..Default::default() });
    derivatives.insert("tablet".to_string(), TransformOptions { width: Some(480), ..Default::default() });
    derivatives.insert("desktop".to_string(), TransformOptions { width: Some(1920), ..Default::default() });

    let document = ConfigDocument {
        origins: vec![origin("videos6", r"^/videos/sample6\.mp4$", &format!("http://{stub_addr}"))],
        derivatives,
        ..Default::default()
    };
    let addr = spawn_proxy(document, |_| {}).await;

    let client = reqwest::Client::new();
    let first = client.get(format!("http://{addr}/videos/sample6.mp4?imwidth=500")).send().await.unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    assert_eq!(first.headers().get("x-video-derivative").unwrap(), "tablet");
    let key = first.headers().get("x-kv-cache-key").unwrap().to_str().unwrap().to_string();
    assert_eq!(key, "video:videos/sample6.mp4:derivative=tablet");

    let second = client.get(format!("http://{addr}/videos/sample6.mp4?imwidth=510")).send().await.unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::OK);
    assert_eq!(second.headers().get("x-kv-cache-key").unwrap().to_str().unwrap(), key);
    assert_eq!(second.headers().get("x-cache-status").unwrap(), "HIT");

    assert_eq!(stub.fetch_count.load(Ordering::SeqCst), 1, "both imwidth values should resolve to the same derivative and cache entry");
}

// ---- cache bypass: a configured query parameter skips the KV cache --------

#[tokio::test]
async fn bypass_query_parameter_skips_the_cache_and_never_coalesces() {
    let body = Bytes::from(vec![0x77u8; 1024]);
    let (stub_addr, stub) = spawn_stub(StubConfig {
        get_body: body.clone(),
        content_type: "video/mp4",
        head_content_length: Some(1024),
        get_delay: Duration::ZERO,
    })
    .await;

    let document = ConfigDocument {
        origins: vec![origin("videos-bypass", r"^/videos/bypass\.mp4$", &format!("http://{stub_addr}"))],
        cache: threshold::config::CachePolicy { bypass_query_parameters: vec!["nocache".to_string()], ..Default::default() },
        ..Default::default()
    };
    let addr = spawn_proxy(document, |_| {}).await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/videos/bypass.mp4?nocache=1");

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    assert_eq!(first.headers().get("x-cache-status").unwrap(), "BYPASS");
    let first_body = first.bytes().await.unwrap();
    assert_eq!(first_body, body);

    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::OK);
    assert_eq!(second.headers().get("x-cache-status").unwrap(), "BYPASS");

    assert_eq!(stub.fetch_count.load(Ordering::SeqCst), 2, "bypass path never caches, every request re-fetches upstream");
}

// ---- ambient ops surface: health/version probes never hit the pipeline ---

#[tokio::test]
async fn healthz_and_version_answer_without_a_matching_origin() {
    let addr = spawn_proxy(ConfigDocument::default(), |_| {}).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("http://{addr}/healthz")).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    let health_json: serde_json::Value = serde_json::from_slice(&health.bytes().await.unwrap()).unwrap();
    assert_eq!(health_json["healthy"], true);

    let version = client.get(format!("http://{addr}/version")).send().await.unwrap();
    assert_eq!(version.status(), reqwest::StatusCode::OK);
    let version_json: serde_json::Value = serde_json::from_slice(&version.bytes().await.unwrap()).unwrap();
    assert_eq!(version_json["service"], "threshold");
}
