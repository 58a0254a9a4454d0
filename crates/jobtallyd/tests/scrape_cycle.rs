//! Exporter regression tests.
//!
//! Drives source, collector, store and router together and checks what
//! scrapers see across aggregation cycles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use jobtally_api::{build_router, ApiState, IdentityPolicy};
use jobtally_core::{DrainMode, FileSource, MemorySource, RecordSource};
use jobtally_metrics::{Collector, CycleOutcome, ExpositionOptions, SnapshotStore};
use parking_lot::Mutex;

struct Harness<S> {
    collector: Collector<S>,
    store: Arc<SnapshotStore>,
    router: Router,
}

fn harness<S: RecordSource>(source: S) -> Harness<S> {
    let store = Arc::new(SnapshotStore::new());
    let collector = Collector::new(source, store.clone(), Duration::from_secs(10));
    let state = ApiState::new(
        store.clone(),
        ExpositionOptions::default(),
        IdentityPolicy::default(),
    );
    Harness {
        collector,
        store,
        router: build_router(state),
    }
}

async fn scrape(router: &Router, peer: [u8; 4], user_agent: &str) -> (StatusCode, String) {
    let mut req = Request::builder()
        .uri("/metrics")
        .header("user-agent", user_agent)
        .body(Body::empty())
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((peer, 51000))));

    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn sample_lines(body: &str) -> Vec<&str> {
    body.lines().filter(|l| !l.starts_with('#')).collect()
}

async fn status_json(router: &Router) -> serde_json::Value {
    let req = Request::builder().uri("/status").body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Log sink for asserting on emitted diagnostics.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

#[tokio::test]
async fn variable_labels_render_as_separate_families() {
    let source = MemorySource::new([
        "host_1,job_A,{service_name=aaa,container_name=bbbb}",
        "host_1,job_A",
    ]);
    let mut h = harness(source);
    h.collector.run_cycle().unwrap();

    let (status, body) = scrape(&h.router, [10, 0, 0, 1], "Prometheus/2.45").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.matches("# TYPE log_host_job_count gauge").count(), 2);

    let samples = sample_lines(&body);
    assert_eq!(samples.len(), 2);
    assert!(samples.contains(&"log_host_job_count{host=\"host_1\",job=\"job_A\"} 1"));
    assert!(samples.contains(
        &"log_host_job_count{container_name=\"bbbb\",host=\"host_1\",job=\"job_A\",service_name=\"aaa\"} 1"
    ));
}

#[tokio::test]
async fn identical_lines_collapse_into_one_sample() {
    let mut h = harness(MemorySource::new(["host_3,job_B", "host_3,job_B", "host_3,job_B"]));
    h.collector.run_cycle().unwrap();

    let (_, body) = scrape(&h.router, [10, 0, 0, 1], "Prometheus/2.45").await;
    assert_eq!(
        sample_lines(&body),
        vec!["log_host_job_count{host=\"host_3\",job=\"job_B\"} 3"]
    );
}

#[tokio::test]
async fn scraper_reads_once_per_generation() {
    let source = MemorySource::new(["h,j"]);
    let mut h = harness(source);

    // Move the store to generation 5.
    for _ in 0..5 {
        h.collector.run_cycle().unwrap();
    }
    assert_eq!(h.store.generation(), 5);

    let (status, first) = scrape(&h.router, [10, 0, 0, 1], "I1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!first.is_empty());

    let (status, second) = scrape(&h.router, [10, 0, 0, 1], "I1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(second.is_empty());

    assert_eq!(
        h.collector.run_cycle().unwrap(),
        CycleOutcome::Published { generation: 6, keys: 1 }
    );
    let (_, third) = scrape(&h.router, [10, 0, 0, 1], "I1").await;
    assert_eq!(third, first);
}

#[tokio::test]
async fn distinct_scrapers_each_get_data() {
    let mut h = harness(MemorySource::new(["h,j"]));
    h.collector.run_cycle().unwrap();

    let (_, a) = scrape(&h.router, [10, 0, 0, 1], "Prometheus/2.45").await;
    let (_, b) = scrape(&h.router, [10, 0, 0, 2], "Prometheus/2.45").await;
    let (_, c) = scrape(&h.router, [10, 0, 0, 1], "vmagent").await;
    assert!(!a.is_empty());
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert_eq!(h.store.admitted_scrapers(), 3);
}

#[tokio::test]
async fn malformed_line_is_dropped_and_counted() {
    let mut h = harness(MemorySource::new(["host_9", "host_1,job_A"]));
    h.collector.run_cycle().unwrap();

    let (_, body) = scrape(&h.router, [10, 0, 0, 1], "prom").await;
    assert!(!body.contains("host_9"));
    assert_eq!(sample_lines(&body).len(), 1);

    let json = status_json(&h.router).await;
    assert_eq!(json["data"]["stats"]["dropped_lines"], 1);
    assert_eq!(json["data"]["stats"]["records"], 1);
}

#[test]
fn malformed_line_emits_warning() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    let mut h = harness(MemorySource::new(["host_9", "host_1,job_A"]));
    let outcome = tracing::subscriber::with_default(subscriber, || h.collector.run_cycle());
    assert_eq!(outcome.unwrap(), CycleOutcome::Published { generation: 1, keys: 1 });

    let logs = logs.contents();
    let warning = logs
        .lines()
        .find(|l| l.contains("dropping line without host and job"))
        .expect("dropped line is reported");
    assert!(warning.contains("WARN"));
    assert!(warning.contains("host_9"));
}

#[tokio::test]
async fn unavailable_source_keeps_serving_previous_generation() {
    let source = MemorySource::new(["h1,j1", "h1,j1,zone=a"]);
    let mut h = harness(source.clone());
    h.collector.run_cycle().unwrap();
    let (_, before) = scrape(&h.router, [10, 0, 0, 1], "prom").await;

    source.set_unavailable();
    assert_eq!(
        h.collector.run_cycle().unwrap(),
        CycleOutcome::Stale { generation: 1 }
    );
    assert_eq!(h.store.generation(), 1);

    // A scraper that has not read generation 1 yet still gets it in full.
    let (status, after) = scrape(&h.router, [10, 0, 0, 2], "prom").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after, before);
}

#[tokio::test]
async fn nothing_published_yet_serves_empty_body() {
    let h = harness(MemorySource::unavailable());
    let (status, body) = scrape(&h.router, [10, 0, 0, 1], "prom").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn missing_user_agent_uses_placeholder_identity() {
    let mut h = harness(MemorySource::new(["h,j"]));
    h.collector.run_cycle().unwrap();

    let req = || {
        let mut req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 1234))));
        req
    };
    let first = h.router.clone().oneshot(req()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let second = h.router.clone().oneshot(req()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn truncating_file_source_counts_new_lines_per_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data_collect.csv");
    std::fs::write(&path, "h1,j1\nh1,j1\n").unwrap();

    let mut h = harness(FileSource::new(&path, DrainMode::Truncate));
    h.collector.run_cycle().unwrap();
    let (_, body) = scrape(&h.router, [10, 0, 0, 1], "prom").await;
    assert_eq!(sample_lines(&body), vec!["log_host_job_count{host=\"h1\",job=\"j1\"} 2"]);

    std::fs::write(&path, "h2,j2\n").unwrap();
    h.collector.run_cycle().unwrap();
    let (_, body) = scrape(&h.router, [10, 0, 0, 1], "prom").await;
    assert_eq!(sample_lines(&body), vec!["log_host_job_count{host=\"h2\",job=\"j2\"} 1"]);
}

#[tokio::test]
async fn missing_file_is_a_stale_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(FileSource::new(dir.path().join("absent.csv"), DrainMode::Retain));
    assert_eq!(
        h.collector.run_cycle().unwrap(),
        CycleOutcome::Stale { generation: 0 }
    );
}

#[tokio::test]
async fn healthz_responds() {
    let h = harness(MemorySource::unavailable());
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let resp = h.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn undecodable_line_does_not_stall_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data_collect.csv");
    std::fs::write(&path, b"h1,j1\nh2,j2\nh3,\xff\xfe\n").unwrap();

    let mut h = harness(FileSource::new(&path, DrainMode::Retain));
    for generation in 1..=3 {
        assert_eq!(
            h.collector.run_cycle().unwrap(),
            CycleOutcome::Published { generation, keys: 2 }
        );
    }
    assert_eq!(h.store.generation(), 3);

    let (_, body) = scrape(&h.router, [10, 0, 0, 1], "prom").await;
    assert_eq!(sample_lines(&body).len(), 2);
    let json = status_json(&h.router).await;
    assert_eq!(json["data"]["stats"]["dropped_lines"], 1);
    assert_eq!(json["data"]["stats"]["records"], 2);
}
