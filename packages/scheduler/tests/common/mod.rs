#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum::routing::post;
use tower_http::compression::CompressionLayer;

use db::{DbConfig, JobStore, StoreConfig};
use pusher_core::{Job, JobId, JobStatus, Topic};
use scheduler::{SchedulerConfig, SchedulerHandle, start_scheduler};

pub const GZIP_BODY_LINE: &str = "compiling module ... ok\n";
pub const STREAM_CHUNKS: [&str; 3] = ["step 1\n", "step 2\n", "all steps: success\n"];

/// One request seen by the fake worker.
#[derive(Debug, Clone)]
pub struct Hit {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Hit>>>);

impl Recorder {
    pub fn hits(&self) -> Vec<Hit> {
        self.0.lock().unwrap().clone()
    }

    pub fn hits_for(&self, path: &str) -> Vec<Hit> {
        self.hits().into_iter().filter(|h| h.path == path).collect()
    }

    fn record(&self, path: &str, headers: HeaderMap, body: Bytes) {
        self.0.lock().unwrap().push(Hit {
            path: path.to_string(),
            headers,
            body,
        });
    }
}

/// An HTTP worker on an ephemeral port.
pub struct FakeWorker {
    pub base_url: String,
    pub recorder: Recorder,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeWorker {
    pub async fn spawn() -> Self {
        let recorder = Recorder::default();
        let app = Router::new()
            .route("/ok", post(ok))
            .route("/fail", post(fail))
            .route("/failure-text", post(failure_text))
            .route("/assume", post(assume_without_success))
            .route("/assume-ok", post(assume_with_success))
            .route("/slow", post(slow))
            .route("/stream", post(stream))
            .route("/gzip", post(gzip).layer(CompressionLayer::new()))
            .with_state(recorder.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            recorder,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn ok(State(recorder): State<Recorder>, headers: HeaderMap, body: Bytes) -> &'static str {
    recorder.record("/ok", headers, body);
    "done: success"
}

async fn fail(State(recorder): State<Recorder>, headers: HeaderMap, body: Bytes) -> StatusCode {
    recorder.record("/fail", headers, body);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn failure_text(
    State(recorder): State<Recorder>,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    recorder.record("/failure-text", headers, body);
    "could not reach registry: FAILURE\n"
}

async fn assume_without_success(
    State(recorder): State<Recorder>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    recorder.record("/assume", headers, body);
    ([("x-assume", "failure")], "exited without a verdict")
}

async fn assume_with_success(
    State(recorder): State<Recorder>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    recorder.record("/assume-ok", headers, body);
    ([("assume", "failure")], "deployed: success\n")
}

async fn slow(State(recorder): State<Recorder>, headers: HeaderMap, body: Bytes) -> &'static str {
    recorder.record("/slow", headers, body);
    tokio::time::sleep(Duration::from_secs(60)).await;
    "late success"
}

async fn stream(State(recorder): State<Recorder>, headers: HeaderMap, body: Bytes) -> Response {
    recorder.record("/stream", headers, body);
    let chunks = futures_util::stream::unfold(0usize, |i| async move {
        if i >= STREAM_CHUNKS.len() {
            return None;
        }
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Some((Ok::<_, Infallible>(Bytes::from_static(STREAM_CHUNKS[i].as_bytes())), i + 1))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "text/x-log")
        .body(Body::from_stream(chunks))
        .unwrap()
}

async fn gzip(State(recorder): State<Recorder>, headers: HeaderMap, body: Bytes) -> String {
    recorder.record("/gzip", headers, body);
    gzip_body()
}

pub fn gzip_body() -> String {
    format!("{}build: success", GZIP_BODY_LINE.repeat(40))
}

/// Store settings that keep retry cycles short.
pub fn fast_store_config() -> StoreConfig {
    StoreConfig {
        min_retry_delay: Duration::from_millis(20),
        ..StoreConfig::default()
    }
}

/// Scheduler settings that keep timeouts and retention short.
pub fn fast_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        min_timeout: Duration::from_millis(200),
        retention: Duration::from_millis(500),
        ..SchedulerConfig::default()
    }
}

pub async fn start(topic: Option<Topic>) -> (JobStore, SchedulerHandle) {
    let db = db::connect(&DbConfig::memory()).await.unwrap();
    let store = JobStore::open(db, fast_store_config()).await.unwrap();
    if let Some(topic) = topic {
        store.save_topic(topic).await.unwrap();
    }
    let (scheduler, _handle) = start_scheduler(store.clone(), fast_scheduler_config())
        .await
        .unwrap();
    (store, scheduler)
}

/// Poll the store until the job reaches `status`.
pub async fn wait_for_status(
    store: &JobStore,
    id: JobId,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        let job = store.get_job(id).await.unwrap();
        if let Some(job) = job {
            if job.status == status {
                return job;
            }
            if Instant::now() >= deadline {
                panic!("job {} is {} after {:?}, expected {}", id, job.status, timeout, status);
            }
        } else if Instant::now() >= deadline {
            panic!("job {} vanished", id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
