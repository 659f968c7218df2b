//! One HTTP delivery attempt of a job to a worker.

use std::sync::Arc;
use std::time::Duration;

use pusher_core::{Job, Worker};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap};
use tokio::sync::oneshot;

use crate::output::{DEFAULT_CONTENT_ENCODING, DEFAULT_CONTENT_TYPE, OutputBuffer, OutputHead};

/// Configured retry limit, `0` for non-retryable jobs.
pub const RETRY_LIMIT_HEADER: &str = "x-retry-limit";
/// Retries so far, `0` for non-retryable jobs.
pub const RETRIED_HEADER: &str = "x-retried";
/// Response headers that, set to `failure`, flip the classification default.
pub const ASSUME_HEADERS: [&str; 2] = ["x-assume", "assume"];

/// Why an attempt failed outright.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("worker answered {0}")]
    Status(StatusCode),
    #[error("no completion within {0:?}")]
    TimedOut(Duration),
    #[error("aborted")]
    Aborted,
}

/// Everything a dispatch task needs, detached from scheduler state.
pub(crate) struct Attempt {
    pub job: Job,
    pub worker: Worker,
    pub retry_limit: u32,
    pub timeout: Duration,
    pub tail_bytes: usize,
    pub output: Arc<OutputBuffer>,
}

/// Run an attempt to completion. Delivery, the timeout and the cancel signal
/// race; whichever finishes first decides and the others are dropped.
///
/// Returns the classification of a 200 response.
pub(crate) async fn run(
    client: reqwest::Client,
    attempt: Attempt,
    cancel: oneshot::Receiver<()>,
) -> Result<bool, DispatchError> {
    let timeout = attempt.timeout;

    tokio::select! {
        result = deliver(&client, &attempt) => result,
        _ = tokio::time::sleep(timeout) => Err(DispatchError::TimedOut(timeout)),
        _ = cancel => Err(DispatchError::Aborted),
    }
}

async fn deliver(client: &reqwest::Client, attempt: &Attempt) -> Result<bool, DispatchError> {
    let job = &attempt.job;
    let (limit, retried) = if job.no_retry {
        (0, 0)
    } else {
        (attempt.retry_limit, job.retried)
    };

    let mut request = client
        .post(&attempt.worker.url)
        .header(RETRY_LIMIT_HEADER, limit.to_string())
        .header(RETRIED_HEADER, retried.to_string())
        .body(job.payload.clone());
    if let Some(payload_type) = &job.payload_type {
        request = request.header(CONTENT_TYPE, payload_type.as_str());
    }

    let mut response = request.send().await?;
    if response.status() != StatusCode::OK {
        return Err(DispatchError::Status(response.status()));
    }

    let headers = response.headers();
    let assume_failure = assumes_failure(headers);
    attempt.output.start(OutputHead {
        content_type: header_or(headers, CONTENT_TYPE.as_str(), DEFAULT_CONTENT_TYPE),
        // gzip bodies are decoded by the client, which also drops the header.
        content_encoding: header_or(headers, CONTENT_ENCODING.as_str(), DEFAULT_CONTENT_ENCODING),
    });

    let mut tail = Tail::new(attempt.tail_bytes);
    while let Some(chunk) = response.chunk().await? {
        tail.push(&chunk);
        attempt.output.push(chunk);
    }

    Ok(classify(tail.as_slice(), assume_failure))
}

fn header_or(headers: &HeaderMap, name: &str, default: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

fn assumes_failure(headers: &HeaderMap) -> bool {
    ASSUME_HEADERS.iter().any(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("failure"))
    })
}

/// Decide success from the trailing bytes of a response body.
///
/// By default a body succeeds unless it ends in `fail` or `failure`. When the
/// worker assumes failure, it succeeds only if it ends in `succ` or `success`.
/// Matching ignores case and trailing whitespace.
pub fn classify(tail: &[u8], assume_failure: bool) -> bool {
    let text = tail.trim_ascii_end().to_ascii_lowercase();
    if assume_failure {
        text.ends_with(b"success") || text.ends_with(b"succ")
    } else {
        !(text.ends_with(b"failure") || text.ends_with(b"fail"))
    }
}

/// Sliding window over the last `capacity` bytes of a stream.
#[derive(Debug)]
pub struct Tail {
    capacity: usize,
    buf: Vec<u8>,
}

impl Tail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Vec::with_capacity(capacity * 2),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.capacity {
            let excess = self.buf.len() - self.capacity;
            self.buf.drain(..excess);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_heuristic_fails_only_on_failure_words() {
        assert!(classify(b"all done", false));
        assert!(classify(b"", false));
        assert!(!classify(b"job failure", false));
        assert!(!classify(b"job FAIL \n", false));
        assert!(classify(b"failure avoided", false));
    }

    #[test]
    fn assume_failure_requires_success_words() {
        assert!(classify(b"...success", true));
        assert!(classify(b"step 3: Succ\r\n", true));
        assert!(!classify(b"all done", true));
        assert!(!classify(b"", true));
    }

    #[test]
    fn tail_keeps_only_the_last_bytes() {
        let mut tail = Tail::new(8);
        tail.push(b"abc");
        tail.push(b"defgh");
        assert_eq!(tail.as_slice(), b"abcdefgh");
        tail.push(b"ij");
        assert_eq!(tail.as_slice(), b"cdefghij");
        tail.push(b"0123456789");
        assert_eq!(tail.as_slice(), b"23456789");
    }

    #[test]
    fn tail_of_a_split_word_still_classifies() {
        let mut tail = Tail::new(50);
        let long = b"x".repeat(200);
        let chunks: [&[u8]; 3] = [&long, b"fai", b"lure\n"];
        for chunk in chunks {
            tail.push(chunk);
        }
        assert!(!classify(tail.as_slice(), false));
    }

    #[test]
    fn assume_header_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!assumes_failure(&headers));
        headers.insert("assume", "Failure".parse().unwrap());
        assert!(assumes_failure(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("x-assume", "success".parse().unwrap());
        assert!(!assumes_failure(&headers));
    }
}
