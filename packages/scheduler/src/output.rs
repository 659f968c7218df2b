//! Output stream multiplexer: one job's response, fanned out to any number of
//! subscribers with replay for late joiners.

use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::sync::mpsc;

/// Content type recorded when the worker sends none.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
/// Content encoding recorded when the worker sends none.
pub const DEFAULT_CONTENT_ENCODING: &str = "identity";

/// Response headers echoed to subscribers and storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputHead {
    pub content_type: String,
    pub content_encoding: String,
}

impl Default for OutputHead {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content_encoding: DEFAULT_CONTENT_ENCODING.to_string(),
        }
    }
}

/// One item of an output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Head(OutputHead),
    Data(Bytes),
    End,
}

#[derive(Default)]
struct Inner {
    head: Option<OutputHead>,
    data: BytesMut,
    ended: bool,
    subscribers: Vec<mpsc::UnboundedSender<OutputEvent>>,
}

impl Inner {
    fn publish(&mut self, event: OutputEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Accumulating buffer of a job's output with live subscribers.
#[derive(Default)]
pub struct OutputBuffer {
    inner: Mutex<Inner>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the response headers.
    pub fn start(&self, head: OutputHead) {
        let mut inner = self.lock();
        if inner.ended {
            return;
        }
        inner.head = Some(head.clone());
        inner.publish(OutputEvent::Head(head));
    }

    /// Append a decoded chunk.
    pub fn push(&self, chunk: Bytes) {
        let mut inner = self.lock();
        if inner.ended || chunk.is_empty() {
            return;
        }
        inner.data.extend_from_slice(&chunk);
        inner.publish(OutputEvent::Data(chunk));
    }

    /// Mark the output complete and release all subscribers.
    pub fn end(&self) {
        let mut inner = self.lock();
        if inner.ended {
            return;
        }
        inner.ended = true;
        inner.publish(OutputEvent::End);
        inner.subscribers.clear();
    }

    /// Attach a subscriber. Headers and buffered bytes are replayed first.
    pub fn subscribe(&self) -> OutputStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        if let Some(head) = &inner.head {
            let _ = tx.send(OutputEvent::Head(head.clone()));
        }
        if !inner.data.is_empty() {
            let _ = tx.send(OutputEvent::Data(inner.data.clone().freeze()));
        }
        if inner.ended {
            let _ = tx.send(OutputEvent::End);
        } else {
            inner.subscribers.push(tx);
        }

        OutputStream { rx }
    }

    /// Headers, if the worker has answered.
    pub fn head(&self) -> Option<OutputHead> {
        self.lock().head.clone()
    }

    /// Everything received so far.
    pub fn snapshot(&self) -> Bytes {
        self.lock().data.clone().freeze()
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }
}

/// A subscriber's view of a job's output.
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<OutputEvent>,
}

impl OutputStream {
    pub async fn next_event(&mut self) -> Option<OutputEvent> {
        self.rx.recv().await
    }

    /// Drain the stream, returning the headers and the concatenated body.
    pub async fn read_to_end(mut self) -> (Option<OutputHead>, Vec<u8>) {
        let mut head = None;
        let mut body = Vec::new();
        while let Some(event) = self.rx.recv().await {
            match event {
                OutputEvent::Head(h) => head = Some(h),
                OutputEvent::Data(chunk) => body.extend_from_slice(&chunk),
                OutputEvent::End => break,
            }
        }
        (head, body)
    }
}

impl Stream for OutputStream {
    type Item = OutputEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn live_subscribers_see_every_event() {
        let buffer = OutputBuffer::new();
        let mut first = buffer.subscribe();
        let second = buffer.subscribe();

        buffer.start(OutputHead::default());
        buffer.push(Bytes::from_static(b"hello "));
        buffer.push(Bytes::from_static(b"world"));
        buffer.end();

        assert_eq!(
            first.next_event().await,
            Some(OutputEvent::Head(OutputHead::default()))
        );
        assert_eq!(
            first.next_event().await,
            Some(OutputEvent::Data(Bytes::from_static(b"hello ")))
        );

        let (head, body) = second.read_to_end().await;
        assert_eq!(head, Some(OutputHead::default()));
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay() {
        let buffer = OutputBuffer::new();
        let head = OutputHead {
            content_type: "application/json".into(),
            content_encoding: "identity".into(),
        };
        buffer.start(head.clone());
        buffer.push(Bytes::from_static(b"{\"a\":"));

        let mut late = buffer.subscribe();
        buffer.push(Bytes::from_static(b"1}"));
        buffer.end();

        let events: Vec<_> = (&mut late).collect().await;
        assert_eq!(
            events,
            vec![
                OutputEvent::Head(head),
                OutputEvent::Data(Bytes::from_static(b"{\"a\":")),
                OutputEvent::Data(Bytes::from_static(b"1}")),
                OutputEvent::End,
            ]
        );
        assert_eq!(buffer.snapshot(), Bytes::from_static(b"{\"a\":1}"));
    }

    #[tokio::test]
    async fn subscribing_after_end_replays_and_closes() {
        let buffer = OutputBuffer::new();
        buffer.end();
        buffer.push(Bytes::from_static(b"ignored"));

        let (head, body) = buffer.subscribe().read_to_end().await;
        assert_eq!(head, None);
        assert!(body.is_empty());
        assert!(buffer.is_ended());
    }
}
