//! Sequenced progress emission with a single terminal event per stream.
//!
//! The emitter side is cloned into pipelines; the [`EventStream`] side becomes the HTTP
//! response body. Dropping the body (client gone) cancels the request token, and dropping
//! the last emitter without a terminal event sends an `error` so the client never hangs.

use crate::error::{LoomError, LoomResult};
use crate::events::{ProgressEvent, SequencedEvent};
use futures_util::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

const UNTERMINATED: &str = "stream ended without completing";

struct Inner {
    tx: mpsc::Sender<SequencedEvent>,
    /// Serializes seq assignment with the send so wire order equals seq order.
    send_lock: Mutex<()>,
    seq: AtomicU64,
    terminated: AtomicBool,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = SequencedEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            event: ProgressEvent::Error {
                message: UNTERMINATED.to_string(),
            },
        };
        if self.tx.try_send(event).is_err() {
            tracing::debug!(target: "loom::emitter", "could not deliver fallback terminal event");
        }
    }
}

#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<Inner>,
}

/// Creates a connected emitter/stream pair bound to `cancel`.
pub fn channel(capacity: usize, cancel: CancellationToken) -> (EventEmitter, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let emitter = EventEmitter {
        inner: Arc::new(Inner {
            tx,
            send_lock: Mutex::new(()),
            seq: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            cancel: cancel.clone(),
        }),
    };
    let stream = EventStream {
        inner: ReceiverStream::new(rx),
        _cancel_on_drop: cancel.drop_guard(),
    };
    (emitter, stream)
}

impl EventEmitter {
    /// Sends `event`. Anything after a terminal event is dropped silently. A closed
    /// receiver cancels the request and yields [`LoomError::StreamTransport`].
    pub async fn emit(&self, event: ProgressEvent) -> LoomResult<()> {
        let _order = self.inner.send_lock.lock().await;
        if self.inner.terminated.load(Ordering::SeqCst) {
            tracing::debug!(target: "loom::emitter", event = event.name(), "dropping event after terminal");
            return Ok(());
        }
        if event.is_terminal() {
            self.inner.terminated.store(true, Ordering::SeqCst);
        }
        let sequenced = SequencedEvent {
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            event,
        };
        if self.inner.tx.send(sequenced).await.is_err() {
            self.inner.cancel.cancel();
            return Err(LoomError::StreamTransport("client disconnected".into()));
        }
        Ok(())
    }

    pub async fn progress(&self, current: usize, total: usize, message: impl Into<String>) -> LoomResult<()> {
        self.emit(ProgressEvent::progress(current, total, message)).await
    }

    pub async fn done(&self, result: Value) -> LoomResult<()> {
        self.emit(ProgressEvent::Done { result }).await
    }

    pub async fn error(&self, message: impl Into<String>) -> LoomResult<()> {
        self.emit(ProgressEvent::Error {
            message: message.into(),
        })
        .await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Emits `heartbeat` every `interval` until the returned guard drops.
    pub fn heartbeat(&self, interval: Duration) -> HeartbeatGuard {
        HeartbeatGuard::start(self.clone(), interval)
    }
}

/// Receiving half; cancels the request when dropped.
pub struct EventStream {
    inner: ReceiverStream<SequencedEvent>,
    _cancel_on_drop: DropGuard,
}

impl Stream for EventStream {
    type Item = SequencedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Periodic heartbeat task, aborted when the guard is dropped.
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    fn start(emitter: EventEmitter, interval: Duration) -> Self {
        let cancel = emitter.cancel_token().clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if emitter.is_terminated() {
                    break;
                }
                let timestamp = chrono::Utc::now().to_rfc3339();
                if emitter.emit(ProgressEvent::Heartbeat { timestamp }).await.is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
