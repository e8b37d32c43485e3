use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use strand_core::error::{Result, StrandError};

use crate::chunk::FlowDataChunk;

/// A named buffer retaining every pushed chunk in arrival order.
///
/// Listeners attached at any time first receive the full history, then live
/// chunks, until a terminal chunk is delivered and they are detached.
pub struct DataBuffer {
    id: String,
    inner: Mutex<BufferInner>,
}

#[derive(Default)]
struct BufferInner {
    history: Vec<FlowDataChunk>,
    listeners: Vec<mpsc::UnboundedSender<FlowDataChunk>>,
    /// A terminal chunk has been pushed.
    finished: bool,
    closed: bool,
}

impl DataBuffer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(BufferInner::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Retain `chunk` and deliver it to every attached listener.
    pub fn push(&self, mut chunk: FlowDataChunk) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StrandError::buffer(&self.id, "buffer is closed"));
        }
        if inner.finished {
            return Err(StrandError::buffer(&self.id, "stream already terminated"));
        }

        chunk.buffer_id.clone_from(&self.id);
        let terminal = chunk.is_terminal();

        // Drop listeners whose receiving side went away
        inner.listeners.retain(|tx| tx.send(chunk.clone()).is_ok());
        inner.history.push(chunk);

        if terminal {
            inner.finished = true;
            inner.listeners.clear();
            debug!(buffer = %self.id, chunks = inner.history.len(), "Buffer stream terminated");
        }
        Ok(())
    }

    /// Attach a listener. Retained chunks are queued before any live chunk.
    pub fn subscribe(&self) -> BufferListener {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in &inner.history {
            let _ = tx.send(chunk.clone());
        }
        // A finished or closed buffer has nothing more to send; dropping `tx`
        // ends the listener once the history is drained.
        if !inner.finished && !inner.closed {
            inner.listeners.push(tx);
        }
        BufferListener { rx }
    }

    /// Deliver every chunk to `listener`, waiting for live chunks until the
    /// stream terminates or the buffer is closed. Returns the number delivered.
    pub async fn on_receive<F>(&self, mut listener: F) -> usize
    where
        F: FnMut(FlowDataChunk),
    {
        let mut rx = self.subscribe();
        let mut delivered = 0;
        while let Some(chunk) = rx.recv().await {
            listener(chunk);
            delivered += 1;
        }
        delivered
    }

    /// Like [`on_receive`](Self::on_receive), but delivers on a separate task
    /// so the caller is never blocked.
    pub fn spawn_listener<F>(&self, mut listener: F) -> JoinHandle<usize>
    where
        F: FnMut(FlowDataChunk) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut delivered = 0;
            while let Some(chunk) = rx.recv().await {
                listener(chunk);
                delivered += 1;
            }
            debug!(buffer = %id, delivered, "Buffer listener detached");
            delivered
        })
    }

    /// Discard retained chunks and detach all listeners without notifying them.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        if !inner.finished && !inner.listeners.is_empty() {
            warn!(
                buffer = %self.id,
                listeners = inner.listeners.len(),
                "Closing buffer with attached listeners"
            );
        }
        inner.history.clear();
        inner.listeners.clear();
        inner.closed = true;
    }

    /// Number of retained chunks.
    pub fn len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Copy of the retained chunks.
    pub fn snapshot(&self) -> Vec<FlowDataChunk> {
        self.lock().history.clone()
    }
}

/// Receiving side of one buffer subscription.
pub struct BufferListener {
    rx: mpsc::UnboundedReceiver<FlowDataChunk>,
}

impl BufferListener {
    /// Next chunk, or `None` once the stream terminated or the buffer closed.
    pub async fn recv(&mut self) -> Option<FlowDataChunk> {
        self.rx.recv().await
    }
}

impl Stream for BufferListener {
    type Item = FlowDataChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuffer").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Arc;
    use serde_json::json;

    #[tokio::test]
    async fn test_late_listener_gets_history_first() {
        let buf = DataBuffer::new("b1");
        for i in 0..3 {
            buf.push(FlowDataChunk::json("b1", json!(i))).unwrap();
        }

        let mut listener = buf.subscribe();
        buf.push(FlowDataChunk::json("b1", json!(3))).unwrap();
        buf.push(FlowDataChunk::done("b1", json!("end"))).unwrap();

        let mut payloads = Vec::new();
        while let Some(chunk) = listener.recv().await {
            payloads.push(chunk.payload);
        }
        assert_eq!(
            payloads,
            vec![json!(0), json!(1), json!(2), json!(3), json!("end")]
        );
    }

    #[tokio::test]
    async fn test_each_listener_receives_full_history() {
        let buf = DataBuffer::new("b");
        buf.push(FlowDataChunk::text("b", "a")).unwrap();
        let first = buf.subscribe();
        buf.push(FlowDataChunk::text("b", "b")).unwrap();
        let second = buf.subscribe();
        buf.push(FlowDataChunk::done("b", json!(null))).unwrap();

        let a: Vec<_> = first.collect().await;
        let b: Vec<_> = second.collect().await;
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_terminal_detaches_listeners() {
        let buf = DataBuffer::new("b");
        let _listener = buf.subscribe();
        assert_eq!(buf.listener_count(), 1);

        buf.push(FlowDataChunk::cancelled("b")).unwrap();
        assert_eq!(buf.listener_count(), 0);
        assert!(buf.is_finished());
        assert!(buf.push(FlowDataChunk::text("b", "late")).is_err());
    }

    #[tokio::test]
    async fn test_close_discards_without_notifying() {
        let buf = DataBuffer::new("b");
        buf.push(FlowDataChunk::text("b", "x")).unwrap();
        let mut listener = buf.subscribe();
        buf.close();

        // History queued before the close is still in the listener's channel,
        // but no terminal chunk is ever sent.
        let first = listener.recv().await.unwrap();
        assert!(!first.is_terminal());
        assert!(listener.recv().await.is_none());
        assert!(buf.is_empty());
        assert!(buf.push(FlowDataChunk::text("b", "y")).is_err());
    }

    #[tokio::test]
    async fn test_on_receive_waits_for_live_chunks() {
        let buf = Arc::new(DataBuffer::new("live"));
        let producer = buf.clone();
        tokio::spawn(async move {
            for i in 0..2 {
                tokio::task::yield_now().await;
                producer.push(FlowDataChunk::json("live", json!(i))).unwrap();
            }
            producer.push(FlowDataChunk::done("live", json!(2))).unwrap();
        });

        let mut seen = Vec::new();
        let count = buf.on_receive(|c| seen.push(c.payload)).await;
        assert_eq!(count, 3);
        assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_spawn_listener_runs_off_caller() {
        let buf = DataBuffer::new("s");
        let handle = buf.spawn_listener(|_| {});
        buf.push(FlowDataChunk::text("s", "a")).unwrap();
        buf.push(FlowDataChunk::done("s", json!(null))).unwrap();
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[test]
    fn test_push_rewrites_buffer_id() {
        let buf = DataBuffer::new("right");
        buf.push(FlowDataChunk::text("wrong", "x")).unwrap();
        assert_eq!(buf.snapshot()[0].buffer_id, "right");
    }
}
