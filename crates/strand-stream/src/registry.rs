use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use strand_core::error::{Result, StrandError};

use crate::buffer::{BufferListener, DataBuffer};
use crate::chunk::FlowDataChunk;

/// Registry of named buffers shared by every step of an engine.
#[derive(Default)]
pub struct BufferRegistry {
    buffers: Mutex<HashMap<String, Arc<DataBuffer>>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the buffer `id` for writing.
    pub fn acquire_buffer(&self, id: &str) -> BufferWriter {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = buffers
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(buffer = %id, "Buffer created");
                Arc::new(DataBuffer::new(id))
            })
            .clone();
        BufferWriter {
            buffer,
            source_step: None,
        }
    }

    /// A read handle on an existing buffer.
    pub fn get_buffer(&self, id: &str) -> Option<BufferReader> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.get(id).cloned().map(|buffer| BufferReader { buffer })
    }

    /// Like [`get_buffer`](Self::get_buffer), failing when the buffer is unknown.
    pub fn require_buffer(&self, id: &str) -> Result<BufferReader> {
        self.get_buffer(id)
            .ok_or_else(|| StrandError::buffer(id, "no such buffer"))
    }

    /// Remove and close the buffer `id`. Returns whether it existed.
    pub fn release_buffer(&self, id: &str) -> bool {
        let removed = self
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(buffer) => {
                buffer.close();
                debug!(buffer = %id, "Buffer released");
                true
            }
            None => false,
        }
    }

    pub fn has_buffer(&self, id: &str) -> bool {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn buffer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// Pushable handle returned by [`BufferRegistry::acquire_buffer`].
#[derive(Clone)]
pub struct BufferWriter {
    buffer: Arc<DataBuffer>,
    source_step: Option<String>,
}

impl BufferWriter {
    pub fn id(&self) -> &str {
        self.buffer.id()
    }

    /// Stamp every chunk pushed through this handle with `step`.
    pub fn for_step(mut self, step: impl Into<String>) -> Self {
        self.source_step = Some(step.into());
        self
    }

    pub fn push(&self, mut chunk: FlowDataChunk) -> Result<()> {
        if chunk.source_step.is_none() {
            chunk.source_step.clone_from(&self.source_step);
        }
        self.buffer.push(chunk)
    }

    pub fn fragment(&self, payload: Value) -> Result<()> {
        self.push(FlowDataChunk::json(self.id(), payload))
    }

    pub fn text(&self, text: impl Into<String>) -> Result<()> {
        self.push(FlowDataChunk::text(self.id(), text))
    }

    pub fn done(&self, payload: Value) -> Result<()> {
        self.push(FlowDataChunk::done(self.id(), payload))
    }

    pub fn error(&self, cause: &StrandError) -> Result<()> {
        self.push(FlowDataChunk::error(self.id(), cause))
    }

    pub fn cancel(&self) -> Result<()> {
        self.push(FlowDataChunk::cancelled(self.id()))
    }

    pub fn timeout(&self) -> Result<()> {
        self.push(FlowDataChunk::timeout(self.id()))
    }

    pub fn reader(&self) -> BufferReader {
        BufferReader {
            buffer: self.buffer.clone(),
        }
    }
}

/// Listenable handle returned by [`BufferRegistry::get_buffer`].
#[derive(Clone)]
pub struct BufferReader {
    buffer: Arc<DataBuffer>,
}

impl BufferReader {
    pub fn id(&self) -> &str {
        self.buffer.id()
    }

    pub fn subscribe(&self) -> BufferListener {
        self.buffer.subscribe()
    }

    pub async fn on_receive<F>(&self, listener: F) -> usize
    where
        F: FnMut(FlowDataChunk),
    {
        self.buffer.on_receive(listener).await
    }

    pub fn spawn_listener<F>(&self, listener: F) -> JoinHandle<usize>
    where
        F: FnMut(FlowDataChunk) + Send + 'static,
    {
        self.buffer.spawn_listener(listener)
    }

    /// Collect every chunk until the stream terminates.
    pub async fn collect(&self) -> Vec<FlowDataChunk> {
        let mut chunks = Vec::new();
        self.on_receive(|c| chunks.push(c)).await;
        chunks
    }

    pub fn snapshot(&self) -> Vec<FlowDataChunk> {
        self.buffer.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.buffer.is_finished()
    }
}
