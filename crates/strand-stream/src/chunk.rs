use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_core::error::StrandError;
use strand_core::flow_data::FlowData;

/// How a chunk's payload should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Json,
    String,
    Binary,
    Raw,
}

/// Position of a chunk in its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Fragment,
    Done,
    Error,
    Cancelled,
    Timeout,
}

impl TransferStatus {
    /// Every status except `Fragment` ends the stream.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Fragment)
    }
}

/// One unit of data pushed into a buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDataChunk {
    pub buffer_id: String,
    pub data_kind: DataKind,
    pub transfer_status: TransferStatus,
    /// Binary payloads are stored as an array of byte values.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl FlowDataChunk {
    pub fn new(
        buffer_id: impl Into<String>,
        data_kind: DataKind,
        transfer_status: TransferStatus,
        payload: Value,
    ) -> Self {
        Self {
            buffer_id: buffer_id.into(),
            data_kind,
            transfer_status,
            payload,
            source_step: None,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// A JSON fragment.
    pub fn json(buffer_id: impl Into<String>, payload: Value) -> Self {
        Self::new(buffer_id, DataKind::Json, TransferStatus::Fragment, payload)
    }

    /// A text fragment.
    pub fn text(buffer_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            buffer_id,
            DataKind::String,
            TransferStatus::Fragment,
            Value::String(text.into()),
        )
    }

    /// A binary fragment.
    pub fn binary(buffer_id: impl Into<String>, bytes: &[u8]) -> Self {
        let payload = Value::Array(bytes.iter().map(|b| Value::from(*b)).collect());
        Self::new(buffer_id, DataKind::Binary, TransferStatus::Fragment, payload)
    }

    /// Terminal chunk closing the stream successfully.
    pub fn done(buffer_id: impl Into<String>, payload: Value) -> Self {
        Self::new(buffer_id, DataKind::Json, TransferStatus::Done, payload)
    }

    /// Terminal chunk carrying a failure.
    pub fn error(buffer_id: impl Into<String>, cause: &StrandError) -> Self {
        let payload = serde_json::to_value(cause).unwrap_or(Value::String(cause.to_string()));
        Self::new(buffer_id, DataKind::Json, TransferStatus::Error, payload)
    }

    pub fn cancelled(buffer_id: impl Into<String>) -> Self {
        Self::new(buffer_id, DataKind::Raw, TransferStatus::Cancelled, Value::Null)
    }

    pub fn timeout(buffer_id: impl Into<String>) -> Self {
        Self::new(buffer_id, DataKind::Raw, TransferStatus::Timeout, Value::Null)
    }

    /// Set the producing step.
    pub fn with_source(mut self, step: impl Into<String>) -> Self {
        self.source_step = Some(step.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.transfer_status.is_terminal()
    }

    pub fn as_text(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Decode a binary payload.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        self.payload.as_array().and_then(|items| {
            items
                .iter()
                .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect()
        })
    }

    /// Build a chunk from a step's `FlowData` signal.
    pub fn from_flow(buffer_id: impl Into<String>, data: FlowData<Value>) -> Self {
        match data {
            FlowData::Fragment(item) => Self::json(buffer_id, item),
            FlowData::Done(result) => Self::done(buffer_id, result),
            FlowData::Error(StrandError::Cancelled) => Self::cancelled(buffer_id),
            FlowData::Error(StrandError::Timeout) => Self::timeout(buffer_id),
            FlowData::Error(cause) => Self::error(buffer_id, &cause),
        }
    }

    /// Interpret this chunk as a `FlowData` signal. Cancelled and timed-out
    /// streams surface as errors.
    pub fn to_flow_data(&self) -> FlowData<Value> {
        match self.transfer_status {
            TransferStatus::Fragment => FlowData::Fragment(self.payload.clone()),
            TransferStatus::Done => FlowData::Done(self.payload.clone()),
            TransferStatus::Error => {
                let cause = serde_json::from_value::<StrandError>(self.payload.clone())
                    .unwrap_or_else(|_| StrandError::buffer(&self.buffer_id, self.payload.to_string()));
                FlowData::Error(cause)
            }
            TransferStatus::Cancelled => FlowData::Error(StrandError::Cancelled),
            TransferStatus::Timeout => FlowData::Error(StrandError::Timeout),
        }
    }
}
