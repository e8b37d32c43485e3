//! Named, multi-consumer buffers for exchanging data between steps.
//!
//! A producer acquires a buffer by id and pushes [`FlowDataChunk`]s; any number
//! of listeners attach at any time, receive every retained chunk in arrival
//! order, then keep receiving live chunks until a terminal chunk
//! (done/error/cancelled/timeout) detaches them.

pub mod buffer;
pub mod chunk;
pub mod registry;

pub use buffer::{BufferListener, DataBuffer};
pub use chunk::{DataKind, FlowDataChunk, TransferStatus};
pub use registry::{BufferReader, BufferRegistry, BufferWriter};
