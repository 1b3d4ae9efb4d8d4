//! Buffered I/O primitives for the client.
//!
//! - `DataBlock`: fixed-capacity append-only byte block with a token
//!   reference count.
//! - `TokenData`: zero-copy byte references that may straddle blocks.
//! - `BufferReader`: segmented receive log with a cursor-based read API.
//! - `BufferWriter`: scatter/gather send queue.

mod block;
mod reader;
mod writer;

pub use block::{DataBlock, TokenData, TokenSlice};
pub use reader::{BufferReader, MIN_BLOCK_CAPACITY};
pub use writer::BufferWriter;
