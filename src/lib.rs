//! fleetmc: a multiplexed memcached text-protocol client.
//!
//! Batched commands are routed across an arbitrary server fleet with ketama
//! consistent hashing, driven through a single non-blocking `poll(2)` loop,
//! and collected with partial-failure tolerance:
//! - zero-copy reply decoding via a segmented receive buffer and a
//!   resumable parser state machine
//! - scatter/gather transmission with automatic retransmission after a
//!   reconnect
//! - per-server dead timeouts, bounded retry budgets, and optional
//!   continuum failover
//!
//! One `Client` is single-threaded; `ClientPool` lends clients to threads
//! with FIFO fairness.
//!
//! ```no_run
//! use fleetmc::{Client, ClientConfig, ServerSpec, StorageItem};
//!
//! let config = ClientConfig::default();
//! let servers = [
//!     ServerSpec::tcp("10.0.0.1", 11211),
//!     ServerSpec::tcp("10.0.0.2", 11211).with_alias("mc-b"),
//! ];
//! let mut client = Client::new(&servers, &config);
//! client.set(&[StorageItem::new(b"foo", b"bar")], 0, false).unwrap();
//! let results = client.get(&[b"foo"]).unwrap();
//! assert_eq!(&results[0].value_bytes()[..], b"bar");
//! ```

mod client;
mod client_pool;
mod config;
mod connection;
mod error;
mod hash;
mod io;
mod ketama;
mod parser;
mod pool;
mod results;

pub use client::Client;
pub use client_pool::{ClientPool, PooledClient};
pub use config::{ClientConfig, ConfigError, ServerSpec, DEFAULT_PORT};
pub use error::{ErrorCode, OpError, OpResult};
pub use hash::HashFunction;
pub use io::{BufferReader, BufferWriter, TokenData, TokenSlice};
pub use parser::{PacketParser, ParserMode};
pub use pool::{
    is_valid_key, BroadcastMode, ConnectionPool, CounterOp, RetrievalOp, StorageItem, StorageOp,
    MAX_KEY_LENGTH,
};
pub use results::{
    BroadcastResult, LineResult, MessageKind, MessageResult, RetrievalResult, UnsignedResult,
};
