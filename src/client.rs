//! The per-operation client API.
//!
//! Every operation runs one dispatch → poll → collect → reset cycle over
//! the connection pool. Results are owned values; on failure the error
//! carries whatever partial results the healthy connections produced.

use crate::config::{ClientConfig, ConfigError, ServerSpec};
use crate::connection::REASON_QUIT;
use crate::error::{ErrorCode, OpError, OpResult};
use crate::pool::{
    keywords, BroadcastMode, ConnectionPool, CounterOp, RetrievalOp, StorageItem, StorageOp,
};
use crate::results::{BroadcastResult, MessageResult, RetrievalResult, UnsignedResult};

pub struct Client {
    pool: ConnectionPool,
    enable_flush_all: bool,
}

impl Client {
    /// Build a client over a fixed server fleet. No sockets are opened
    /// until the first operation needs them.
    pub fn new(servers: &[ServerSpec], config: &ClientConfig) -> Self {
        Self {
            pool: ConnectionPool::new(servers, config),
            enable_flush_all: config.enable_flush_all,
        }
    }

    /// Build a client from `host[:port][ alias]` specification strings.
    pub fn from_server_strings(servers: &[&str], config: &ClientConfig) -> Result<Self, ConfigError> {
        let specs = servers
            .iter()
            .map(|s| s.parse::<ServerSpec>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(&specs, config))
    }

    pub fn server_count(&self) -> usize {
        self.pool.server_count()
    }

    /// The server a key routes to on the continuum, liveness ignored.
    pub fn server_for_key(&mut self, key: &[u8]) -> Option<&str> {
        self.pool.server_name_for_key(key)
    }

    /// The server a key routes to right now, honoring liveness and
    /// failover.
    pub fn live_server_for_key(&mut self, key: &[u8]) -> Option<&str> {
        self.pool.live_server_name_for_key(key)
    }

    pub fn get(&mut self, keys: &[&[u8]]) -> OpResult<Vec<RetrievalResult>> {
        self.retrieval_op(RetrievalOp::Get, keys)
    }

    /// Like `get`, but each result carries the server's cas token.
    pub fn gets(&mut self, keys: &[&[u8]]) -> OpResult<Vec<RetrievalResult>> {
        self.retrieval_op(RetrievalOp::Gets, keys)
    }

    pub fn set(
        &mut self,
        items: &[StorageItem<'_>],
        exptime: i64,
        noreply: bool,
    ) -> OpResult<Vec<MessageResult>> {
        self.storage_op(StorageOp::Set, items, exptime, noreply)
    }

    pub fn add(
        &mut self,
        items: &[StorageItem<'_>],
        exptime: i64,
        noreply: bool,
    ) -> OpResult<Vec<MessageResult>> {
        self.storage_op(StorageOp::Add, items, exptime, noreply)
    }

    pub fn replace(
        &mut self,
        items: &[StorageItem<'_>],
        exptime: i64,
        noreply: bool,
    ) -> OpResult<Vec<MessageResult>> {
        self.storage_op(StorageOp::Replace, items, exptime, noreply)
    }

    pub fn append(
        &mut self,
        items: &[StorageItem<'_>],
        exptime: i64,
        noreply: bool,
    ) -> OpResult<Vec<MessageResult>> {
        self.storage_op(StorageOp::Append, items, exptime, noreply)
    }

    pub fn prepend(
        &mut self,
        items: &[StorageItem<'_>],
        exptime: i64,
        noreply: bool,
    ) -> OpResult<Vec<MessageResult>> {
        self.storage_op(StorageOp::Prepend, items, exptime, noreply)
    }

    /// Store only if the item's cas token still matches.
    pub fn cas(
        &mut self,
        items: &[StorageItem<'_>],
        exptime: i64,
        noreply: bool,
    ) -> OpResult<Vec<MessageResult>> {
        self.storage_op(StorageOp::Cas, items, exptime, noreply)
    }

    pub fn delete(&mut self, keys: &[&[u8]], noreply: bool) -> OpResult<Vec<MessageResult>> {
        self.pool.dispatch_deletion(keys, noreply);
        let rv = self.pool.wait_poll();
        let results = self.pool.collect_message();
        self.pool.reset();
        finish(rv, results)
    }

    pub fn touch(
        &mut self,
        keys: &[&[u8]],
        exptime: i64,
        noreply: bool,
    ) -> OpResult<Vec<MessageResult>> {
        self.pool.dispatch_touch(keys, exptime, noreply);
        let rv = self.pool.wait_poll();
        let results = self.pool.collect_message();
        self.pool.reset();
        finish(rv, results)
    }

    /// Increment a numeric value. `Ok(None)` means the key does not exist.
    pub fn incr(&mut self, key: &[u8], delta: u64, noreply: bool) -> OpResult<Option<UnsignedResult>> {
        self.counter_op(CounterOp::Incr, key, delta, noreply)
    }

    /// Decrement a numeric value. `Ok(None)` means the key does not exist.
    pub fn decr(&mut self, key: &[u8], delta: u64, noreply: bool) -> OpResult<Option<UnsignedResult>> {
        self.counter_op(CounterOp::Decr, key, delta, noreply)
    }

    /// Ask every server for its version string.
    pub fn version(&mut self) -> OpResult<Vec<BroadcastResult>> {
        self.pool.broadcast(keywords::VERSION, BroadcastMode::Lines);
        let rv = self.pool.wait_poll();
        let results = self.pool.collect_broadcast(false);
        self.pool.reset();
        finish(rv, results)
    }

    /// Gather `STAT` lines from every server.
    pub fn stats(&mut self) -> OpResult<Vec<BroadcastResult>> {
        self.pool.broadcast(keywords::STATS, BroadcastMode::Lines);
        let rv = self.pool.wait_poll();
        let results = self.pool.collect_broadcast(false);
        self.pool.reset();
        finish(rv, results)
    }

    /// Wipe every server. Refused unless `enable_flush_all` is configured.
    pub fn flush_all(&mut self) -> OpResult<Vec<BroadcastResult>> {
        if !self.enable_flush_all {
            return Err(OpError::new(ErrorCode::Programming, Vec::new()));
        }
        self.pool.broadcast(keywords::FLUSH_ALL, BroadcastMode::Message);
        let rv = self.pool.wait_poll();
        let results = self.pool.collect_broadcast(true);
        self.pool.reset();
        finish(rv, results)
    }

    /// Send `quit` everywhere and drop every connection.
    pub fn quit(&mut self) -> OpResult<()> {
        self.pool.broadcast(keywords::QUIT, BroadcastMode::NoReply);
        let rv = self.pool.wait_poll();
        self.pool.mark_all_dead(REASON_QUIT);
        self.pool.reset();
        finish(rv, ())
    }

    fn retrieval_op(&mut self, op: RetrievalOp, keys: &[&[u8]]) -> OpResult<Vec<RetrievalResult>> {
        self.pool.dispatch_retrieval(op, keys);
        let rv = self.pool.wait_poll();
        let results = self.pool.collect_retrieval();
        self.pool.reset();
        finish(rv, results)
    }

    fn storage_op(
        &mut self,
        op: StorageOp,
        items: &[StorageItem<'_>],
        exptime: i64,
        noreply: bool,
    ) -> OpResult<Vec<MessageResult>> {
        self.pool.dispatch_storage(op, items, exptime, noreply);
        let rv = self.pool.wait_poll();
        let results = self.pool.collect_message();
        self.pool.reset();
        finish(rv, results)
    }

    fn counter_op(
        &mut self,
        op: CounterOp,
        key: &[u8],
        delta: u64,
        noreply: bool,
    ) -> OpResult<Option<UnsignedResult>> {
        self.pool.dispatch_incr_decr(op, key, delta, noreply);
        let rv = self.pool.wait_poll();
        let result = self.pool.collect_unsigned();
        self.pool.reset();
        finish(rv, result)
    }
}

fn finish<T>(rv: Result<(), ErrorCode>, results: T) -> OpResult<T> {
    match rv {
        Ok(()) => Ok(results),
        Err(code) => Err(OpError::new(code, results)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::MessageKind;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;

    /// Install a test subscriber so failures come with the client's
    /// dead-connection and protocol logs. `RUST_LOG` overrides the level.
    fn init_logging() {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }

    /// A scripted in-process memcached speaking just enough of the text
    /// protocol for the client under test.
    fn spawn_mini_server() -> (u16, JoinHandle<()>) {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream);
        });
        (port, handle)
    }

    fn serve(stream: TcpStream) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut stream = stream;
        let mut store: HashMap<String, (u32, Vec<u8>)> = HashMap::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end().to_string();
            let parts: Vec<&str> = line.split(' ').collect();
            match parts[0] {
                "set" | "add" | "prepend" => {
                    let key = parts[1].to_string();
                    let flags: u32 = parts[2].parse().unwrap();
                    let bytes: usize = parts[4].parse().unwrap();
                    let noreply = parts.last() == Some(&"noreply");
                    let mut value = vec![0u8; bytes + 2];
                    reader.read_exact(&mut value).unwrap();
                    value.truncate(bytes);
                    match parts[0] {
                        "prepend" => {
                            let entry = store.get_mut(&key).unwrap();
                            value.extend_from_slice(&entry.1);
                            entry.1 = value;
                        }
                        _ => {
                            store.insert(key, (flags, value));
                        }
                    }
                    if !noreply {
                        stream.write_all(b"STORED\r\n").unwrap();
                    }
                }
                "get" | "gets" => {
                    let with_cas = parts[0] == "gets";
                    for key in &parts[1..] {
                        if let Some((flags, value)) = store.get(*key) {
                            if with_cas {
                                write!(stream, "VALUE {} {} {} 42\r\n", key, flags, value.len())
                                    .unwrap();
                            } else {
                                write!(stream, "VALUE {} {} {}\r\n", key, flags, value.len())
                                    .unwrap();
                            }
                            stream.write_all(value).unwrap();
                            stream.write_all(b"\r\n").unwrap();
                        }
                    }
                    stream.write_all(b"END\r\n").unwrap();
                }
                "delete" => {
                    let reply = if store.remove(parts[1]).is_some() {
                        &b"DELETED\r\n"[..]
                    } else {
                        &b"NOT_FOUND\r\n"[..]
                    };
                    if parts.last() != Some(&"noreply") {
                        stream.write_all(reply).unwrap();
                    }
                }
                "incr" | "decr" => {
                    let delta: u64 = parts[2].parse().unwrap();
                    match store.get_mut(parts[1]) {
                        Some((_, value)) => {
                            let current: u64 =
                                std::str::from_utf8(value).unwrap().parse().unwrap();
                            let updated = if parts[0] == "incr" {
                                current + delta
                            } else {
                                current.saturating_sub(delta)
                            };
                            *value = updated.to_string().into_bytes();
                            write!(stream, "{updated}\r\n").unwrap();
                        }
                        None => stream.write_all(b"NOT_FOUND\r\n").unwrap(),
                    }
                }
                "touch" => {
                    let reply = if store.contains_key(parts[1]) {
                        &b"TOUCHED\r\n"[..]
                    } else {
                        &b"NOT_FOUND\r\n"[..]
                    };
                    stream.write_all(reply).unwrap();
                }
                "version" => stream.write_all(b"VERSION 1.6.21\r\n").unwrap(),
                "stats" => stream
                    .write_all(b"STAT pid 1\r\nSTAT uptime 2\r\nEND\r\n")
                    .unwrap(),
                "flush_all" => {
                    store.clear();
                    stream.write_all(b"OK\r\n").unwrap();
                }
                "quit" => return,
                _ => stream.write_all(b"ERROR\r\n").unwrap(),
            }
        }
    }

    fn client_for(port: u16) -> Client {
        let config = ClientConfig {
            connect_timeout_ms: 200,
            poll_timeout_ms: 2000,
            ..ClientConfig::default()
        };
        Client::new(&[ServerSpec::tcp("127.0.0.1", port)], &config)
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);

        let stored = client
            .set(&[StorageItem::new(b"foo", b"bar")], 0, false)
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, MessageKind::Stored);
        assert_eq!(&stored[0].key[..], b"foo");

        let results = client.get(&[b"foo"]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(&results[0].key_bytes()[..], b"foo");
        assert_eq!(&results[0].value_bytes()[..], b"bar");
        assert_eq!(results[0].bytes, 3);
        assert_eq!(results[0].flags, 0);

        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_gets_returns_cas_token() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        client
            .set(&[StorageItem::new(b"k", b"v").with_flags(5)], 0, false)
            .unwrap();
        let results = client.gets(&[b"k"]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cas_unique, 42);
        assert_eq!(results[0].flags, 5);
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_multi_get_returns_only_present_keys() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        client
            .set(
                &[
                    StorageItem::new(b"a", b"1"),
                    StorageItem::new(b"b", b"2"),
                ],
                0,
                false,
            )
            .unwrap();
        let results = client.get(&[b"a", b"missing", b"b"]).unwrap();
        assert_eq!(results.len(), 2);
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_prepend_then_get() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        client
            .set(&[StorageItem::new(b"foo", b"value of foo")], 0, false)
            .unwrap();
        client
            .prepend(&[StorageItem::new(b"foo", b"value of tuiche")], 0, false)
            .unwrap();
        let results = client.get(&[b"foo"]).unwrap();
        assert_eq!(&results[0].value_bytes()[..], b"value of tuichevalue of foo");
        assert_eq!(results[0].bytes, 27);
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_incr_decr_sequence() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        client
            .set(&[StorageItem::new(b"cnt", b"99")], 0, false)
            .unwrap();
        let r = client.incr(b"cnt", 1, false).unwrap().unwrap();
        assert_eq!(r.value, 100);
        assert_eq!(&r.key[..], b"cnt");
        assert_eq!(client.incr(b"cnt", 1, false).unwrap().unwrap().value, 101);
        assert_eq!(client.decr(b"cnt", 1, false).unwrap().unwrap().value, 100);
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_incr_missing_key_is_none() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        assert!(client.incr(b"nope", 1, false).unwrap().is_none());
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_delete_and_touch() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        client
            .set(&[StorageItem::new(b"k", b"v")], 0, false)
            .unwrap();
        let touched = client.touch(&[b"k"], 60, false).unwrap();
        assert_eq!(touched[0].kind, MessageKind::Touched);
        let deleted = client.delete(&[b"k"], false).unwrap();
        assert_eq!(deleted[0].kind, MessageKind::Deleted);
        let missing = client.delete(&[b"k"], false).unwrap();
        assert_eq!(missing[0].kind, MessageKind::NotFound);
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_noreply_set_produces_no_results() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        let results = client
            .set(&[StorageItem::new(b"k", b"v")], 0, true)
            .unwrap();
        assert!(results.is_empty());
        // the value really was stored
        let got = client.get(&[b"k"]).unwrap();
        assert_eq!(&got[0].value_bytes()[..], b"v");
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_version_broadcast() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        let results = client.version().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].host, format!("127.0.0.1:{port}"));
        assert_eq!(results[0].lines.len(), 1);
        assert_eq!(&results[0].lines[0][..], b"1.6.21");
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_stats_broadcast() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        let results = client.stats().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(&results[0].lines[0][..], b"pid 1");
        assert_eq!(&results[0].lines[1][..], b"uptime 2");
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_flush_all_is_gated() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        let err = client.flush_all().unwrap_err();
        assert_eq!(err.code, ErrorCode::Programming);
        assert!(err.partial.is_empty());

        // gate open: one broadcast result per host with the OK kind
        let config = ClientConfig {
            connect_timeout_ms: 200,
            poll_timeout_ms: 2000,
            enable_flush_all: true,
            ..ClientConfig::default()
        };
        let mut client = Client::new(&[ServerSpec::tcp("127.0.0.1", port)], &config);
        let results = client.flush_all().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].msg_kind, Some(MessageKind::Ok));
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_invalid_key_mixed_batch() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        client
            .set(&[StorageItem::new(b"ok", b"fine")], 0, false)
            .unwrap();
        // the invalid key is rejected client-side; the call still succeeds
        let results = client.get(&[b"ok", b"bad key"]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(&results[0].key_bytes()[..], b"ok");
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_all_keys_invalid_returns_invalid_key() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        let err = client.get(&[b"bad key", b"worse\rkey"]).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidKey);
        assert!(err.partial.is_empty());
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_one_dead_server_still_serves_the_rest() {
        let (port, server) = spawn_mini_server();
        let config = ClientConfig {
            connect_timeout_ms: 200,
            poll_timeout_ms: 2000,
            ..ClientConfig::default()
        };
        // second server refuses connections
        let mut client = Client::new(
            &[
                ServerSpec::tcp("127.0.0.1", port),
                ServerSpec::tcp("127.0.0.1", 1),
            ],
            &config,
        );

        let keys: Vec<String> = (0..20).map(|i| format!("key-{i}")).collect();
        let items: Vec<StorageItem<'_>> = keys
            .iter()
            .map(|k| StorageItem::new(k.as_bytes(), b"x"))
            .collect();
        // keys routed to the dead server are dropped; the rest succeed
        let stored = match client.set(&items, 0, false) {
            Ok(results) => results,
            Err(err) => err.partial,
        };
        assert!(!stored.is_empty());
        assert!(stored.len() < keys.len());
        assert!(stored.iter().all(|m| m.kind == MessageKind::Stored));

        let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
        let got = match client.get(&key_refs) {
            Ok(results) => results,
            Err(err) => err.partial,
        };
        assert_eq!(got.len(), stored.len());
        client.quit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_server_for_key_names_a_server() {
        let (port, _server) = spawn_mini_server();
        let mut client = client_for(port);
        let name = client.server_for_key(b"foo").map(String::from);
        assert_eq!(name.as_deref(), Some(format!("127.0.0.1:{port}").as_str()));
    }

    #[test]
    fn test_quit_drops_connections() {
        let (port, server) = spawn_mini_server();
        let mut client = client_for(port);
        client.version().unwrap();
        client.quit().unwrap();
        server.join().unwrap();
    }
}
