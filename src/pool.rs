//! Connection pool: command dispatch, the poll driver, and result
//! collection.
//!
//! A user call runs three phases. Dispatch validates and routes each key
//! through the ketama selector and appends ASCII command fragments to the
//! owning connection's writer. `wait_poll` drives every active connection
//! through interleaved send/receive with one `poll(2)` loop, recovering
//! dead connections where the retry budget allows. Collection drains the
//! per-connection result lists.

use crate::config::{ClientConfig, ServerSpec};
use crate::connection::Connection;
use crate::error::ErrorCode;
use crate::ketama::KetamaSelector;
use crate::parser::ParserMode;
use crate::results::{BroadcastResult, MessageResult, RetrievalResult, UnsignedResult};
use bytes::Bytes;
use tracing::{debug, warn};

/// Maximum key length accepted by the protocol.
pub const MAX_KEY_LENGTH: usize = 250;

/// Literal command tokens, exactly as they appear on the wire.
pub(crate) mod keywords {
    pub const GET: &[u8] = b"get";
    pub const GETS: &[u8] = b"gets";
    pub const SET_: &[u8] = b"set ";
    pub const ADD_: &[u8] = b"add ";
    pub const REPLACE_: &[u8] = b"replace ";
    pub const APPEND_: &[u8] = b"append ";
    pub const PREPEND_: &[u8] = b"prepend ";
    pub const CAS_: &[u8] = b"cas ";
    pub const DELETE_: &[u8] = b"delete ";
    pub const TOUCH_: &[u8] = b"touch ";
    pub const INCR_: &[u8] = b"incr ";
    pub const DECR_: &[u8] = b"decr ";
    pub const VERSION: &[u8] = b"version";
    pub const STATS: &[u8] = b"stats";
    pub const FLUSH_ALL: &[u8] = b"flush_all";
    pub const QUIT: &[u8] = b"quit";
    pub const SPACE: &[u8] = b" ";
    pub const CRLF: &[u8] = b"\r\n";
    pub const NOREPLY: &[u8] = b" noreply";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalOp {
    Get,
    Gets,
}

impl RetrievalOp {
    fn token(self) -> &'static [u8] {
        match self {
            RetrievalOp::Get => keywords::GET,
            RetrievalOp::Gets => keywords::GETS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StorageOp {
    fn token(self) -> &'static [u8] {
        match self {
            StorageOp::Set => keywords::SET_,
            StorageOp::Add => keywords::ADD_,
            StorageOp::Replace => keywords::REPLACE_,
            StorageOp::Append => keywords::APPEND_,
            StorageOp::Prepend => keywords::PREPEND_,
            StorageOp::Cas => keywords::CAS_,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    Incr,
    Decr,
}

impl CounterOp {
    fn token(self) -> &'static [u8] {
        match self {
            CounterOp::Incr => keywords::INCR_,
            CounterOp::Decr => keywords::DECR_,
        }
    }
}

/// One item of a storage command.
#[derive(Debug, Clone, Copy)]
pub struct StorageItem<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub flags: u32,
    /// Only used by `cas`.
    pub cas_unique: u64,
}

impl<'a> StorageItem<'a> {
    pub fn new(key: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            key,
            value,
            flags: 0,
            cas_unique: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cas(mut self, cas_unique: u64) -> Self {
        self.cas_unique = cas_unique;
        self
    }
}

/// Keys must fit the protocol line format: at most 250 bytes, none of
/// space, CR, LF, or NUL.
pub fn is_valid_key(key: &[u8]) -> bool {
    if key.len() > MAX_KEY_LENGTH {
        warn!(key_len = key.len(), "invalid key: too long");
        return false;
    }
    for &byte in key {
        if matches!(byte, b' ' | b'\r' | b'\n' | 0) {
            warn!(key = %String::from_utf8_lossy(key), "invalid key: forbidden byte");
            return false;
        }
    }
    true
}

pub struct ConnectionPool {
    conns: Vec<Connection>,
    selector: KetamaSelector,
    /// Connections that received at least one request this call.
    active: Vec<usize>,
    n_invalid_key: usize,
    poll_timeout_ms: u64,
}

impl ConnectionPool {
    pub fn new(servers: &[ServerSpec], config: &ClientConfig) -> Self {
        let conns: Vec<Connection> = servers
            .iter()
            .map(|spec| Connection::new(spec, config))
            .collect();
        let mut selector = KetamaSelector::new(config.hash_function, config.enable_failover);
        selector.add_servers(&conns);
        Self {
            conns,
            selector,
            active: Vec::new(),
            n_invalid_key: 0,
            poll_timeout_ms: config.poll_timeout_ms,
        }
    }

    pub fn server_count(&self) -> usize {
        self.conns.len()
    }

    /// The server a key routes to, without touching liveness.
    pub fn server_name_for_key(&mut self, key: &[u8]) -> Option<&str> {
        let idx = self.selector.select(key, false, &mut self.conns)?;
        Some(self.conns[idx].name())
    }

    /// The server a key routes to right now, honoring liveness and
    /// failover.
    pub fn live_server_name_for_key(&mut self, key: &[u8]) -> Option<&str> {
        let idx = self.selector.select(key, true, &mut self.conns)?;
        Some(self.conns[idx].name())
    }

    /// Route a batch of retrieval keys. Each connection gets one
    /// `get`/`gets` line carrying all of its keys.
    pub fn dispatch_retrieval(&mut self, op: RetrievalOp, keys: &[&[u8]]) {
        for &key in keys {
            if !is_valid_key(key) {
                self.n_invalid_key += 1;
                continue;
            }
            let Some(idx) = self.selector.select(key, true, &mut self.conns) else {
                continue;
            };
            let conn = &mut self.conns[idx];
            conn.pending_replies += 1;
            if conn.pending_replies == 1 {
                conn.take_buffer(Bytes::from_static(op.token()));
            }
            conn.take_buffer(Bytes::from_static(keywords::SPACE));
            conn.take_buffer(Bytes::copy_from_slice(key));
        }
        for idx in 0..self.conns.len() {
            let conn = &mut self.conns[idx];
            if conn.pending_replies > 0 {
                conn.take_buffer(Bytes::from_static(keywords::CRLF));
                conn.set_parser_mode(ParserMode::EndState);
                conn.parser.reserve_retrieval_results(conn.pending_replies);
                self.active.push(idx);
            }
        }
    }

    /// Route storage items, framing
    /// `<cmd> <key> <flags> <exptime> <bytes>[ <cas>][ noreply]\r\n<value>\r\n`.
    pub fn dispatch_storage(
        &mut self,
        op: StorageOp,
        items: &[StorageItem<'_>],
        exptime: i64,
        noreply: bool,
    ) {
        for item in items {
            if !is_valid_key(item.key) {
                self.n_invalid_key += 1;
                continue;
            }
            let Some(idx) = self.selector.select(item.key, true, &mut self.conns) else {
                continue;
            };
            let conn = &mut self.conns[idx];
            conn.take_buffer(Bytes::from_static(op.token()));
            conn.take_buffer(Bytes::copy_from_slice(item.key));
            conn.take_buffer(Bytes::from_static(keywords::SPACE));
            conn.take_number(i64::from(item.flags));
            conn.take_buffer(Bytes::from_static(keywords::SPACE));
            conn.take_number(exptime);
            conn.take_buffer(Bytes::from_static(keywords::SPACE));
            conn.take_number(item.value.len() as i64);
            if op == StorageOp::Cas {
                conn.take_buffer(Bytes::from_static(keywords::SPACE));
                conn.take_number(item.cas_unique as i64);
            }
            if noreply {
                conn.take_buffer(Bytes::from_static(keywords::NOREPLY));
            } else {
                conn.add_request_key(Bytes::copy_from_slice(item.key));
            }
            conn.pending_replies += 1;
            conn.take_buffer(Bytes::from_static(keywords::CRLF));
            conn.take_buffer(Bytes::copy_from_slice(item.value));
            conn.take_buffer(Bytes::from_static(keywords::CRLF));
        }
        self.activate_counting();
    }

    pub fn dispatch_deletion(&mut self, keys: &[&[u8]], noreply: bool) {
        for &key in keys {
            if !is_valid_key(key) {
                self.n_invalid_key += 1;
                continue;
            }
            let Some(idx) = self.selector.select(key, true, &mut self.conns) else {
                continue;
            };
            let conn = &mut self.conns[idx];
            conn.take_buffer(Bytes::from_static(keywords::DELETE_));
            conn.take_buffer(Bytes::copy_from_slice(key));
            if noreply {
                conn.take_buffer(Bytes::from_static(keywords::NOREPLY));
            } else {
                conn.add_request_key(Bytes::copy_from_slice(key));
            }
            conn.pending_replies += 1;
            conn.take_buffer(Bytes::from_static(keywords::CRLF));
        }
        self.activate_counting();
    }

    pub fn dispatch_touch(&mut self, keys: &[&[u8]], exptime: i64, noreply: bool) {
        for &key in keys {
            if !is_valid_key(key) {
                self.n_invalid_key += 1;
                continue;
            }
            let Some(idx) = self.selector.select(key, true, &mut self.conns) else {
                continue;
            };
            let conn = &mut self.conns[idx];
            conn.take_buffer(Bytes::from_static(keywords::TOUCH_));
            conn.take_buffer(Bytes::copy_from_slice(key));
            conn.take_buffer(Bytes::from_static(keywords::SPACE));
            conn.take_number(exptime);
            if noreply {
                conn.take_buffer(Bytes::from_static(keywords::NOREPLY));
            } else {
                conn.add_request_key(Bytes::copy_from_slice(key));
            }
            conn.pending_replies += 1;
            conn.take_buffer(Bytes::from_static(keywords::CRLF));
        }
        self.activate_counting();
    }

    pub fn dispatch_incr_decr(&mut self, op: CounterOp, key: &[u8], delta: u64, noreply: bool) {
        if !is_valid_key(key) {
            self.n_invalid_key += 1;
            return;
        }
        let Some(idx) = self.selector.select(key, true, &mut self.conns) else {
            return;
        };
        let conn = &mut self.conns[idx];
        conn.take_buffer(Bytes::from_static(op.token()));
        conn.take_buffer(Bytes::copy_from_slice(key));
        conn.take_buffer(Bytes::from_static(keywords::SPACE));
        conn.take_number(delta as i64);
        if noreply {
            conn.take_buffer(Bytes::from_static(keywords::NOREPLY));
        } else {
            conn.add_request_key(Bytes::copy_from_slice(key));
        }
        conn.take_buffer(Bytes::from_static(keywords::CRLF));
        conn.set_parser_mode(ParserMode::Counting);
        conn.pending_replies = conn.request_key_count();
        self.active.push(idx);
    }

    /// Enqueue a command on every live (or reconnectable) server, skipping
    /// the key router. `BroadcastMode::Message` registers the command token
    /// itself as the expected reply key so the parser can count the single
    /// one-line answer.
    pub fn broadcast(&mut self, cmd: &'static [u8], mode: BroadcastMode) {
        for idx in 0..self.conns.len() {
            let conn = &mut self.conns[idx];
            if !conn.alive() && !conn.try_reconnect(false) {
                continue;
            }
            conn.take_buffer(Bytes::from_static(cmd));
            match mode {
                BroadcastMode::Lines => {
                    conn.pending_replies += 1;
                    conn.set_parser_mode(ParserMode::EndState);
                }
                BroadcastMode::Message => {
                    conn.pending_replies += 1;
                    conn.add_request_key(Bytes::from_static(cmd));
                    conn.set_parser_mode(ParserMode::Counting);
                }
                BroadcastMode::NoReply => {
                    conn.set_parser_mode(ParserMode::EndState);
                }
            }
            conn.take_buffer(Bytes::from_static(keywords::CRLF));
            self.active.push(idx);
        }
    }

    /// Storage-family epilogue: mark participating connections active in
    /// counting mode and convert the dispatch counter into the number of
    /// replies actually expected (0 under noreply).
    fn activate_counting(&mut self) {
        for idx in 0..self.conns.len() {
            let conn = &mut self.conns[idx];
            if conn.pending_replies > 0 {
                conn.set_parser_mode(ParserMode::Counting);
                self.active.push(idx);
            }
            conn.pending_replies = conn.request_key_count();
            if conn.pending_replies > 0 {
                conn.parser.reserve_message_results(conn.pending_replies);
            }
        }
    }

    /// Drive all active connections until each is done, dead, or the call
    /// times out. The last non-OK code reported wins.
    pub fn wait_poll(&mut self) -> Result<(), ErrorCode> {
        if self.active.is_empty() {
            return Err(if self.n_invalid_key > 0 {
                ErrorCode::InvalidKey
            } else {
                ErrorCode::McServer
            });
        }

        let n = self.active.len();
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(n);
        for i in 0..n {
            let conn = &self.conns[self.active[i]];
            fds.push(libc::pollfd {
                fd: conn.socket_fd(),
                events: libc::POLLOUT | libc::POLLIN,
                revents: 0,
            });
        }

        let mut n_active = n;
        let mut rv: Result<(), ErrorCode> = Ok(());

        while n_active > 0 {
            let ready =
                unsafe { libc::poll(fds.as_mut_ptr(), n as libc::nfds_t, self.poll_timeout_ms as i32) };
            if ready == -1 {
                self.mark_dead_active(&fds, "poll_error");
                rv = Err(ErrorCode::Poll);
                break;
            }
            if ready == 0 {
                warn!(active = n_active, "poll timeout");
                // half-consumed reply streams cannot be resumed next call
                self.mark_dead_active(&fds, "poll_timeout_error");
                rv = Err(ErrorCode::PollTimeout);
                break;
            }

            for i in 0..n {
                let revents = fds[i].revents;
                if revents == 0 {
                    continue;
                }
                let fd_entry = &mut fds[i];
                let conn = &mut self.conns[self.active[i]];

                if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                    mark_dead_entry(conn, "conn_poll_error", fd_entry);
                    if conn.try_reconnect(true) {
                        rewind_entry(conn, fd_entry);
                    } else {
                        rv = Err(ErrorCode::ConnPoll);
                        n_active -= 1;
                    }
                    continue;
                }

                // readable before the first byte went out: the peer reset
                // or sent stale data; either way the stream is unusable
                if revents & libc::POLLIN != 0 && !conn.has_sent() {
                    match conn.recv_peek() {
                        Ok(0) => debug!(conn = %conn.name(), "peer closed before send"),
                        Ok(_) => debug!(conn = %conn.name(), "stale data before send"),
                        Err(e) => debug!(conn = %conn.name(), error = %e, "peek failed"),
                    }
                    mark_dead_entry(conn, "recv_error", fd_entry);
                    if conn.try_reconnect(false) {
                        fd_entry.fd = conn.socket_fd();
                        fd_entry.events = libc::POLLOUT;
                    } else {
                        rv = Err(ErrorCode::Recv);
                        n_active -= 1;
                    }
                    continue;
                }

                if revents & libc::POLLOUT != 0 {
                    match conn.send() {
                        Err(e) => {
                            debug!(conn = %conn.name(), error = %e, "send failed");
                            mark_dead_entry(conn, "send_error", fd_entry);
                            if conn.try_reconnect(true) {
                                rewind_entry(conn, fd_entry);
                            } else {
                                rv = Err(ErrorCode::Send);
                                n_active -= 1;
                            }
                            continue;
                        }
                        Ok(spans_left) => {
                            // replies may start flowing once bytes are out
                            fd_entry.events |= libc::POLLIN;
                            if spans_left == 0 {
                                fd_entry.events &= !libc::POLLOUT;
                                if conn.pending_replies == 0 {
                                    // noreply-only connection: all done
                                    fd_entry.events = 0;
                                    n_active -= 1;
                                }
                            }
                        }
                    }
                }

                if revents & libc::POLLIN != 0 {
                    let alive = match conn.recv() {
                        Ok(0) => false,
                        Ok(_) => true,
                        Err(e) => {
                            debug!(conn = %conn.name(), error = %e, "recv failed");
                            false
                        }
                    };
                    if !alive {
                        mark_dead_entry(conn, "recv_error", fd_entry);
                        if conn.try_reconnect(true) {
                            rewind_entry(conn, fd_entry);
                        } else {
                            rv = Err(ErrorCode::Recv);
                            n_active -= 1;
                        }
                        continue;
                    }
                    match conn.process() {
                        Ok(()) => {
                            fd_entry.events &= !libc::POLLIN;
                            n_active -= 1;
                        }
                        Err(ErrorCode::IncompleteBuffer) => {}
                        Err(ErrorCode::Programming) => {
                            mark_dead_entry(conn, "programming_error", fd_entry);
                            rv = Err(ErrorCode::Programming);
                            n_active -= 1;
                        }
                        Err(ErrorCode::McServer) => {
                            mark_dead_entry(conn, "server_error", fd_entry);
                            rv = Err(ErrorCode::McServer);
                            n_active -= 1;
                        }
                        Err(other) => unreachable!("parser returned {other}"),
                    }
                }
            }
        }
        rv
    }

    fn mark_dead_active(&mut self, fds: &[libc::pollfd], reason: &str) {
        for i in 0..self.active.len() {
            if fds[i].events & (libc::POLLOUT | libc::POLLIN) != 0 {
                let idx = self.active[i];
                self.conns[idx].mark_dead(reason, 0);
            }
        }
    }

    /// Completed retrieval results across active connections; an
    /// incomplete trailing VALUE is dropped.
    pub fn collect_retrieval(&mut self) -> Vec<RetrievalResult> {
        let mut out = Vec::new();
        for i in 0..self.active.len() {
            let conn = &mut self.conns[self.active[i]];
            for result in conn.parser.take_retrieval_results() {
                if result.is_complete() {
                    out.push(result);
                }
            }
        }
        out
    }

    pub fn collect_message(&mut self) -> Vec<MessageResult> {
        let mut out = Vec::new();
        for i in 0..self.active.len() {
            let conn = &mut self.conns[self.active[i]];
            out.append(&mut conn.parser.take_message_results());
        }
        out
    }

    /// The single numeric reply of an incr/decr, or None on NOT_FOUND.
    pub fn collect_unsigned(&mut self) -> Option<UnsignedResult> {
        if self.active.len() != 1 {
            return None;
        }
        let conn = &mut self.conns[self.active[0]];
        let mut numeric = conn.parser.take_unsigned_results();
        if numeric.len() == 1 {
            return numeric.pop();
        }
        None
    }

    /// One result per server regardless of liveness.
    pub fn collect_broadcast(&mut self, is_flush_all: bool) -> Vec<BroadcastResult> {
        let mut out = Vec::with_capacity(self.conns.len());
        for conn in &mut self.conns {
            let host = conn.name().to_string();
            if is_flush_all {
                let messages = conn.parser.take_message_results();
                let msg_kind = match messages.as_slice() {
                    [only] => Some(only.kind),
                    _ => None,
                };
                out.push(BroadcastResult {
                    host,
                    lines: Vec::new(),
                    msg_kind,
                });
            } else {
                let lines = conn
                    .parser
                    .take_line_results()
                    .iter()
                    .map(|line| line.text())
                    .collect();
                out.push(BroadcastResult {
                    host,
                    lines,
                    msg_kind: None,
                });
            }
        }
        out
    }

    pub fn mark_all_dead(&mut self, reason: &str) {
        for conn in &mut self.conns {
            conn.mark_dead(reason, 0);
        }
    }

    /// End-of-call cleanup on every connection that participated.
    pub fn reset(&mut self) {
        for i in 0..self.active.len() {
            let idx = self.active[i];
            self.conns[idx].reset();
        }
        self.active.clear();
        self.n_invalid_key = 0;
    }

    #[cfg(test)]
    pub(crate) fn conns_mut(&mut self) -> &mut [Connection] {
        &mut self.conns
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// How replies to a broadcast command are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    /// Lines terminated by `END` (stats) or a single VERSION line.
    Lines,
    /// A single one-line reply per server (flush_all's `OK`).
    Message,
    /// No reply expected (quit).
    NoReply,
}

fn mark_dead_entry(conn: &mut Connection, reason: &str, fd: &mut libc::pollfd) {
    conn.mark_dead(reason, 0);
    fd.events = 0;
    fd.fd = conn.socket_fd();
}

fn rewind_entry(conn: &mut Connection, fd: &mut libc::pollfd) {
    conn.rewind();
    fd.fd = conn.socket_fd();
    fd.events = libc::POLLOUT;
}
