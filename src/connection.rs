//! One memcached server connection.
//!
//! Owns the socket plus the three per-server buffers: a `BufferWriter` for
//! outgoing command fragments, a `BufferReader` for the reply stream, and a
//! `PacketParser` decoding it. Sockets are non-blocking and established
//! lazily; a failed connection is marked dead and probed again after the
//! retry timeout.

use crate::config::{ClientConfig, ServerSpec};
use crate::error::ErrorCode;
use crate::io::{BufferReader, BufferWriter};
use crate::parser::{PacketParser, ParserMode};
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Dead-reason that suppresses the warning log (an intentional shutdown).
pub(crate) const REASON_QUIT: &str = "quit";

/// Rounds of `poll` granted to an in-progress connect.
const CONNECT_POLL_ROUNDS: u32 = 6;

pub struct Connection {
    host: String,
    port: u16,
    name: String,
    has_alias: bool,

    socket: Option<Socket>,
    alive: bool,
    dead_until: Option<Instant>,
    retries: u32,

    connect_timeout: Duration,
    retry_timeout: Duration,
    max_retries: u32,

    /// Replies still expected within the current user call.
    pub(crate) pending_replies: usize,

    pub(crate) writer: BufferWriter,
    pub(crate) reader: BufferReader,
    pub(crate) parser: PacketParser,
}

impl Connection {
    /// Store identity and tunables; no network activity happens here.
    pub fn new(spec: &ServerSpec, config: &ClientConfig) -> Self {
        let name = match &spec.alias {
            Some(alias) => alias.clone(),
            None => format!("{}:{}", spec.host, spec.port),
        };
        let mut reader = BufferReader::new();
        reader.set_min_block_size(config.min_block_size);
        Self {
            host: spec.host.clone(),
            port: spec.port,
            name,
            has_alias: spec.alias.is_some(),
            socket: None,
            alive: false,
            dead_until: None,
            retries: 0,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            retry_timeout: Duration::from_secs(config.retry_timeout_s),
            max_retries: config.max_retries,
            pending_replies: 0,
            writer: BufferWriter::new(),
            reader,
            parser: PacketParser::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Display name: the alias when set, else `host:port`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_alias(&self) -> bool {
        self.has_alias
    }

    pub fn alive(&self) -> bool {
        self.alive
    }

    fn is_unix(&self) -> bool {
        self.port == 0 && self.host.starts_with('/')
    }

    /// Raw fd for the poll array; -1 when closed (poll skips negative fds).
    pub(crate) fn socket_fd(&self) -> i32 {
        self.socket.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    /// Establish the socket. TCP sockets are non-blocking with
    /// `TCP_NODELAY` and `SO_KEEPALIVE`; an `EINPROGRESS` connect is given
    /// up to `CONNECT_POLL_ROUNDS` poll rounds of `connect_timeout` each.
    pub fn connect(&mut self) -> io::Result<()> {
        debug_assert!(!self.alive);
        self.close();

        if self.is_unix() {
            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            socket.set_nonblocking(true)?;
            let addr = SockAddr::unix(&self.host)?;
            return self.finish_connect(socket, &addr);
        }

        let addrs = (self.host.as_str(), self.port).to_socket_addrs()?;
        let mut last_err = None;
        for addr in addrs.filter(|a| a.is_ipv4()) {
            let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
                Ok(socket) => socket,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let setup = socket
                .set_nonblocking(true)
                .and_then(|()| socket.set_nodelay(true))
                .and_then(|()| socket.set_keepalive(true));
            if let Err(e) = setup {
                last_err = Some(e);
                continue;
            }
            match self.finish_connect(socket, &addr.into()) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address")
        }))
    }

    fn finish_connect(&mut self, socket: Socket, addr: &SockAddr) -> io::Result<()> {
        match socket.connect(addr) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => self.connect_poll(&socket)?,
            Err(e) => return Err(e),
        }
        debug!(conn = %self.name, "connected");
        self.socket = Some(socket);
        self.alive = true;
        Ok(())
    }

    fn connect_poll(&self, socket: &Socket) -> io::Result<()> {
        let mut fds = [libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        }];
        for _ in 0..CONNECT_POLL_ROUNDS {
            let rv =
                unsafe { libc::poll(fds.as_mut_ptr(), 1, self.connect_timeout.as_millis() as i32) };
            match rv {
                1 => {
                    if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            "connect failed",
                        ));
                    }
                    return Ok(());
                }
                -1 => return Err(io::Error::last_os_error()),
                _ => {}
            }
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
    }

    pub fn close(&mut self) {
        self.alive = false;
        self.socket = None;
    }

    /// Attempt a reconnect if the server is dead and its dead-until
    /// deadline has passed. With `check_retries`, the per-call retry budget
    /// applies; the budget only covers re-connects after a recorded
    /// failure, never the initial lazy connect. Returns the resulting
    /// liveness.
    pub fn try_reconnect(&mut self, check_retries: bool) -> bool {
        if !self.alive {
            if check_retries && self.dead_until.is_some() {
                self.retries += 1;
                if self.retries > self.max_retries {
                    return self.alive;
                }
            }
            let now = Instant::now();
            if self.dead_until.map_or(true, |deadline| now >= deadline) {
                match self.connect() {
                    Ok(()) => {
                        if self.dead_until.is_some() {
                            info!(conn = %self.name, "connection is back to life");
                        }
                        self.dead_until = None;
                    }
                    Err(e) => {
                        debug!(conn = %self.name, error = %e, "reconnect failed");
                        self.dead_until = Some(now + self.retry_timeout);
                    }
                }
            }
        }
        self.alive
    }

    /// Close the socket and block reconnects for `delay_s` seconds.
    pub fn mark_dead(&mut self, reason: &str, delay_s: u64) {
        if self.alive {
            self.dead_until = Some(Instant::now() + Duration::from_secs(delay_s));
            self.close();
            if reason != REASON_QUIT {
                warn!(conn = %self.name, reason, delay_s, "connection marked dead");
                if let Some(key) = self.parser.current_request_key() {
                    warn!(
                        conn = %self.name,
                        key = %String::from_utf8_lossy(key),
                        "first outstanding request key"
                    );
                }
            }
        }
    }

    pub fn take_buffer(&mut self, buf: Bytes) {
        self.writer.take_buffer(buf);
    }

    pub fn take_number(&mut self, value: i64) {
        self.writer.take_number(value);
    }

    pub fn add_request_key(&mut self, key: Bytes) {
        self.parser.add_request_key(key);
    }

    pub fn request_key_count(&self) -> usize {
        self.parser.request_key_count()
    }

    pub fn set_parser_mode(&mut self, mode: ParserMode) {
        self.parser.set_mode(mode);
    }

    /// Whether any byte went out since dispatch (or the last rewind).
    pub fn has_sent(&self) -> bool {
        self.writer.has_sent()
    }

    /// One `sendmsg` over the unsent spans, capped at `UIO_MAXIOV` iovecs
    /// (`MSG_MORE` when truncated). Returns the number of spans still
    /// queued afterwards.
    pub fn send(&mut self) -> io::Result<usize> {
        let fd = self.connected_fd()?;
        let slices = self.writer.unsent_slices();
        if slices.is_empty() {
            return Ok(0);
        }

        let mut flags = 0;
        #[cfg(target_os = "linux")]
        {
            flags |= libc::MSG_NOSIGNAL;
        }
        let iovlen = slices.len().min(libc::UIO_MAXIOV as usize);
        if slices.len() > iovlen {
            #[cfg(target_os = "linux")]
            {
                flags |= libc::MSG_MORE;
            }
        }

        // IoSlice is guaranteed ABI-compatible with iovec
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = slices.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iovlen as _;

        let sent = unsafe { libc::sendmsg(fd, &msg, flags) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        drop(slices);
        self.writer.commit_read(sent as usize);
        Ok(self.writer.unsent_len())
    }

    /// Receive into a freshly prepared block, sized by the parser's hint
    /// when a large value is pending. Returns the byte count (0 = EOF).
    pub fn recv(&mut self) -> io::Result<usize> {
        let fd = self.connected_fd()?;
        let hint = self.reader.take_block_size_hint();
        self.reader.fill_with(hint, |buf| {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
    }

    /// Probe for readable bytes without consuming them (`MSG_PEEK`).
    pub fn recv_peek(&mut self) -> io::Result<usize> {
        let fd = self.connected_fd()?;
        let mut probe = [0u8; 1];
        let n = unsafe { libc::recv(fd, probe.as_mut_ptr().cast(), 1, libc::MSG_PEEK) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Step the reply parser over whatever is buffered.
    pub fn process(&mut self) -> Result<(), ErrorCode> {
        self.parser.process(&mut self.reader)
    }

    /// End-of-call teardown: counters zeroed, buffers and parser recycled.
    pub fn reset(&mut self) {
        self.pending_replies = 0;
        self.retries = 0;
        self.parser.reset();
        self.reader.reset();
        self.writer.reset();
    }

    /// Mid-call recovery after a reconnect: drop the half-read reply
    /// stream and queue the full command buffer for retransmission.
    pub fn rewind(&mut self) {
        self.parser.rewind();
        self.reader.reset();
        self.writer.rewind();
    }

    fn connected_fd(&self) -> io::Result<i32> {
        match &self.socket {
            Some(socket) => Ok(socket.as_raw_fd()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        }
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EALREADY)
    ) || e.kind() == io::ErrorKind::WouldBlock
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("alive", &self.alive)
            .field("pending_replies", &self.pending_replies)
            .finish()
    }
}
