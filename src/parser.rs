//! Incremental parser for memcached ASCII responses.
//!
//! The parser is a resumable state machine over a `BufferReader`. Whenever a
//! buffer operation reports `IncompleteBuffer` the step is abandoned without
//! side effects and `process` returns; the next call resumes from the same
//! state and cursor. Protocol and server errors transition to a terminal
//! `Error` state.
//!
//! Two completion modes exist: `EndState` parses until an `END` (or error)
//! line arrives — retrieval responses and line broadcasts; `Counting` parses
//! until every expected reply key has been matched — storage, deletion,
//! touch, incr/decr, and flush_all.

use crate::error::ErrorCode;
use crate::io::{BufferReader, TokenData};
use crate::results::{LineResult, MessageKind, MessageResult, RetrievalResult, UnsignedResult};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserMode {
    #[default]
    Undefined,
    /// Finished when the FSM reaches END or ERROR.
    EndState,
    /// Finished when the expected-reply-key queue is empty.
    Counting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ParserState {
    #[default]
    Start,
    End,
    Error,
    /// Got "VALUE ".
    GetStart,
    /// Got the key and its trailing space.
    GetKey,
    /// Got flags and the following space.
    GetFlag,
    /// Got bytes and the byte after it (space or CR).
    GetBytesCas,
    /// Consuming the header LF, the payload, and the trailing CRLF.
    GetValueRemaining,
    /// Got "VERSION ".
    VerStart,
    /// Got "STAT ".
    StatStart,
    /// Saw a leading digit.
    IncrDecrStart,
    /// Got the number; skipping through the line end.
    IncrDecrRemaining,
}

/// Streaming decoder for one connection's reply stream.
#[derive(Debug, Default)]
pub struct PacketParser {
    state: ParserState,
    mode: ParserMode,
    /// Keys expecting a reply, in the order replies will arrive.
    request_keys: VecDeque<Bytes>,
    /// Snapshot of every registered key, for replay after a rewind.
    initial_keys: Vec<Bytes>,
    retrieval_results: Vec<RetrievalResult>,
    message_results: Vec<MessageResult>,
    line_results: Vec<LineResult>,
    unsigned_results: Vec<UnsignedResult>,
}

impl PacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: ParserMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> ParserMode {
        self.mode
    }

    pub(crate) fn state_is_start(&self) -> bool {
        self.state == ParserState::Start
    }

    /// Register a key whose reply is expected next, FIFO.
    pub fn add_request_key(&mut self, key: Bytes) {
        self.request_keys.push_back(key.clone());
        self.initial_keys.push(key);
    }

    pub fn request_key_count(&self) -> usize {
        self.request_keys.len()
    }

    /// The key whose reply is outstanding, if any (used in dead-connection
    /// logs).
    pub fn current_request_key(&self) -> Option<&Bytes> {
        self.request_keys.front()
    }

    pub fn retrieval_result_count(&self) -> usize {
        self.retrieval_results.len()
    }

    pub fn message_result_count(&self) -> usize {
        self.message_results.len()
    }

    pub(crate) fn reserve_retrieval_results(&mut self, n: usize) {
        self.retrieval_results.reserve(n);
    }

    pub(crate) fn reserve_message_results(&mut self, n: usize) {
        self.message_results.reserve(n);
    }

    pub fn take_retrieval_results(&mut self) -> Vec<RetrievalResult> {
        std::mem::take(&mut self.retrieval_results)
    }

    pub fn take_message_results(&mut self) -> Vec<MessageResult> {
        std::mem::take(&mut self.message_results)
    }

    pub fn take_line_results(&mut self) -> Vec<LineResult> {
        std::mem::take(&mut self.line_results)
    }

    pub fn take_unsigned_results(&mut self) -> Vec<UnsignedResult> {
        std::mem::take(&mut self.unsigned_results)
    }

    /// Step the machine until it can end, or until it needs more bytes or
    /// hits an error.
    pub fn process(&mut self, reader: &mut BufferReader) -> Result<(), ErrorCode> {
        debug_assert!(self.mode != ParserMode::Undefined);
        if matches!(self.state, ParserState::End | ParserState::Error) {
            self.state = ParserState::Start;
        }

        while !self.can_end_parse() {
            match self.state {
                ParserState::Start => self.start_state(reader)?,
                ParserState::GetStart => {
                    let result = self.current_retrieval();
                    result.key.clear();
                    reader.read_until(b' ', &mut result.key)?;
                    reader.skip_bytes(1)?;
                    self.state = ParserState::GetKey;
                }
                ParserState::GetKey => {
                    let flags = reader.read_unsigned()?;
                    reader.skip_bytes(1)?;
                    self.current_retrieval().flags = flags as u32;
                    self.state = ParserState::GetFlag;
                }
                ParserState::GetFlag => {
                    let bytes = reader.read_unsigned()?;
                    reader.skip_bytes(1)?; // " " or "\r"
                    let result = self.current_retrieval();
                    result.bytes = bytes as u32;
                    result.bytes_remain = result.bytes + 1; // 1 for the header LF
                    self.state = ParserState::GetBytesCas;
                }
                ParserState::GetBytesCas => {
                    // peek first: a LF here means the cas field is absent
                    let next = reader.peek(0)?;
                    if next == b'\n' {
                        self.current_retrieval().cas_unique = 0;
                    } else {
                        let cas = reader.read_unsigned()?;
                        reader.skip_bytes(1)?; // CR after cas
                        self.current_retrieval().cas_unique = cas;
                    }
                    self.state = ParserState::GetValueRemaining;
                }
                ParserState::GetValueRemaining => {
                    let result = self
                        .retrieval_results
                        .last_mut()
                        .expect("no current retrieval result");
                    if result.bytes_remain == result.bytes + 1 {
                        reader.skip_bytes(1)?; // header LF
                        result.bytes_remain -= 1;
                    }
                    if result.bytes_remain == result.bytes {
                        result.data_block.clear();
                        let needed = result.bytes as usize + 2;
                        if reader.read_left() < needed {
                            reader.set_block_size_hint(needed - reader.read_left());
                        }
                        reader.read_bytes(result.bytes as usize, &mut result.data_block)?;
                        result.bytes_remain = 0;
                    }
                    if result.bytes_remain == 0 {
                        reader.skip_bytes(2)?; // trailing CRLF
                        self.state = ParserState::Start;
                    }
                }
                ParserState::IncrDecrStart => {
                    let value = reader.read_unsigned()?;
                    reader.skip_bytes(1)?;
                    let key = self.request_keys.front().cloned().unwrap_or_default();
                    let result = self
                        .unsigned_results
                        .last_mut()
                        .expect("no current unsigned result");
                    result.value = value;
                    result.key = key;
                    self.state = ParserState::IncrDecrRemaining;
                }
                ParserState::IncrDecrRemaining => {
                    reader.skip_until(b'\n')?;
                    reader.skip_bytes(1)?;
                    self.request_keys.pop_front();
                    self.state = ParserState::Start;
                }
                ParserState::VerStart => {
                    self.process_line_result(reader)?;
                    self.state = ParserState::End;
                }
                ParserState::StatStart => {
                    self.process_line_result(reader)?;
                    self.state = ParserState::Start;
                }
                ParserState::End | ParserState::Error => {
                    // counting mode with replies still expected, but the
                    // server ended the response
                    self.state = ParserState::Error;
                    return Err(ErrorCode::Programming);
                }
            }
        }
        Ok(())
    }

    fn start_state(&mut self, reader: &mut BufferReader) -> Result<(), ErrorCode> {
        let c1 = reader.peek(0)?;
        match c1 {
            b'V' => {
                let c2 = reader.peek(1)?;
                match c2 {
                    b'A' => {
                        reader.expect_bytes(b"VALUE ")?;
                        self.retrieval_results.push(RetrievalResult::new());
                        self.state = ParserState::GetStart;
                    }
                    b'E' => {
                        reader.expect_bytes(b"VERSION ")?;
                        self.line_results.push(LineResult::default());
                        self.state = ParserState::VerStart;
                    }
                    _ => return self.fail_unexpected(c2),
                }
            }
            b'E' => {
                let c2 = reader.peek(1)?;
                match c2 {
                    b'R' => return self.fail_error_line(reader, ErrorCode::Programming, "error"),
                    b'N' => {
                        reader.expect_bytes(b"END\r\n")?;
                        self.state = ParserState::End;
                    }
                    b'X' => {
                        reader.expect_bytes(b"EXISTS\r\n")?;
                        self.emit_message(MessageKind::Exists);
                    }
                    _ => return self.fail_unexpected(c2),
                }
            }
            b'O' => {
                reader.expect_bytes(b"OK\r\n")?;
                self.emit_message(MessageKind::Ok);
            }
            b'S' => {
                let c3 = reader.peek(2)?;
                let c2 = reader.peek(1)?;
                if c2 == b'T' {
                    if c3 == b'O' {
                        reader.expect_bytes(b"STORED\r\n")?;
                        self.emit_message(MessageKind::Stored);
                    } else {
                        reader.expect_bytes(b"STAT ")?;
                        self.line_results.push(LineResult::default());
                        self.state = ParserState::StatStart;
                    }
                } else {
                    return self.fail_error_line(reader, ErrorCode::McServer, "server_error");
                }
            }
            b'D' => {
                reader.expect_bytes(b"DELETED\r\n")?;
                self.emit_message(MessageKind::Deleted);
            }
            b'N' => {
                let c5 = reader.peek(4)?;
                match c5 {
                    b'F' => {
                        reader.expect_bytes(b"NOT_FOUND\r\n")?;
                        self.emit_message(MessageKind::NotFound);
                    }
                    b'S' => {
                        reader.expect_bytes(b"NOT_STORED\r\n")?;
                        self.emit_message(MessageKind::NotStored);
                    }
                    _ => return self.fail_unexpected(c5),
                }
            }
            b'T' => {
                reader.expect_bytes(b"TOUCHED\r\n")?;
                self.emit_message(MessageKind::Touched);
            }
            b'C' => return self.fail_error_line(reader, ErrorCode::Programming, "client_error"),
            b'0'..=b'9' => {
                self.unsigned_results.push(UnsignedResult {
                    key: Bytes::new(),
                    value: 0,
                });
                self.state = ParserState::IncrDecrStart;
            }
            _ => return self.fail_unexpected(c1),
        }
        Ok(())
    }

    fn can_end_parse(&self) -> bool {
        match self.mode {
            ParserMode::EndState => matches!(self.state, ParserState::End | ParserState::Error),
            ParserMode::Counting => self.request_keys.is_empty(),
            ParserMode::Undefined => true,
        }
    }

    fn current_retrieval(&mut self) -> &mut RetrievalResult {
        self.retrieval_results
            .last_mut()
            .expect("no current retrieval result")
    }

    /// Pop the head request key and attach it to a one-line reply.
    fn emit_message(&mut self, kind: MessageKind) {
        let key = self.request_keys.pop_front().unwrap_or_default();
        self.message_results.push(MessageResult { kind, key });
    }

    fn process_line_result(&mut self, reader: &mut BufferReader) -> Result<(), ErrorCode> {
        let result = self.line_results.last_mut().expect("no current line result");
        result.line.clear();
        result.line_len = reader.read_until(b'\n', &mut result.line)?;
        reader.skip_bytes(1)?;
        Ok(())
    }

    /// Consume and log a full `ERROR` / `CLIENT_ERROR` / `SERVER_ERROR`
    /// line, then park in the terminal state.
    fn fail_error_line(
        &mut self,
        reader: &mut BufferReader,
        code: ErrorCode,
        kind: &str,
    ) -> Result<(), ErrorCode> {
        let mut line = TokenData::new();
        let n = reader.read_until(b'\n', &mut line)?;
        reader.skip_bytes(1)?;
        let text = line.to_bytes();
        let trimmed = &text[..n.saturating_sub(1)]; // drop the CR
        error!(kind, line = %String::from_utf8_lossy(trimmed), "server error line");
        self.state = ParserState::Error;
        Err(code)
    }

    fn fail_unexpected(&mut self, byte: u8) -> Result<(), ErrorCode> {
        error!(byte, "unexpected byte in response stream");
        self.state = ParserState::Error;
        Err(ErrorCode::Programming)
    }

    /// End-of-operation teardown: everything goes.
    pub fn reset(&mut self) {
        self.request_keys.clear();
        self.initial_keys.clear();
        self.retrieval_results.clear();
        self.message_results.clear();
        self.line_results.clear();
        self.unsigned_results.clear();
        self.state = ParserState::Start;
        self.mode = ParserMode::Undefined;
    }

    /// Mid-operation recovery before a retransmission: drop partial results
    /// and restore the full expected-key queue, since every reply will
    /// arrive again.
    pub fn rewind(&mut self) {
        self.retrieval_results.clear();
        self.message_results.clear();
        self.line_results.clear();
        self.unsigned_results.clear();
        self.request_keys = self.initial_keys.iter().cloned().collect();
        self.state = ParserState::Start;
    }
}
