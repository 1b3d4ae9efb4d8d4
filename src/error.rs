//! Error codes shared by every layer of the client.
//!
//! Errors are values, never panics. The numeric ladder is stable so callers
//! that bridge to other languages can rely on the integers; `OK` is simply
//! `Result::Ok` and maps to `0`.

/// Failure codes surfaced by buffer, parser, and pool operations.
///
/// `IncompleteBuffer` is an internal signal ("need more bytes") and never
/// escapes a user-facing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// More bytes are required before the operation can make progress.
    IncompleteBuffer,
    /// Every key in the call was rejected client-side.
    InvalidKey,
    /// Protocol misuse reported by the server (ERROR / CLIENT_ERROR) or an
    /// unparseable response byte.
    Programming,
    /// The server reported SERVER_ERROR, or no server could take the call.
    McServer,
    /// poll(2) itself failed.
    Poll,
    /// poll(2) timed out with connections still in flight.
    PollTimeout,
    /// A connection's fd turned up POLLERR / POLLHUP / POLLNVAL.
    ConnPoll,
    /// recv failed or the peer closed mid-reply.
    Recv,
    /// sendmsg failed.
    Send,
}

impl ErrorCode {
    /// Stable integer value of this code. `0` (OK) is represented by
    /// `Result::Ok` and therefore has no variant here.
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::IncompleteBuffer => -1,
            ErrorCode::InvalidKey => -2,
            ErrorCode::Programming => -3,
            ErrorCode::McServer => -4,
            ErrorCode::Poll => -5,
            ErrorCode::PollTimeout => -6,
            ErrorCode::ConnPoll => -7,
            ErrorCode::Recv => -8,
            ErrorCode::Send => -9,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::IncompleteBuffer => "incomplete buffer",
            ErrorCode::InvalidKey => "invalid key",
            ErrorCode::Programming => "programming error",
            ErrorCode::McServer => "memcached server error",
            ErrorCode::Poll => "poll error",
            ErrorCode::PollTimeout => "poll timeout",
            ErrorCode::ConnPoll => "connection poll error",
            ErrorCode::Recv => "recv error",
            ErrorCode::Send => "send error",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

impl std::error::Error for ErrorCode {}

/// Error returned by a client operation, carrying whatever results were
/// collected before or despite the failure.
///
/// A multi-server call can succeed on some connections and fail on others;
/// the successful results are preserved in `partial`.
#[derive(Debug)]
pub struct OpError<T> {
    pub code: ErrorCode,
    pub partial: T,
}

impl<T> OpError<T> {
    pub fn new(code: ErrorCode, partial: T) -> Self {
        Self { code, partial }
    }
}

impl<T: std::fmt::Debug> std::fmt::Display for OpError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl<T: std::fmt::Debug> std::error::Error for OpError<T> {}

/// Result of a client operation: full results, or the error code plus the
/// partial results gathered from the connections that did succeed.
pub type OpResult<T> = Result<T, OpError<T>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_ladder_is_stable() {
        assert_eq!(ErrorCode::IncompleteBuffer.code(), -1);
        assert_eq!(ErrorCode::InvalidKey.code(), -2);
        assert_eq!(ErrorCode::Programming.code(), -3);
        assert_eq!(ErrorCode::McServer.code(), -4);
        assert_eq!(ErrorCode::Poll.code(), -5);
        assert_eq!(ErrorCode::PollTimeout.code(), -6);
        assert_eq!(ErrorCode::ConnPoll.code(), -7);
        assert_eq!(ErrorCode::Recv.code(), -8);
        assert_eq!(ErrorCode::Send.code(), -9);
    }

    #[test]
    fn test_op_error_keeps_partial_results() {
        let err = OpError::new(ErrorCode::PollTimeout, vec![1, 2, 3]);
        assert_eq!(err.partial, vec![1, 2, 3]);
        assert_eq!(err.to_string(), "poll timeout (-6)");
    }
}
