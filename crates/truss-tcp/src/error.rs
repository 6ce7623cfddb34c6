//! Error taxonomy of the client surface.
//!
//! Three disjoint kinds: programming errors are asserted at the call site
//! and never reach these types; resource errors are reported as return
//! codes and never escalated to callbacks; stack errors are forwarded
//! verbatim through the error-callback bridge and as the `Stack` variant.

use thiserror::Error;

/// Stack-native error codes, forwarded unchanged from the raw API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("out of memory")]
    Memory,
    #[error("buffer error")]
    Buffer,
    #[error("timeout")]
    Timeout,
    #[error("routing problem")]
    Routing,
    #[error("operation in progress")]
    InProgress,
    #[error("illegal value")]
    Value,
    #[error("operation would block")]
    WouldBlock,
    #[error("address in use")]
    Used,
    #[error("already connecting")]
    Already,
    #[error("not connected")]
    NotConnected,
    #[error("low-level netif error")]
    Interface,
    #[error("connection aborted")]
    Aborted,
    #[error("connection reset")]
    Reset,
    #[error("connection closed")]
    Closed,
    #[error("illegal argument")]
    Argument,
}

/// Result currency of the stack callbacks and raw operations.
pub type StackResult<T = ()> = Result<T, StackError>;

/// Client-surface errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TcpError {
    /// A connection context already exists, or a write is already active.
    #[error("resource in use")]
    InUse,
    /// The operation needs state that has not been set up.
    #[error("invalid state")]
    InvalidState,
    #[error("invalid argument")]
    InvalidArg,
    /// The stack could not provide a resource (no PCB, no route).
    #[error("i/o failure")]
    Io,
    #[error("timed out")]
    Timeout,
    #[error("no data available")]
    NoData,
    #[error("unspecified failure")]
    Generic,
    /// A stack-native code forwarded verbatim.
    #[error("stack error: {0}")]
    Stack(#[from] StackError),
}
