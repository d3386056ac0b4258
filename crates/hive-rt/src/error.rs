//! Error taxonomy for the Hive runtime.
//!
//! One crate-wide [`Error`] enum covers the five failure families the
//! runtime produces: protocol errors (malformed or out-of-order BASP
//! traffic), network errors, delivery errors (dead or unknown actors),
//! handler errors, and configuration errors. Errors are cheap to clone
//! and comparable so they can travel inside response messages.

use crate::node::NodeId;

/// Stable numeric codes for [`Error`] values crossing the wire.
///
/// Only the discriminant travels; detail strings stay on the node that
/// produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    MalformedHeader = 1,
    VersionMismatch = 2,
    OutOfOrderSequence = 3,
    DuplicatePeer = 4,
    SelfConnection = 5,
    Network = 6,
    ConnectionClosed = 7,
    NoSuchActor = 8,
    RequestToDeadActor = 9,
    RequestTimeout = 10,
    UnhandledException = 11,
    UnexpectedMessage = 12,
    UnexpectedResponse = 13,
    InvalidOption = 14,
    UnknownType = 15,
    DuplicateTypeId = 16,
    SystemShutdown = 17,
    UnexpectedEof = 18,
    InvalidUtf8 = 19,
    TypeMismatch = 20,
    MailboxFull = 21,
    Terminated = 22,
}

/// Runtime error. See the module docs for the grouping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    // -- protocol ----------------------------------------------------------
    #[error("malformed BASP header")]
    MalformedHeader,
    #[error("BASP protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u64, remote: u64 },
    #[error("out-of-order sequence number: expected {expected}, got {got}")]
    OutOfOrderSequence { expected: u64, got: u64 },
    #[error("node {0} is already connected")]
    DuplicatePeer(NodeId),
    #[error("connection to own node rejected")]
    SelfConnection,

    // -- network -----------------------------------------------------------
    #[error("network error: {0}")]
    Network(String),
    #[error("connection closed")]
    ConnectionClosed,

    // -- delivery ----------------------------------------------------------
    #[error("no such actor")]
    NoSuchActor,
    #[error("request target terminated before answering")]
    RequestToDeadActor,
    #[error("request timed out")]
    RequestTimeout,

    // -- handler -----------------------------------------------------------
    #[error("handler raised an unhandled exception")]
    UnhandledException,
    #[error("no handler matched the message")]
    UnexpectedMessage,
    #[error("response does not match the request's expected type")]
    UnexpectedResponse,

    // -- configuration & registry -------------------------------------------
    #[error("invalid configuration option: {0}")]
    InvalidOption(String),
    #[error("unknown type id {0}")]
    UnknownType(u16),
    #[error("type id {0} is already registered to a different type")]
    DuplicateTypeId(u16),
    #[error("actor system is shutting down")]
    SystemShutdown,

    // -- codec -------------------------------------------------------------
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("value type does not match the requested type")]
    TypeMismatch,

    // -- backpressure ------------------------------------------------------
    #[error("bounded mailbox is full")]
    MailboxFull,

    /// Returned by blocking receives once the calling actor has been
    /// terminated (killed, linked exit, or `quit`).
    #[error("actor terminated")]
    Terminated,
}

impl Error {
    /// Stable numeric code used by the wire codec.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::MalformedHeader => ErrorCode::MalformedHeader,
            Error::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            Error::OutOfOrderSequence { .. } => ErrorCode::OutOfOrderSequence,
            Error::DuplicatePeer(_) => ErrorCode::DuplicatePeer,
            Error::SelfConnection => ErrorCode::SelfConnection,
            Error::Network(_) => ErrorCode::Network,
            Error::ConnectionClosed => ErrorCode::ConnectionClosed,
            Error::NoSuchActor => ErrorCode::NoSuchActor,
            Error::RequestToDeadActor => ErrorCode::RequestToDeadActor,
            Error::RequestTimeout => ErrorCode::RequestTimeout,
            Error::UnhandledException => ErrorCode::UnhandledException,
            Error::UnexpectedMessage => ErrorCode::UnexpectedMessage,
            Error::UnexpectedResponse => ErrorCode::UnexpectedResponse,
            Error::InvalidOption(_) => ErrorCode::InvalidOption,
            Error::UnknownType(_) => ErrorCode::UnknownType,
            Error::DuplicateTypeId(_) => ErrorCode::DuplicateTypeId,
            Error::SystemShutdown => ErrorCode::SystemShutdown,
            Error::UnexpectedEof => ErrorCode::UnexpectedEof,
            Error::InvalidUtf8 => ErrorCode::InvalidUtf8,
            Error::TypeMismatch => ErrorCode::TypeMismatch,
            Error::MailboxFull => ErrorCode::MailboxFull,
            Error::Terminated => ErrorCode::Terminated,
        }
    }

    /// Reconstruct an error from a wire code. Detail fields are lost in
    /// transit; the discriminant survives.
    pub fn from_code(code: u8) -> Option<Error> {
        Some(match code {
            1 => Error::MalformedHeader,
            2 => Error::VersionMismatch { local: 0, remote: 0 },
            3 => Error::OutOfOrderSequence { expected: 0, got: 0 },
            4 => Error::DuplicatePeer(NodeId::none()),
            5 => Error::SelfConnection,
            6 => Error::Network(String::new()),
            7 => Error::ConnectionClosed,
            8 => Error::NoSuchActor,
            9 => Error::RequestToDeadActor,
            10 => Error::RequestTimeout,
            11 => Error::UnhandledException,
            12 => Error::UnexpectedMessage,
            13 => Error::UnexpectedResponse,
            14 => Error::InvalidOption(String::new()),
            15 => Error::UnknownType(0),
            16 => Error::DuplicateTypeId(0),
            17 => Error::SystemShutdown,
            18 => Error::UnexpectedEof,
            19 => Error::InvalidUtf8,
            20 => Error::TypeMismatch,
            21 => Error::MailboxFull,
            22 => Error::Terminated,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
