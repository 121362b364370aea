//! Error types for arbor.
//!
//! Every error kind carries a stable numeric code that travels in the wire
//! error envelope `{"code": u32, "message": String}`. The set is closed:
//! both the server and the client match on these kinds to decide recovery.

use thiserror::Error;

/// Result type alias using arbor's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for arbor operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input or a violated precondition.
    #[error("invalid: {0}")]
    Invalid(String),

    /// I/O error on a socket, mapping, or spill file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection broke mid-exchange.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The connection could not be established.
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),

    /// No payload is registered under the requested id.
    #[error("object not exists: {0}")]
    ObjectNotExists(String),

    /// The payload exists but has not been sealed yet.
    #[error("object not sealed: {0}")]
    ObjectNotSealed(String),

    /// The payload has been spilled to disk and is not mapped.
    #[error("object spilled: {0}")]
    ObjectSpilled(String),

    /// The arena cannot satisfy the allocation, even after spilling.
    #[error("not enough memory: {0}")]
    NotEnoughMemory(String),

    /// The stream has been stopped and all chunks were consumed.
    #[error("stream drained")]
    StreamDrained,

    /// The stream was aborted by its writer or a dropped connection.
    #[error("stream failed")]
    StreamFailed,

    /// The stream is already opened in the requested mode.
    #[error("stream already opened")]
    StreamOpened,

    /// The metadata tree is structurally broken.
    #[error("invalid metadata tree: {0}")]
    MetaTreeInvalid(String),

    /// A metadata subtree lookup missed.
    #[error("metadata subtree not exists: {0}")]
    MetaTreeSubtreeNotExists(String),

    /// A key lookup missed in an index (names, dependencies).
    #[error("key error: {0}")]
    KeyError(String),

    /// The server has not finished starting up.
    #[error("server is not ready yet: {0}")]
    ServerNotReady(String),

    /// An error reported by the metadata backend (etcd, redis, ...).
    #[error("meta backend '{backend}' error: {message}")]
    MetaError { backend: String, message: String },

    /// A system call failed (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// Anything that does not fit the categories above.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// The stable wire code for this error kind. Code `0` is reserved for
    /// success and never constructed here.
    pub fn code(&self) -> u32 {
        match self {
            Error::Invalid(_) => 2,
            Error::KeyError(_) => 3,
            Error::Io(_) | Error::System(_) => 5,
            Error::ConnectionError(_) => 6,
            Error::ConnectionFailed(_) => 7,
            Error::ObjectNotExists(_) => 8,
            Error::ObjectNotSealed(_) => 9,
            Error::ObjectSpilled(_) => 10,
            Error::NotEnoughMemory(_) => 11,
            Error::StreamDrained => 12,
            Error::StreamFailed => 13,
            Error::StreamOpened => 14,
            Error::MetaTreeInvalid(_) => 15,
            Error::MetaTreeSubtreeNotExists(_) => 16,
            Error::ServerNotReady(_) => 17,
            Error::MetaError { .. } => 18,
            Error::Unknown(_) => 255,
        }
    }

    /// Rebuild an error from a wire envelope.
    pub fn from_wire(code: u32, message: String) -> Self {
        match code {
            2 => Error::Invalid(message),
            3 => Error::KeyError(message),
            5 => Error::Io(std::io::Error::other(message)),
            6 => Error::ConnectionError(message),
            7 => Error::ConnectionFailed(message),
            8 => Error::ObjectNotExists(message),
            9 => Error::ObjectNotSealed(message),
            10 => Error::ObjectSpilled(message),
            11 => Error::NotEnoughMemory(message),
            12 => Error::StreamDrained,
            13 => Error::StreamFailed,
            14 => Error::StreamOpened,
            15 => Error::MetaTreeInvalid(message),
            16 => Error::MetaTreeSubtreeNotExists(message),
            17 => Error::ServerNotReady(message),
            18 => Error::MetaError {
                backend: "unknown".into(),
                message,
            },
            _ => Error::Unknown(message),
        }
    }

    /// Whether the error denotes a missing object rather than a failure.
    pub fn is_object_not_exists(&self) -> bool {
        matches!(self, Error::ObjectNotExists(_))
    }

    /// Whether the error denotes a drained stream.
    pub fn is_stream_drained(&self) -> bool {
        matches!(self, Error::StreamDrained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_are_stable() {
        let cases: Vec<Error> = vec![
            Error::Invalid("x".into()),
            Error::ObjectNotExists("x".into()),
            Error::ObjectNotSealed("x".into()),
            Error::NotEnoughMemory("x".into()),
            Error::StreamDrained,
            Error::StreamOpened,
            Error::ServerNotReady("x".into()),
        ];
        for err in cases {
            let code = err.code();
            let back = Error::from_wire(code, err.to_string());
            assert_eq!(back.code(), code);
        }
    }

    #[test]
    fn test_code_zero_is_never_used() {
        assert_ne!(Error::Unknown("x".into()).code(), 0);
    }
}
