//! Error types shared by receivers, transmitters and sinks.

use std::{fmt, io, net::SocketAddr};

use thiserror::Error;

/// Invalid configuration, reported before any socket is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown protocol '{0}' (expected one of: {1})")]
    UnknownProtocol(String, &'static str),

    #[error("protocol '{protocol}' is not supported by the {role}")]
    UnsupportedProtocol {
        protocol: String,
        role: &'static str,
    },

    #[error("unknown data format '{0}' (expected one of: raw, split, tagblock)")]
    UnknownDataFormat(String),

    #[error("unknown chunker '{0}' (expected one of: fixed, multipart)")]
    UnknownChunker(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure while splitting a sentence stream into chunks.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("line with NMEA prefix not recognized: {line}")]
    UnrecognizedPrefix { line: String },

    #[error("line does not carry a valid multipart header: {line}")]
    MalformedHeader { line: String },

    #[error("multipart sequence broken at: {line}")]
    OutOfSequence { line: String },

    #[error("stream ended inside a multipart group ({} buffered lines)", .lines.len())]
    IncompleteGroup { lines: Vec<String> },

    #[error("could not read sentences: {0}")]
    Io(#[from] io::Error),
}

/// Registry key for sink failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkErrorKind {
    PermissionDenied,
    Unavailable,
    Closed,
    Io,
}

impl fmt::Display for SinkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkErrorKind::PermissionDenied => "permission denied",
            SinkErrorKind::Unavailable => "unavailable",
            SinkErrorKind::Closed => "closed",
            SinkErrorKind::Io => "i/o",
        };
        f.write_str(name)
    }
}

/// A sink could not publish a packet.
#[derive(Debug, Clone, Error)]
#[error("sink '{sink}' {kind}: {message}")]
pub struct SinkError {
    pub sink: String,
    pub kind: SinkErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn new(sink: impl Into<String>, kind: SinkErrorKind, message: impl Into<String>) -> Self {
        SinkError {
            sink: sink.into(),
            kind,
            message: message.into(),
        }
    }

    /// Errors after which the sink will never succeed again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            SinkErrorKind::PermissionDenied | SinkErrorKind::Closed
        )
    }
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("giving up on {addr} after {attempts} connection attempts: {source}")]
    RetriesExhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("fatal error on {addr}: {source}")]
    Fatal {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum TransmitterError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not send to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("could not resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not read {path}: {source}")]
    Source {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a receiver run ended with a failure.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{name} failed: {source}")]
    Receiver {
        name: String,
        #[source]
        source: ReceiverError,
    },

    #[error("receiver task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("stopped after sink errors")]
    SinkFailure,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Connection errors worth another attempt. Everything else is treated as fatal.
pub fn is_transient(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::Unsupported
    )
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::refused(io::ErrorKind::ConnectionRefused, true)]
    #[case::reset(io::ErrorKind::ConnectionReset, true)]
    #[case::timeout(io::ErrorKind::TimedOut, true)]
    #[case::eof(io::ErrorKind::UnexpectedEof, true)]
    #[case::permission(io::ErrorKind::PermissionDenied, false)]
    #[case::invalid_input(io::ErrorKind::InvalidInput, false)]
    fn test_is_transient(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_transient(&io::Error::from(kind)), expected);
    }

    #[test]
    fn test_sink_error_fatality() {
        assert!(SinkError::new("http", SinkErrorKind::PermissionDenied, "403").is_fatal());
        assert!(!SinkError::new("http", SinkErrorKind::Unavailable, "queue full").is_fatal());
    }
}
