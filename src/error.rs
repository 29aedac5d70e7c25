use std::io;

use thiserror::Error;

/// Errors returned by the XML stream engine.
#[derive(Debug, Error)]
pub enum Error {
    /// DNS or TCP-level connection failure.
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// TLS negotiation failed or the certificate chain was rejected.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    /// Transport-level failure while reading, including an orderly close by the peer.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    /// Transport-level failure while writing.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    /// The accumulated bytes can never form well-formed XML.
    #[error("malformed XML stream: {0}")]
    MalformedStream(String),
    /// Usage error: mixing plain and TLS, writing while not connected, and so on.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A document query expression could not be parsed.
    #[error("invalid path expression `{expression}`: {reason}")]
    InvalidPath { expression: String, reason: String },
}

/// Coarse classification of [`Error`], stable for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectFailure,
    HandshakeFailure,
    ReadFailure,
    WriteFailure,
    MalformedStream,
    ConfigurationError,
    InvalidPath,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connect { .. } => ErrorKind::ConnectFailure,
            Error::Handshake(_) => ErrorKind::HandshakeFailure,
            Error::Read(_) => ErrorKind::ReadFailure,
            Error::Write(_) => ErrorKind::WriteFailure,
            Error::MalformedStream(_) => ErrorKind::MalformedStream,
            Error::Configuration(_) => ErrorKind::ConfigurationError,
            Error::InvalidPath { .. } => ErrorKind::InvalidPath,
        }
    }

    pub(crate) fn not_connected() -> Self {
        Error::Configuration("not connected".to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
