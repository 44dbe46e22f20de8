//! RPC-plane error types.

use core::fmt;

use biplex_core::Rerror;

/// Why an outbound CALL or PUSH failed.
#[derive(Debug)]
pub enum CallError {
    /// Connection establishment exhausted the redial budget.
    DialFailed { cause: String },
    /// The transport is gone; also the fate of every pending call when a
    /// session tears down.
    ConnectionClosed { cause: String },
    /// The caller's deadline expired before the reply arrived.
    Timeout,
    /// The caller cancelled the context.
    Canceled,
    /// The allocated sequence number is still pending (wrapped counter).
    DuplicateSeq(i32),
    /// Framing the outbound message failed; nothing was written.
    WriteFailed { cause: String },
    /// The peer replied with a structured error.
    Remote(Rerror),
}

impl CallError {
    pub fn connection_closed(cause: impl fmt::Display) -> Self {
        Self::ConnectionClosed {
            cause: cause.to_string(),
        }
    }

    /// The remote error, if this failure came from the peer.
    pub fn as_remote(&self) -> Option<&Rerror> {
        match self {
            Self::Remote(rerr) => Some(rerr),
            _ => None,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialFailed { cause } => write!(f, "dial failed: {cause}"),
            Self::ConnectionClosed { cause } => write!(f, "connection closed: {cause}"),
            Self::Timeout => write!(f, "call timed out"),
            Self::Canceled => write!(f, "call canceled"),
            Self::DuplicateSeq(seq) => write!(f, "sequence {seq} is still pending"),
            Self::WriteFailed { cause } => write!(f, "write failed: {cause}"),
            Self::Remote(rerr) => write!(f, "remote error: {rerr}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(rerr) => Some(rerr),
            _ => None,
        }
    }
}

/// Peer construction errors.
#[derive(Debug)]
pub enum ConfigError {
    UnknownBodyCodec(String),
    UnsupportedNetwork(&'static str),
    UnknownNetwork(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBodyCodec(name) => write!(f, "unknown default body codec: {name}"),
            Self::UnsupportedNetwork(net) => write!(
                f,
                "network {net} is not supported; use tcp, tcp4, tcp6 or unix"
            ),
            Self::UnknownNetwork(net) => write!(f, "unknown network: {net}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The merged outcome of closing every session of a peer.
#[derive(Debug, Default)]
pub struct CloseErrors {
    errors: Vec<(String, std::io::Error)>,
}

impl CloseErrors {
    pub(crate) fn push(&mut self, session_id: String, err: std::io::Error) {
        self.errors.push((session_id, err));
    }

    pub(crate) fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &std::io::Error)> {
        self.errors.iter().map(|(id, e)| (id.as_str(), e))
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} session(s) failed to close:", self.errors.len())?;
        for (id, err) in &self.errors {
            write!(f, " [{id}: {err}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}
