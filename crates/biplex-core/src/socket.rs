//! Binds one transport connection to one protocol instance.
//!
//! The socket frames and deframes messages; it never interprets them.
//! Writes from concurrent tasks are serialised by the writer mutex. The
//! reader mutex exists to make `reset` safe, but by construction a session
//! runs exactly one reader at a time.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::ProtoError;
use crate::message::Message;
use crate::proto::{Proto, ProtoFactory};

/// A byte-oriented transport connection.
///
/// Blanket-implemented for every async stream; the peer layer supplies TCP,
/// Unix-socket, or TLS-wrapped streams, tests supply in-memory duplexes.
pub trait ConnStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ConnStream for T {}

struct ReadHalf {
    stream: tokio::io::ReadHalf<Box<dyn ConnStream>>,
    proto: Box<dyn Proto>,
}

struct WriteHalf {
    stream: tokio::io::WriteHalf<Box<dyn ConnStream>>,
    proto: Box<dyn Proto>,
}

/// One transport connection bound to one protocol.
pub struct Socket {
    reader: AsyncMutex<ReadHalf>,
    writer: AsyncMutex<WriteHalf>,
    closed: AtomicBool,
    id: Mutex<String>,
    local_addr: Mutex<String>,
    remote_addr: Mutex<String>,
    proto_name: Mutex<&'static str>,
}

impl Socket {
    /// Bind `conn` to the protocol produced by `factory`.
    ///
    /// One protocol instance is created per direction so reads and writes
    /// never contend on protocol state.
    pub fn new(
        conn: Box<dyn ConnStream>,
        factory: &ProtoFactory,
        local_addr: String,
        remote_addr: String,
    ) -> Self {
        let (read, write) = tokio::io::split(conn);
        let read_proto = factory();
        let proto_name = read_proto.name();
        Self {
            reader: AsyncMutex::new(ReadHalf {
                stream: read,
                proto: read_proto,
            }),
            writer: AsyncMutex::new(WriteHalf {
                stream: write,
                proto: factory(),
            }),
            closed: AtomicBool::new(false),
            // Unique per accepted connection; the client role reassigns the
            // id to its local address after dial.
            id: Mutex::new(remote_addr.clone()),
            local_addr: Mutex::new(local_addr),
            remote_addr: Mutex::new(remote_addr),
            proto_name: Mutex::new(proto_name),
        }
    }

    /// Read one message.
    pub async fn read(&self, m: &mut Message) -> Result<usize, ProtoError> {
        if self.is_closed() {
            return Err(ProtoError::Closed);
        }
        let mut half = self.reader.lock().await;
        let ReadHalf { stream, proto } = &mut *half;
        proto.unpack(stream, m).await
    }

    /// Write one message. Concurrent writers queue on the writer mutex, so
    /// frames never interleave.
    pub async fn write(&self, m: &mut Message) -> Result<usize, ProtoError> {
        if self.is_closed() {
            return Err(ProtoError::Closed);
        }
        let mut half = self.writer.lock().await;
        let WriteHalf { stream, proto } = &mut *half;
        proto.pack(stream, m).await
    }

    /// Swap in a fresh connection and protocol, preserving the socket
    /// identity. Used by session redial; the caller guarantees no read is in
    /// flight.
    pub async fn reset(
        &self,
        conn: Box<dyn ConnStream>,
        factory: &ProtoFactory,
        local_addr: String,
        remote_addr: String,
    ) {
        let (read, write) = tokio::io::split(conn);
        {
            let mut reader = self.reader.lock().await;
            let mut writer = self.writer.lock().await;
            let read_proto = factory();
            *self.proto_name.lock() = read_proto.name();
            *reader = ReadHalf {
                stream: read,
                proto: read_proto,
            };
            *writer = WriteHalf {
                stream: write,
                proto: factory(),
            };
        }
        *self.local_addr.lock() = local_addr;
        *self.remote_addr.lock() = remote_addr;
        self.closed.store(false, Ordering::Release);
        tracing::debug!(id = %self.id(), remote = %self.remote_addr(), "socket reset");
    }

    /// Shut down the write side and mark the socket closed.
    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut half = self.writer.lock().await;
        match half.stream.shutdown().await {
            // The transport may already be gone; that is not a close failure.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The session identifier string; initially the remote address.
    pub fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub fn set_id(&self, id: String) {
        *self.id.lock() = id;
    }

    pub fn local_addr(&self) -> String {
        self.local_addr.lock().clone()
    }

    pub fn remote_addr(&self) -> String {
        self.remote_addr.lock().clone()
    }

    pub fn proto_name(&self) -> &'static str {
        *self.proto_name.lock()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .field("proto", &self.proto_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
