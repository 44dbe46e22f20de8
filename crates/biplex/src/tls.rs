//! TLS collaborator contract.
//!
//! The core ships no TLS implementation; it only defines the seam. A
//! handshaker wraps the raw stream after dial (client side) or after accept
//! and before the session is admitted (server side). Failed server
//! handshakes are logged and the connection dropped without a session.

use std::io;

use biplex_core::{BoxFuture, ConnStream};

pub trait TlsHandshaker: Send + Sync + 'static {
    /// Complete a client-side handshake; `addr` is the dialed address, from
    /// which the implementation derives the server name.
    fn client_handshake<'a>(
        &'a self,
        conn: Box<dyn ConnStream>,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<Box<dyn ConnStream>>>;

    /// Complete a server-side handshake on an accepted connection.
    fn server_handshake<'a>(
        &'a self,
        conn: Box<dyn ConnStream>,
    ) -> BoxFuture<'a, io::Result<Box<dyn ConnStream>>>;
}
