//! The byte-stream abstraction the driver is built on top of.
//!
//! `spec.md` treats the calling program's event loop as an external
//! collaborator: the core is "parameterized over a reactor that delivers
//! socket readiness". In Rust that parameterization is simply "any
//! `AsyncRead + AsyncWrite` future-based socket", since `async`/`await`
//! already erases the concrete reactor. [`Socket`] is that seam: drivers are
//! generic over it so tests can swap in an in-memory duplex pipe instead of
//! a real TCP or Unix-domain socket.

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// A connected, full-duplex byte stream. Implemented for `tokio`'s TCP and
/// Unix-domain socket types, and for any in-memory test double that is
/// itself `AsyncRead + AsyncWrite`.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A boxed, type-erased [`Socket`], used once a connection has settled on
/// a concrete transport (TCP vs. Unix) so the rest of the driver doesn't
/// need to be generic over it.
pub type BoxSocket = Box<dyn Socket>;

pub async fn connect_tcp(host: &str, port: u16) -> io::Result<BoxSocket> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

pub async fn connect_uds(path: impl AsRef<Path>) -> io::Result<BoxSocket> {
    let stream = UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}
