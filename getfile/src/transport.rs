//! Framed Transport: connect/accept over TCP with consistent timeouts and
//! socket options, shared by the client, proxy, and cache.
//!
//! Every endpoint applies a 50 second receive/send timeout and enables
//! address reuse. Setup failures here are always fatal to the calling
//! operation — the caller maps them to `Outcome::Invalid` on the client
//! side, or a closed connection with no response on the server side.

use socket2::{Domain, Socket, TcpKeepalive, Type};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Receive/send timeout applied to every socket this module hands out.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(50);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not resolve host {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("socket setup failed: {0}")]
    Setup(#[from] std::io::Error),
}

fn apply_common_options(socket: &Socket) -> std::io::Result<()> {
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    socket.set_write_timeout(Some(SOCKET_TIMEOUT))?;
    socket.set_tcp_keepalive(&default_keepalive())?;
    Ok(())
}

/// Resolves `host:port` and connects, applying the shared timeout/reuse
/// options before the connect completes.
pub fn connect(host: &str, port: u16) -> Result<TcpStream, Error> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::Resolve {
            host: host.to_string(),
            port,
        })?
        .next()
        .ok_or_else(|| Error::Resolve {
            host: host.to_string(),
            port,
        })?;

    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    apply_common_options(&socket)?;
    socket.connect(&addr.into())?;
    Ok(socket.into())
}

/// A bound, listening socket with a configurable pending-connection backlog.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn bind(port: u16, backlog: i32) -> Result<Self, Error> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        apply_common_options(&socket)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        Ok(Listener {
            inner: socket.into(),
        })
    }

    /// Accepts one connection, applying the receive/send timeouts to the
    /// accepted stream (the listening socket's own options do not propagate
    /// to accepted sockets on every platform, so this is set explicitly).
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr), Error> {
        let (stream, addr) = self.inner.accept()?;
        stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Keepalive settings applied to every socket this module hands out.
pub fn default_keepalive() -> TcpKeepalive {
    TcpKeepalive::new().with_time(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn listener_accepts_and_applies_timeouts() {
        let listener = Listener::bind(0, 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut stream = connect("127.0.0.1", addr.port()).unwrap();
            stream.write_all(b"ping").unwrap();
        });

        let (mut accepted, _peer) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        handle.join().unwrap();
    }
}
