//! The operations the lifecycle manager performs on the outside world.
//!
//! [`WebServer`](crate::WebServer) drives a [`Backend`] through socket
//! creation, optional interface binding, bind, listen and engine start, and
//! sleeps through it between failed attempts. [`NativeBackend`] does the real
//! thing with `socket2` and the hyper engine.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::engine::{Engine, EngineDaemon};
use crate::error::{Error, Result};
use crate::tls::Certificate;

/// A running transport engine.
pub trait Daemon {
    /// Whether the daemon still accepts connections on a valid listener.
    fn is_alive(&self) -> bool;

    /// Stops accepting and releases the listener.
    fn stop(self);
}

/// Socket and engine primitives used by the lifecycle manager.
///
/// A failing step hands the socket back by dropping it, which closes it.
pub trait Backend {
    type Socket;
    type Daemon: Daemon;

    fn socket(&mut self, addr: &SocketAddr) -> Result<Self::Socket>;

    fn bind_interface(&mut self, socket: &Self::Socket, interface: &str) -> Result<()>;

    fn bind(&mut self, socket: &Self::Socket, addr: &SocketAddr) -> Result<()>;

    fn listen(&mut self, socket: &Self::Socket, backlog: i32) -> Result<()>;

    /// Starts serving on a listening socket, with TLS when a certificate is
    /// given.
    fn start(
        &mut self,
        socket: Self::Socket,
        certificate: Option<&Certificate>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self::Daemon>;

    /// Blocks the supervising thread.
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Real sockets served by the hyper engine.
///
/// The reactor and the worker pool live as long as the backend, so daemon
/// restarts reuse them.
#[derive(Clone)]
pub struct NativeBackend {
    engine: Engine,
}

impl NativeBackend {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            engine: Engine::new(config)?,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Backend for NativeBackend {
    type Socket = Socket;
    type Daemon = EngineDaemon;

    fn socket(&mut self, addr: &SocketAddr) -> Result<Socket> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::Socket)?;
        socket.set_reuse_address(true).map_err(Error::Socket)?;
        Ok(socket)
    }

    fn bind_interface(&mut self, socket: &Socket, interface: &str) -> Result<()> {
        bind_device(socket, interface).map_err(|source| Error::Interface {
            interface: interface.to_string(),
            source,
        })
    }

    fn bind(&mut self, socket: &Socket, addr: &SocketAddr) -> Result<()> {
        socket.bind(&(*addr).into()).map_err(|source| Error::Bind {
            addr: *addr,
            source,
        })
    }

    fn listen(&mut self, socket: &Socket, backlog: i32) -> Result<()> {
        socket.listen(backlog).map_err(Error::Listen)
    }

    fn start(
        &mut self,
        socket: Socket,
        certificate: Option<&Certificate>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<EngineDaemon> {
        self.engine.start(socket.into(), certificate, dispatcher)
    }
}

impl Daemon for EngineDaemon {
    fn is_alive(&self) -> bool {
        EngineDaemon::is_alive(self)
    }

    fn stop(self) {
        EngineDaemon::stop(self)
    }
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_device(socket: &Socket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_device(_: &Socket, _: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "binding to an interface is not supported on this platform",
    ))
}
