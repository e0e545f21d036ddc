//! Readiness reactor for accepted connections.
//!
//! One event-loop thread polls every registered stream and wakes the task
//! waiting on it. Each direction of a stream keeps its readiness as a tick
//! counter plus a ready bit. A task only clears readiness if no event arrived
//! since it last looked, so an event landing between a `WouldBlock` and the
//! clear is kept.
//!
//! Streams start out ready in both directions. Bytes a client sent before the
//! stream was registered are therefore read on the first poll instead of
//! waiting for an edge that already happened.
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::ready;
use mio::{Events, Interest, Token};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{ReactorError, ReactorResult};

const WAKE: Token = Token(usize::MAX);

const READY: usize = 1;
const TICK: usize = 2;

/// Handle to the reactor thread.
///
/// Clones share one event loop. The loop ends once every handle, including
/// the ones held by registered streams, is gone.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    waker: mio::Waker,
}

struct Shared {
    registry: mio::Registry,
    next_token: AtomicUsize,
    sources: Mutex<HashMap<Token, Arc<Source>>>,
    closed: AtomicBool,
}

impl Reactor {
    pub fn new() -> ReactorResult<Self> {
        let poll = mio::Poll::new().map_err(ReactorError::Init)?;
        let waker = mio::Waker::new(poll.registry(), WAKE).map_err(ReactorError::Init)?;
        let shared = Arc::new(Shared {
            registry: poll.registry().try_clone().map_err(ReactorError::Init)?,
            next_token: AtomicUsize::new(0),
            sources: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        std::thread::Builder::new()
            .name("vigil-reactor".to_owned())
            .spawn({
                let shared = shared.clone();
                move || {
                    if let Err(err) = shared.run(poll) {
                        log::error!("reactor stopped: {}", err);
                    }
                }
            })
            .map_err(ReactorError::Init)?;

        Ok(Reactor {
            inner: Arc::new(Inner { shared, waker }),
        })
    }

    /// Takes over an accepted, non-blocking stream.
    ///
    /// The source is in place before the stream is handed to the poller, so
    /// no event for it can be dropped as unknown.
    pub fn register(&self, mut io: mio::net::TcpStream) -> ReactorResult<TcpStream> {
        let shared = &self.inner.shared;
        let token = Token(shared.next_token.fetch_add(1, Ordering::Relaxed));
        let source = Arc::new(Source::default());

        shared.sources()?.insert(token, source.clone());

        if let Err(err) = shared
            .registry
            .register(&mut io, token, Interest::READABLE | Interest::WRITABLE)
        {
            shared.sources()?.remove(&token);
            return Err(ReactorError::Registration(err));
        }

        Ok(TcpStream {
            io,
            token,
            source,
            reactor: self.clone(),
        })
    }

    /// Number of streams currently registered.
    pub fn connections(&self) -> usize {
        self.inner.shared.sources().map_or(0, |sources| sources.len())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            log::warn!("could not wake the reactor for shutdown: {}", err);
        }
    }
}

impl Shared {
    fn sources(&self) -> ReactorResult<MutexGuard<'_, HashMap<Token, Arc<Source>>>> {
        self.sources.lock().map_err(|_| ReactorError::LockPoisoned)
    }

    fn run(&self, mut poll: mio::Poll) -> ReactorResult<()> {
        let mut events = Events::with_capacity(256);
        let mut fired = Vec::new();

        while !self.closed.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ReactorError::Polling(err));
            }

            {
                let sources = self.sources()?;
                for event in events.iter() {
                    if let Some(source) = sources.get(&event.token()) {
                        let read = event.is_readable() || event.is_read_closed() || event.is_error();
                        let write = event.is_writable() || event.is_write_closed() || event.is_error();
                        fired.push((source.clone(), read, write));
                    }
                }
            }

            for (source, read, write) in fired.drain(..) {
                if read {
                    source.read.fire();
                }
                if write {
                    source.write.fire();
                }
            }
        }

        log::debug!("reactor closed");
        Ok(())
    }
}

#[derive(Default)]
struct Source {
    read: Readiness,
    write: Readiness,
}

/// Readiness of one direction of a stream.
struct Readiness {
    state: AtomicUsize,
    waiter: Mutex<Option<Waker>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness {
            state: AtomicUsize::new(READY),
            waiter: Mutex::new(None),
        }
    }
}

impl Readiness {
    fn waiter(&self) -> MutexGuard<'_, Option<Waker>> {
        self.waiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                Some(state.wrapping_add(TICK) | READY)
            });
        let waiter = self.waiter().take();
        if let Some(waker) = waiter {
            waker.wake();
        }
    }

    /// Resolves to the current state once ready, parking `cx` otherwise.
    fn poll(&self, cx: &Context<'_>) -> Poll<usize> {
        let state = self.state.load(Ordering::Acquire);
        if state & READY != 0 {
            return Poll::Ready(state);
        }

        {
            let mut waiter = self.waiter();
            match waiter.as_ref() {
                Some(waker) if waker.will_wake(cx.waker()) => {}
                _ => *waiter = Some(cx.waker().clone()),
            }
        }

        let state = self.state.load(Ordering::Acquire);
        if state & READY != 0 {
            Poll::Ready(state)
        } else {
            Poll::Pending
        }
    }

    /// Drops the ready bit unless an event arrived after `seen`.
    fn clear(&self, seen: usize) {
        let _ = self
            .state
            .compare_exchange(seen, seen & !READY, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// An accepted connection driven by the reactor.
pub struct TcpStream {
    io: mio::net::TcpStream,
    token: Token,
    source: Arc<Source>,
    reactor: Reactor,
}

impl TcpStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.io.peer_addr()
    }

    fn poll_io<T>(
        &self,
        readiness: &Readiness,
        cx: &Context<'_>,
        mut op: impl FnMut(&mio::net::TcpStream) -> io::Result<T>,
    ) -> Poll<io::Result<T>> {
        loop {
            let seen = ready!(readiness.poll(cx));
            match op(&self.io) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => readiness.clear(seen),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                result => return Poll::Ready(result),
            }
        }
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();
        let n = ready!(self.poll_io(&self.source.read, cx, |mut io| io.read(unfilled)))?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_io(&self.source.write, cx, |mut io| io.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes go straight to the socket.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.io.shutdown(Shutdown::Write) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Poll::Ready(Ok(())),
            result => Poll::Ready(result),
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let shared = &self.reactor.inner.shared;
        if let Ok(mut sources) = shared.sources() {
            sources.remove(&self.token);
        }
        let _ = shared.registry.deregister(&mut self.io);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::block_on;
    use futures::task::noop_waker;
    use std::io::{Read, Write};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Loopback pair: the accepted side as a mio stream, the client blocking.
    fn connected_pair() -> (mio::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(accepted), client)
    }

    #[test]
    fn test_registered_stream_reports_peer() {
        let reactor = Reactor::new().unwrap();
        let (accepted, client) = connected_pair();

        let stream = reactor.register(accepted).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), client.local_addr().unwrap());
        assert_eq!(reactor.connections(), 1);
    }

    #[test]
    fn test_exchange_with_blocking_peer() {
        let reactor = Reactor::new().unwrap();
        let (accepted, mut client) = connected_pair();

        let peer = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            std::thread::sleep(Duration::from_millis(50));
            client.write_all(b"pong").unwrap();
        });

        block_on(async {
            let mut stream = reactor.register(accepted).unwrap();
            stream.write_all(b"ping").await.unwrap();

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });

        peer.join().unwrap();
    }

    #[test]
    fn test_bytes_sent_before_registration_are_read() {
        let reactor = Reactor::new().unwrap();
        let (accepted, mut client) = connected_pair();

        client.write_all(b"early").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let received = block_on(async {
            let mut stream = reactor.register(accepted).unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });
        assert_eq!(&received, b"early");
    }

    #[test]
    fn test_clear_keeps_event_that_arrived_after_snapshot() {
        let readiness = Readiness::default();
        let waker = noop_waker();
        let cx = Context::from_waker(&waker);

        let seen = match readiness.poll(&cx) {
            Poll::Ready(state) => state,
            Poll::Pending => panic!("fresh readiness should be ready"),
        };
        readiness.fire();
        readiness.clear(seen);
        assert!(readiness.poll(&cx).is_ready());

        let seen = match readiness.poll(&cx) {
            Poll::Ready(state) => state,
            Poll::Pending => panic!("still ready"),
        };
        readiness.clear(seen);
        assert!(readiness.poll(&cx).is_pending());
    }

    #[test]
    fn test_fire_wakes_parked_task() {
        use futures::task::ArcWake;
        use std::sync::atomic::AtomicBool;

        struct Flag(AtomicBool);
        impl ArcWake for Flag {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.0.store(true, Ordering::SeqCst);
            }
        }

        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let waker = futures::task::waker(flag.clone());
        let cx = Context::from_waker(&waker);
        let readiness = Readiness::default();
        let seen = READY;
        readiness.clear(seen);

        assert!(readiness.poll(&cx).is_pending());
        readiness.fire();
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(readiness.poll(&cx).is_ready());
    }

    #[test]
    fn test_dropping_stream_removes_source() {
        let reactor = Reactor::new().unwrap();

        {
            let (accepted, _client) = connected_pair();
            let _stream = reactor.register(accepted).unwrap();
            assert_eq!(reactor.connections(), 1);
        }

        assert_eq!(reactor.connections(), 0);
    }

    #[test]
    fn test_read_reports_peer_close() {
        let reactor = Reactor::new().unwrap();
        let (accepted, client) = connected_pair();

        let n = block_on(async {
            let mut stream = reactor.register(accepted).unwrap();
            drop(client);
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap()
        });
        assert_eq!(n, 0);
    }
}
