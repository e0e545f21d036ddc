//! The hyper transport engine.
//!
//! An acceptor thread owns the listening socket. Accepted streams are
//! registered with the [`Reactor`] and each connection runs on one worker of
//! the [`Executor`], wrapped in TLS first when a certificate is configured.
//! Every request becomes an exchange: the dispatcher is invoked until a
//! controller queues a reply or gives up. The request body is streamed in
//! between invocations. Each wait for the next chunk lasts one body-wait
//! interval on the engine's timer, and a wait that brings nothing is reported
//! to the controllers as an invocation without an upload. Once the body has
//! ended, the whole of it is handed over in one invocation.

use std::fmt;
use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hyper::body::HttpBody as _;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use mio::{Events, Interest, Poll, Token, Waker};
use tokio_rustls::TlsAcceptor;

use crate::config::EngineConfig;
use crate::controller::{Flow, RequestContext, TerminationReason};
use crate::dispatch::{Completion, Dispatcher};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::http::{PeerAddr, Reply, ReplyBody, RequestHead};
use crate::net::Reactor;
use crate::state::ConnectionId;
use crate::tls::{self, Certificate};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// How long the acceptor backs off after an accept error.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// hyper refuses smaller read buffers.
const MIN_BUF_SIZE: usize = 8192;

/// Reactor, worker pool, timer and protocol settings shared by every daemon.
#[derive(Clone)]
pub struct Engine {
    reactor: Reactor,
    executor: Executor,
    timer: Timer,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            reactor: Reactor::new()?,
            executor: Executor::new(Some(config.max_workers), Some(config.worker_keep_alive)),
            timer: Timer::new()?,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts serving a listening socket.
    pub fn start(
        &self,
        listener: std::net::TcpListener,
        certificate: Option<&Certificate>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<EngineDaemon> {
        let tls = certificate.map(tls::acceptor).transpose()?;

        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let mut listener = mio::net::TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let stopped = Arc::new(AtomicBool::new(false));

        let acceptor = Acceptor {
            listener,
            reactor: self.reactor.clone(),
            executor: self.executor.clone(),
            timer: self.timer.clone(),
            http: self.http(),
            tls,
            dispatcher,
            stopped: stopped.clone(),
            idle_invocations: self.config.idle_invocations,
            max_body_size: self.config.max_body_size,
        };

        let handle = thread::Builder::new()
            .name("vigil-acceptor".to_owned())
            .spawn(move || acceptor.run(poll))?;

        log::info!(
            "engine serving on {}{}",
            local_addr,
            if certificate.is_some() { " with tls" } else { "" }
        );

        Ok(EngineDaemon {
            local_addr,
            stopped,
            waker,
            handle: Some(handle),
        })
    }

    fn http(&self) -> Http<Executor> {
        let mut http = Http::new().with_executor(self.executor.clone());
        http.http1_keep_alive(self.config.http1_keep_alive)
            .http1_half_close(self.config.http1_half_close)
            .max_buf_size(self.config.http1_max_buf_size.max(MIN_BUF_SIZE))
            .http1_only(self.config.http1_only);

        #[cfg(feature = "http2")]
        http.http2_only(self.config.http2_only);

        http
    }
}

/// Handle to a running acceptor. Dropping it stops the daemon.
pub struct EngineDaemon {
    local_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
}

impl EngineDaemon {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && self
                .handle
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.stopped.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            log::warn!("failed to wake acceptor on {}: {}", self.local_addr, err);
        }
        if handle.join().is_err() {
            log::error!("acceptor on {} panicked", self.local_addr);
        }
        log::info!("engine on {} stopped", self.local_addr);
    }
}

impl Drop for EngineDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EngineDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineDaemon")
            .field("local_addr", &self.local_addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Suspends exchanges on a one-thread tokio time driver, so a waiting
/// exchange parks its worker instead of sleeping on it.
#[derive(Clone)]
struct Timer {
    runtime: Arc<tokio::runtime::Runtime>,
}

impl Timer {
    fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("vigil-timer")
            .enable_time()
            .build()?;
        Ok(Timer {
            runtime: Arc::new(runtime),
        })
    }

    /// Runs `future` for at most `limit`. `None` when the limit came first.
    async fn within<F: Future>(&self, limit: Duration, future: F) -> Option<F::Output> {
        let bounded = {
            let _context = self.runtime.enter();
            tokio::time::timeout(limit, future)
        };
        bounded.await.ok()
    }

    async fn sleep(&self, duration: Duration) {
        let sleep = {
            let _context = self.runtime.enter();
            tokio::time::sleep(duration)
        };
        sleep.await
    }
}

struct Acceptor {
    listener: mio::net::TcpListener,
    reactor: Reactor,
    executor: Executor,
    timer: Timer,
    http: Http<Executor>,
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
    stopped: Arc<AtomicBool>,
    idle_invocations: u32,
    max_body_size: usize,
}

impl Acceptor {
    fn run(self, mut poll: Poll) {
        let mut events = Events::with_capacity(128);
        let mut retry = false;

        while !self.stopped.load(Ordering::Acquire) {
            let timeout = retry.then_some(ACCEPT_RETRY);
            if let Err(err) = poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("acceptor poll failed: {}", err);
                break;
            }

            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let readable = events.iter().any(|event| event.token() == LISTENER);
            if readable || retry {
                match self.accept_all() {
                    Ok(pending) => retry = pending,
                    Err(err) => {
                        log::warn!("listener is gone: {}", err);
                        break;
                    }
                }
            }
        }

        self.stopped.store(true, Ordering::Release);
    }

    /// Accepts until the backlog is drained.
    ///
    /// Returns whether accepting should be retried without waiting for a new
    /// event, or the error that invalidated the listener.
    fn accept_all(&self) -> io::Result<bool> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.serve(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if is_transient(&err) => {
                    log::debug!("accept interrupted: {}", err);
                }
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    // a listener that cannot report its address is dead
                    self.listener.local_addr()?;
                    return Ok(true);
                }
            }
        }
    }

    fn serve(&self, stream: mio::net::TcpStream, peer: SocketAddr) {
        let stream = match self.reactor.register(stream) {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("failed to register connection from {}: {}", peer, err);
                return;
            }
        };

        log::debug!(
            "accepted {} ({} open connections, {} workers)",
            peer,
            self.reactor.connections(),
            self.executor.workers()
        );

        let http = self.http.clone();
        let tls = self.tls.clone();
        let exchanges = Arc::new(Exchanges {
            dispatcher: self.dispatcher.clone(),
            timer: self.timer.clone(),
            stopped: self.stopped.clone(),
            peer: PeerAddr::Inet(peer),
            idle_invocations: self.idle_invocations,
            max_body_size: self.max_body_size,
        });
        let service = service_fn(move |request| exchanges.clone().respond(request));

        let spawned = self.executor.spawn(async move {
            let result = match tls {
                Some(tls) => match tls.accept(stream).await {
                    Ok(stream) => http.serve_connection(stream, service).await,
                    Err(err) => {
                        log::debug!("tls handshake with {} failed: {}", peer, err);
                        return;
                    }
                },
                None => http.serve_connection(stream, service).await,
            };

            if let Err(err) = result {
                log::debug!("connection from {} closed: {}", peer, err);
            }
        });
        if let Err(err) = spawned {
            log::error!("dropping connection from {}: {}", peer, err);
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Outcome of one dispatcher invocation.
enum Step {
    Reply(Reply),
    Pending,
    Abort,
}

/// What became of the body after one wait interval.
enum Progress {
    /// The body ended. Everything it carried is buffered.
    Complete,
    /// The interval passed without a new chunk.
    Stalled,
    TooLarge,
    Failed(hyper::Error),
}

/// Serves the exchanges of one connection.
struct Exchanges {
    dispatcher: Arc<Dispatcher>,
    timer: Timer,
    stopped: Arc<AtomicBool>,
    peer: PeerAddr,
    idle_invocations: u32,
    max_body_size: usize,
}

impl Exchanges {
    async fn respond(self: Arc<Self>, request: Request<Body>) -> Result<Response<ReplyBody>> {
        let (parts, body) = request.into_parts();
        let head = RequestHead {
            method: parts.method,
            path: parts.uri.path().to_string(),
            version: parts.version,
            headers: parts.headers,
            peer: self.peer.clone(),
        };

        let id = self.dispatcher.open();
        let mut completion = Completion::new(self.dispatcher.clone(), id);

        if self.stopped.load(Ordering::Acquire) {
            completion.set(TerminationReason::DaemonShutdown);
            return Err(Error::Aborted);
        }

        let interval = self.dispatcher.body_wait().interval;
        let mut body = (!body.is_end_stream()).then_some(body);
        let mut received = Vec::new();
        let mut idle = 0;

        loop {
            let progress = match body.as_mut() {
                Some(stream) => {
                    let limit = interval.unwrap_or_default();
                    Some(self.read_body(stream, &mut received, limit).await)
                }
                None => {
                    match interval {
                        Some(pause) if idle > 0 => self.timer.sleep(pause).await,
                        _ => {}
                    }
                    None
                }
            };

            let mut upload = None;
            match progress {
                Some(Progress::Complete) => {
                    body = None;
                    if !received.is_empty() {
                        upload = Some(mem::take(&mut received));
                    }
                }
                Some(Progress::TooLarge) => {
                    log::debug!(
                        "connection {}: body exceeds {} bytes",
                        id,
                        self.max_body_size
                    );
                    completion.set(TerminationReason::WithError);
                    return Err(Error::Aborted);
                }
                Some(Progress::Failed(err)) => {
                    log::debug!("connection {}: reading the body failed: {}", id, err);
                    completion.set(TerminationReason::ReadError);
                    return Err(Error::Aborted);
                }
                Some(Progress::Stalled) | None => {}
            }

            match self.invoke(id, &head, upload.as_deref()) {
                Step::Reply(reply) => return Ok(reply.into_response(&head.method, completion)),
                Step::Abort => {
                    log::debug!("connection {}: aborted by controller", id);
                    completion.set(TerminationReason::WithError);
                    return Err(Error::Aborted);
                }
                Step::Pending if self.stopped.load(Ordering::Acquire) => {
                    completion.set(TerminationReason::DaemonShutdown);
                    return Err(Error::Aborted);
                }
                Step::Pending if upload.is_some() => {}
                Step::Pending => {
                    idle += 1;
                    if idle >= self.idle_invocations {
                        log::debug!("connection {}: no reply after {} invocations", id, idle);
                        completion.set(TerminationReason::TimeoutReached);
                        return Err(Error::Aborted);
                    }
                }
            }
        }
    }

    /// Buffers chunks until the body ends or `limit` passes without one.
    async fn read_body(
        &self,
        body: &mut Body,
        received: &mut Vec<u8>,
        limit: Duration,
    ) -> Progress {
        loop {
            match self.timer.within(limit, body.data()).await {
                None => return Progress::Stalled,
                Some(None) => return Progress::Complete,
                Some(Some(Err(err))) => return Progress::Failed(err),
                Some(Some(Ok(chunk))) => {
                    if received.len() + chunk.len() > self.max_body_size {
                        return Progress::TooLarge;
                    }
                    received.extend_from_slice(&chunk);
                }
            }
        }
    }

    fn invoke(&self, id: ConnectionId, head: &RequestHead, upload: Option<&[u8]>) -> Step {
        let mut ctx = RequestContext::new(id, head, upload);
        let flow = self.dispatcher.dispatch_unpaced(&mut ctx);

        match (flow, ctx.take_response()) {
            (Flow::Abort, _) => Step::Abort,
            (Flow::Continue, Some(reply)) => Step::Reply(reply),
            (Flow::Continue, None) => Step::Pending,
        }
    }
}
