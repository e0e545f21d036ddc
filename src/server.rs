//! Daemon lifecycle management.
//!
//! [`WebServer`] owns the registered controllers and the options, starts the
//! daemon with a bounded number of attempts, and supervises it: a daemon that
//! died or whose options changed is restarted from scratch.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::backend::{Backend, Daemon, NativeBackend};
use crate::config::{EngineConfig, ServerConfig, ServerOptions};
use crate::controller::Controller;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::tls::Certificate;

/// Shared, writable view of the server options.
///
/// Every update marks the options as changed; the supervision loop picks the
/// change up on its next tick and restarts the daemon with the new options.
#[derive(Clone)]
pub struct OptionsHandle {
    options: Arc<RwLock<ServerOptions>>,
    changed: Arc<AtomicBool>,
}

impl OptionsHandle {
    fn new(options: ServerOptions) -> Self {
        Self {
            options: Arc::new(RwLock::new(options)),
            changed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A snapshot of the current options.
    pub fn read(&self) -> ServerOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ServerOptions),
    {
        {
            let mut options = self
                .options
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            f(&mut options);
        }
        self.changed.store(true, Ordering::Release);
    }

    /// Swaps the TLS material. `None` switches back to plaintext.
    pub fn set_certificate(&self, certificate: Option<Certificate>) {
        self.update(|options| options.certificate = certificate);
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for OptionsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsHandle")
            .field("options", &self.read())
            .field("changed", &self.is_changed())
            .finish()
    }
}

/// An HTTP server that keeps its daemon running.
///
/// ```no_run
/// use std::sync::Arc;
/// use vigil::{Controller, WebServer};
///
/// # fn controller() -> Arc<dyn Controller> { unimplemented!() }
/// let mut server = WebServer::new(8080)?;
/// server.add_controller(controller());
/// server.options().update(|options| options.bind_loopback = true);
/// server.start()?;
/// # Ok::<(), vigil::Error>(())
/// ```
pub struct WebServer<B: Backend = NativeBackend> {
    port: u16,
    backend: B,
    options: OptionsHandle,
    controllers: Vec<Arc<dyn Controller>>,
    daemon: Option<B::Daemon>,
}

impl WebServer<NativeBackend> {
    /// A server on `port` with default options and engine settings.
    pub fn new(port: u16) -> Result<Self> {
        Ok(Self::with_backend(
            port,
            NativeBackend::new(EngineConfig::default())?,
        ))
    }

    /// A server configured from a loaded [`ServerConfig`].
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let backend = NativeBackend::new(config.engine())?;
        Ok(Self::with_backend(config.port, backend).with_options(config.options()?))
    }

    /// The address the running daemon listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.daemon.as_ref().map(|daemon| daemon.local_addr())
    }
}

impl<B: Backend> WebServer<B> {
    pub fn with_backend(port: u16, backend: B) -> Self {
        Self {
            port,
            backend,
            options: OptionsHandle::new(ServerOptions::default()),
            controllers: Vec::new(),
            daemon: None,
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = OptionsHandle::new(options);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers a controller. Earlier registrations take priority.
    pub fn add_controller(&mut self, controller: Arc<dyn Controller>) -> &mut Self {
        self.controllers.push(controller);
        self
    }

    pub fn options(&self) -> OptionsHandle {
        self.options.clone()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn daemon(&self) -> Option<&B::Daemon> {
        self.daemon.as_ref()
    }

    pub fn is_daemon_alive(&self) -> bool {
        self.daemon
            .as_ref()
            .map(|daemon| daemon.is_alive())
            .unwrap_or(false)
    }

    pub fn stop_daemon(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.stop();
        }
    }

    /// Starts the daemon with the current options, replacing a running one.
    ///
    /// Each attempt uses a fresh socket. A failed attempt closes its socket
    /// and waits `retry_backoff` before the next one.
    ///
    /// # Errors
    /// `InvalidBindAddress` when the bind address does not parse, without
    /// any attempt, and `StartExhausted` when every attempt failed.
    pub fn start_daemon(&mut self) -> Result<()> {
        self.stop_daemon();
        self.options.take_changed();

        let options = self.options.read();
        let addr = options.bind_addr(self.port)?;
        let dispatcher = Arc::new(Dispatcher::new(
            self.controllers.clone(),
            options.allow_list(),
            options.body_wait,
        ));

        for attempt in 1..=options.start_attempts {
            match self.try_start(&addr, &options, &dispatcher) {
                Ok(daemon) => {
                    log::info!("daemon started on {} (attempt {})", addr, attempt);
                    self.daemon = Some(daemon);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "daemon start attempt {}/{} on {} failed: {}",
                        attempt,
                        options.start_attempts,
                        addr,
                        err
                    );
                    self.backend.sleep(options.retry_backoff);
                }
            }
        }

        log::error!(
            "daemon on {} did not start after {} attempts",
            addr,
            options.start_attempts
        );
        Err(Error::StartExhausted(options.start_attempts))
    }

    fn try_start(
        &mut self,
        addr: &SocketAddr,
        options: &ServerOptions,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<B::Daemon> {
        let socket = self.backend.socket(addr)?;

        if let Some(interface) = options.bind_interface.as_deref().filter(|i| !i.is_empty()) {
            self.backend.bind_interface(&socket, interface)?;
        }
        self.backend.bind(&socket, addr)?;
        self.backend.listen(&socket, options.listen_backlog)?;

        self.backend
            .start(socket, options.certificate.as_ref(), dispatcher.clone())
    }

    /// Runs the daemon until the termination predicate fires.
    ///
    /// Exhausted start attempts do not end the loop; the next tick tries
    /// again. The loop only fails on a configuration error or when
    /// `max_restarts` is exceeded.
    pub fn start(&mut self) -> Result<()> {
        self.restart_daemon()?;
        let mut restarts = 0u32;

        loop {
            let interval = self.options.read().supervise_interval;
            self.backend.sleep(interval);

            if self.options.take_changed() {
                log::info!("options changed, restarting daemon");
                self.restart_daemon()?;
            } else if !self.is_daemon_alive() {
                restarts += 1;
                if let Some(limit) = self.options.read().max_restarts {
                    if restarts > limit {
                        log::error!("daemon restart limit of {} reached", limit);
                        self.stop_daemon();
                        return Err(Error::RestartLimit(limit));
                    }
                }
                log::warn!("daemon is not alive, restarting (restart {})", restarts);
                self.restart_daemon()?;
            }

            if self.options.read().terminate_requested() {
                log::info!("termination requested, stopping daemon");
                self.stop_daemon();
                return Ok(());
            }
        }
    }

    fn restart_daemon(&mut self) -> Result<()> {
        match self.start_daemon() {
            Ok(()) | Err(Error::StartExhausted(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl<B: Backend> Drop for WebServer<B> {
    fn drop(&mut self) {
        self.stop_daemon();
    }
}

impl<B: Backend> fmt::Debug for WebServer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebServer")
            .field("port", &self.port)
            .field("options", &self.options)
            .field("controllers", &self.controllers.len())
            .field("daemon", &self.daemon.is_some())
            .finish()
    }
}
