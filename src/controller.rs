//! Request handlers and the multi-invocation state machine.
//!
//! The transport calls a controller several times for one request: once when
//! the head arrives, again for body data, and again while it waits for the
//! handler to produce a reply. A [`Controller`] sees every one of those
//! invocations together with the connection's [`ConnectionState`].
//! [`Dynamic`] turns a [`DynamicController`], which only knows how to build a
//! response, into a controller that waits for the body, builds once and keeps
//! re-serving the cached result.

use std::thread;
use std::time::Duration;

use crate::http::{Bytes, HeaderMap, Method, PeerAddr, Reply, RequestHead, StatusCode};
use crate::state::{ConnectionId, ConnectionState};

/// What the transport should do with a connection after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the connection. If no reply was queued the transport invokes
    /// the controller again.
    Continue,
    /// Drop the connection without responding.
    Abort,
}

/// Why an exchange ended, as reported to [`Controller::handle_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The response was handed to the client.
    CompletedOk,
    /// The exchange was aborted by a controller.
    WithError,
    /// No response was produced within the transport's invocation bound.
    TimeoutReached,
    /// The daemon went away while the exchange was in flight.
    DaemonShutdown,
    /// The request body could not be read.
    ReadError,
    /// The client went away before the response was sent.
    ClientAbort,
}

/// Bounded wait for a request body.
///
/// Each invocation that finds no body yet counts one iteration. When the
/// count exceeds `ceiling` the connection is aborted. With an `interval` the
/// invocation sleeps before handing control back to the transport, so the
/// default of 300 iterations at 10ms waits roughly three seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyWait {
    pub ceiling: u32,
    pub interval: Option<Duration>,
}

impl Default for BodyWait {
    fn default() -> Self {
        Self {
            ceiling: 300,
            interval: Some(Duration::from_millis(10)),
        }
    }
}

/// One invocation of a controller.
pub struct RequestContext<'a> {
    connection: ConnectionId,
    head: &'a RequestHead,
    upload: Option<&'a [u8]>,
    pub(crate) body_wait: BodyWait,
    reply: Option<Reply>,
}

impl<'a> RequestContext<'a> {
    pub fn new(connection: ConnectionId, head: &'a RequestHead, upload: Option<&'a [u8]>) -> Self {
        Self {
            connection,
            head,
            upload,
            body_wait: BodyWait::default(),
            reply: None,
        }
    }

    pub fn with_body_wait(mut self, body_wait: BodyWait) -> Self {
        self.body_wait = body_wait;
        self
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.head.peer
    }

    /// Body data delivered with this invocation, if any.
    pub fn upload(&self) -> Option<&[u8]> {
        self.upload
    }

    pub fn body_wait(&self) -> BodyWait {
        self.body_wait
    }

    /// Queues the response for this invocation.
    ///
    /// Returns `false` when a response is already queued; the first one wins.
    pub fn queue_response(&mut self, reply: Reply) -> bool {
        if self.reply.is_some() {
            return false;
        }
        self.reply = Some(reply);
        true
    }

    pub fn response(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Reply> {
        self.reply.take()
    }
}

/// A registered request handler.
///
/// Controllers are shared by every connection and must not rely on interior
/// state for a single request; anything per-request belongs in the
/// [`ConnectionState`] passed to [`handle_request`](Self::handle_request).
pub trait Controller: Send + Sync {
    /// Whether this controller serves `method` on `path`.
    fn valid_path(&self, path: &str, method: &Method) -> bool;

    /// Handles one invocation. `state` is `None` on the first invocation of
    /// an exchange; whatever the controller leaves in it is handed back on
    /// the next one and finally to [`handle_complete`](Self::handle_complete).
    fn handle_request(
        &self,
        ctx: &mut RequestContext<'_>,
        state: &mut Option<ConnectionState>,
    ) -> Flow;

    /// Called exactly once when the exchange ends, if a state was created.
    fn handle_complete(&self, state: ConnectionState, reason: TerminationReason) {
        log::trace!("dropping connection state after {:?}", reason);
        drop(state);
    }

    fn create_state(&self) -> ConnectionState {
        ConnectionState::new()
    }
}

/// Status of a built response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Code(StatusCode),
    /// Do not respond; drop the connection.
    Abort,
}

/// Status and headers produced alongside a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseParams {
    pub status: ResponseStatus,
    /// Informational only; the status line is framed by the transport.
    pub message: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl ResponseParams {
    pub fn ok() -> Self {
        Self::status(StatusCode::OK)
    }

    pub fn status(code: StatusCode) -> Self {
        Self {
            status: ResponseStatus::Code(code),
            message: None,
            headers: Vec::new(),
        }
    }

    pub fn abort() -> Self {
        Self {
            status: ResponseStatus::Abort,
            message: None,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl Default for ResponseParams {
    fn default() -> Self {
        Self::ok()
    }
}

/// A controller that builds a response once, possibly after the request
/// body has arrived. Register it wrapped in [`Dynamic`].
pub trait DynamicController: Send + Sync {
    fn valid_path(&self, path: &str, method: &Method) -> bool;

    /// Builds the response. Called at most once per exchange; the body is
    /// written into `body` and `state.request_data` holds the request body.
    fn create_response(
        &self,
        ctx: &RequestContext<'_>,
        state: &ConnectionState,
        body: &mut Vec<u8>,
    ) -> ResponseParams;

    /// Whether requests with this method wait for a body before building.
    fn requires_body(&self, method: &Method) -> bool {
        *method == Method::POST
    }

    fn create_state(&self) -> ConnectionState {
        ConnectionState::new()
    }

    fn handle_complete(&self, state: ConnectionState, reason: TerminationReason) {
        log::trace!("dropping connection state after {:?}", reason);
        drop(state);
    }
}

/// Adapts a [`DynamicController`] to the [`Controller`] protocol.
#[derive(Debug, Clone, Default)]
pub struct Dynamic<C>(pub C);

impl<C> Dynamic<C> {
    pub fn new(inner: C) -> Self {
        Dynamic(inner)
    }

    pub fn inner(&self) -> &C {
        &self.0
    }
}

impl<C: DynamicController> Controller for Dynamic<C> {
    fn valid_path(&self, path: &str, method: &Method) -> bool {
        self.0.valid_path(path, method)
    }

    fn handle_request(
        &self,
        ctx: &mut RequestContext<'_>,
        state: &mut Option<ConnectionState>,
    ) -> Flow {
        let state = state.get_or_insert_with(|| self.0.create_state());

        if let Some(chunk) = ctx.upload() {
            state.request_data.extend_from_slice(chunk);
        }

        if !state.has_response() {
            let awaiting_body = self.0.requires_body(ctx.method())
                && ctx.upload().is_none()
                && state.request_data.is_empty();

            if awaiting_body {
                let wait = ctx.body_wait();
                state.wait_iterations += 1;
                if state.wait_iterations > wait.ceiling {
                    log::debug!(
                        "connection {}: no request body after {} waits, aborting",
                        ctx.connection(),
                        wait.ceiling
                    );
                    return Flow::Abort;
                }
                if let Some(interval) = wait.interval {
                    thread::sleep(interval);
                }
                return Flow::Continue;
            }

            let mut body = Vec::new();
            let params = self.0.create_response(ctx, state, &mut body);
            let status = match params.status {
                ResponseStatus::Code(code) => code,
                ResponseStatus::Abort => {
                    log::debug!("connection {}: response build aborted", ctx.connection());
                    return Flow::Abort;
                }
            };

            state.response = Some(Reply {
                status,
                headers: params.headers,
                body: Bytes::from(body),
            });
        }

        if let Some(reply) = &state.response {
            if ctx.queue_response(reply.clone()) {
                state.response_sent = true;
            }
        }

        Flow::Continue
    }

    fn handle_complete(&self, state: ConnectionState, reason: TerminationReason) {
        self.0.handle_complete(state, reason)
    }

    fn create_state(&self) -> ConnectionState {
        self.0.create_state()
    }
}
