//! Admission, routing and completion forwarding.

use std::fmt;
use std::sync::Arc;

use crate::allow::AllowList;
use crate::controller::{BodyWait, Controller, Flow, RequestContext, TerminationReason};
use crate::http::{Method, Reply, StatusCode};
use crate::state::{ConnectionId, Slot, StateRegistry};

/// Routes invocations to the first matching controller.
///
/// Every invocation passes the allow-list first. The first invocation of an
/// exchange picks a controller by scanning in registration order; once that
/// controller has created a state, later invocations go straight to it.
pub struct Dispatcher {
    controllers: Vec<Arc<dyn Controller>>,
    allow: AllowList,
    body_wait: BodyWait,
    states: StateRegistry,
}

impl Dispatcher {
    pub fn new(controllers: Vec<Arc<dyn Controller>>, allow: AllowList, body_wait: BodyWait) -> Self {
        Self {
            controllers,
            allow,
            body_wait,
            states: StateRegistry::new(),
        }
    }

    /// Starts a new exchange.
    pub fn open(&self) -> ConnectionId {
        self.states.next_id()
    }

    /// The first controller registered for `method` on `path`.
    pub fn route(&self, path: &str, method: &Method) -> Option<&Arc<dyn Controller>> {
        self.controllers
            .iter()
            .find(|controller| controller.valid_path(path, method))
    }

    /// Runs one invocation.
    pub fn dispatch(&self, ctx: &mut RequestContext<'_>) -> Flow {
        self.run(ctx, self.body_wait)
    }

    /// Runs one invocation without the body-wait sleep.
    ///
    /// For transports that suspend between invocations themselves. The wait
    /// ceiling still applies.
    pub fn dispatch_unpaced(&self, ctx: &mut RequestContext<'_>) -> Flow {
        let wait = BodyWait {
            interval: None,
            ..self.body_wait
        };
        self.run(ctx, wait)
    }

    fn run(&self, ctx: &mut RequestContext<'_>, body_wait: BodyWait) -> Flow {
        ctx.body_wait = body_wait;
        let id = ctx.connection();

        if !self.allow.permits_peer(ctx.peer()) {
            log::debug!("connection {}: source {:?} not allowed", id, ctx.peer());
            ctx.queue_response(Reply::empty(StatusCode::FORBIDDEN));
            return Flow::Continue;
        }

        let (controller, mut state) = match self.states.take(id) {
            Some(slot) => (slot.owner, Some(slot.state)),
            None => match self.route(ctx.path(), ctx.method()) {
                Some(controller) => (controller.clone(), None),
                None => {
                    log::debug!("connection {}: no controller for {} {}", id, ctx.method(), ctx.path());
                    ctx.queue_response(Reply::empty(StatusCode::NOT_FOUND));
                    return Flow::Continue;
                }
            },
        };

        let flow = controller.handle_request(ctx, &mut state);

        if let Some(state) = state {
            self.states.put(id, Slot { owner: controller, state });
        }

        flow
    }

    /// Ends an exchange, handing its state to the owning controller.
    ///
    /// Returns whether a state existed. Calling this twice for the same
    /// exchange is harmless; the state is only handed over once.
    pub fn complete(&self, id: ConnectionId, reason: TerminationReason) -> bool {
        match self.states.take(id) {
            Some(slot) => {
                log::debug!("connection {}: completed ({:?})", id, reason);
                slot.owner.handle_complete(slot.state, reason);
                true
            }
            None => false,
        }
    }

    /// Number of exchanges currently holding a state.
    pub fn live_states(&self) -> usize {
        self.states.len()
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    pub fn body_wait(&self) -> BodyWait {
        self.body_wait
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("controllers", &self.controllers.len())
            .field("allow", &self.allow)
            .field("body_wait", &self.body_wait)
            .field("states", &self.states)
            .finish()
    }
}

/// Completes an exchange when dropped.
///
/// The transport creates one per exchange and records the outcome on it as
/// the exchange progresses. Whatever path drops it, the dispatcher sees the
/// completion exactly once. Dropping it without a recorded outcome means the
/// client went away.
pub(crate) struct Completion {
    dispatcher: Arc<Dispatcher>,
    id: ConnectionId,
    reason: TerminationReason,
}

impl Completion {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, id: ConnectionId) -> Self {
        Self {
            dispatcher,
            id,
            reason: TerminationReason::ClientAbort,
        }
    }

    pub(crate) fn set(&mut self, reason: TerminationReason) {
        self.reason = reason;
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.dispatcher.complete(self.id, self.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Dynamic, DynamicController, ResponseParams};
    use crate::http::{PeerAddr, RequestHead};
    use crate::state::ConnectionState;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Counts drops of the state it is attached to.
    struct DropProbe(Arc<AtomicUsize>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Answers GET and POST under `prefix` with a fixed body and tags its
    /// states with a drop probe.
    struct Fixed {
        prefix: &'static str,
        exact: bool,
        body: &'static str,
        drops: Arc<AtomicUsize>,
        completions: Arc<Mutex<Vec<TerminationReason>>>,
    }

    impl Fixed {
        fn new(prefix: &'static str, body: &'static str) -> Self {
            Self {
                prefix,
                exact: false,
                body,
                drops: Arc::new(AtomicUsize::new(0)),
                completions: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl DynamicController for Fixed {
        fn valid_path(&self, path: &str, method: &Method) -> bool {
            let matches = if self.exact {
                path == self.prefix
            } else {
                path.starts_with(self.prefix)
            };
            matches && (*method == Method::GET || *method == Method::POST)
        }

        fn create_response(
            &self,
            _: &RequestContext<'_>,
            _: &ConnectionState,
            body: &mut Vec<u8>,
        ) -> ResponseParams {
            body.extend_from_slice(self.body.as_bytes());
            ResponseParams::ok()
        }

        fn create_state(&self) -> ConnectionState {
            let mut state = ConnectionState::new();
            state.extensions.insert(DropProbe(self.drops.clone()));
            state
        }

        fn handle_complete(&self, state: ConnectionState, reason: TerminationReason) {
            self.completions.lock().unwrap().push(reason);
            drop(state);
        }
    }

    fn shared<C: Controller + 'static>(controller: C) -> Arc<dyn Controller> {
        Arc::new(controller)
    }

    fn peer(addr: &str) -> PeerAddr {
        PeerAddr::Inet(addr.parse::<SocketAddr>().unwrap())
    }

    fn dispatcher(controllers: Vec<Arc<dyn Controller>>, allow: AllowList) -> Dispatcher {
        let wait = BodyWait {
            ceiling: 3,
            interval: None,
        };
        Dispatcher::new(controllers, allow, wait)
    }

    fn call(
        dispatcher: &Dispatcher,
        id: ConnectionId,
        head: &RequestHead,
        upload: Option<&[u8]>,
    ) -> (Flow, Option<Reply>) {
        let mut ctx = RequestContext::new(id, head, upload);
        let flow = dispatcher.dispatch(&mut ctx);
        (flow, ctx.take_response())
    }

    #[test]
    fn test_first_registered_match_wins() {
        let first = shared(Dynamic(Fixed::new("/", "first")));
        let second = shared(Dynamic(Fixed::new("/a", "second")));
        let d = dispatcher(vec![first, second], AllowList::default());

        let head = RequestHead::new(Method::GET, "/a/b", peer("127.0.0.1:1"));
        let (_, reply) = call(&d, d.open(), &head, None);
        assert_eq!(reply.unwrap().body, "first");
    }

    #[test]
    fn test_scenario_a_status_codes() {
        let mut root = Fixed::new("/", "ok");
        root.exact = true;
        let root = shared(Dynamic(root));

        let d = dispatcher(vec![root.clone()], AllowList::default());
        let head = RequestHead::new(Method::GET, "/", peer("10.0.0.2:40000"));
        let (flow, reply) = call(&d, d.open(), &head, None);
        let reply = reply.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, "ok");

        let head = RequestHead::new(Method::GET, "/missing", peer("10.0.0.2:40000"));
        let (_, reply) = call(&d, d.open(), &head, None);
        let reply = reply.unwrap();
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert!(reply.body.is_empty());

        let restricted = dispatcher(vec![root], AllowList::new(["10.0.0.1"]));
        let head = RequestHead::new(Method::GET, "/", peer("10.0.0.2:40000"));
        let (_, reply) = call(&restricted, restricted.open(), &head, None);
        let reply = reply.unwrap();
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert!(reply.body.is_empty());
        assert_eq!(restricted.live_states(), 0);
    }

    #[test]
    fn test_forbidden_before_routing() {
        struct Panics;
        impl Controller for Panics {
            fn valid_path(&self, _: &str, _: &Method) -> bool {
                panic!("routing must not run for denied peers")
            }
            fn handle_request(
                &self,
                _: &mut RequestContext<'_>,
                _: &mut Option<ConnectionState>,
            ) -> Flow {
                unreachable!()
            }
        }
        let d = dispatcher(vec![shared(Panics)], AllowList::new(["10.0.0.1"]));
        let head = RequestHead::new(Method::GET, "/", PeerAddr::Unix);
        let (_, reply) = call(&d, d.open(), &head, None);
        assert_eq!(reply.unwrap().status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_scenario_b_post_waits_then_builds_once() {
        let fixed = Fixed::new("/upload", "stored");
        let drops = fixed.drops.clone();
        let d = dispatcher(vec![shared(Dynamic(fixed))], AllowList::default());
        let head = RequestHead::new(Method::POST, "/upload", peer("127.0.0.1:5"));
        let id = d.open();

        let (flow, reply) = call(&d, id, &head, None);
        assert_eq!(flow, Flow::Continue);
        assert!(reply.is_none());
        assert_eq!(d.live_states(), 1);

        let (flow, reply) = call(&d, id, &head, Some(b"data"));
        assert_eq!(flow, Flow::Continue);
        assert_eq!(reply.unwrap().body, "stored");

        assert!(d.complete(id, TerminationReason::CompletedOk));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(d.live_states(), 0);
    }

    #[test]
    fn test_state_destroyed_once_for_every_outcome() {
        let fixed = Fixed::new("/", "x");
        let drops = fixed.drops.clone();
        let completions = fixed.completions.clone();
        let d = dispatcher(vec![shared(Dynamic(fixed))], AllowList::default());

        // sent
        let sent = d.open();
        let get = RequestHead::new(Method::GET, "/", peer("127.0.0.1:1"));
        call(&d, sent, &get, None);
        // still waiting for a body
        let waiting = d.open();
        let post = RequestHead::new(Method::POST, "/", peer("127.0.0.1:2"));
        call(&d, waiting, &post, None);
        // aborted on the wait ceiling
        let aborted = d.open();
        let head = RequestHead::new(Method::POST, "/", peer("127.0.0.1:3"));
        let mut flow = Flow::Continue;
        while flow == Flow::Continue {
            flow = call(&d, aborted, &head, None).0;
        }
        assert_eq!(d.live_states(), 3);

        assert!(d.complete(sent, TerminationReason::CompletedOk));
        assert!(d.complete(waiting, TerminationReason::ClientAbort));
        assert!(d.complete(aborted, TerminationReason::WithError));
        assert!(!d.complete(sent, TerminationReason::CompletedOk));

        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert_eq!(completions.lock().unwrap().len(), 3);
        assert_eq!(d.live_states(), 0);
    }

    #[test]
    fn test_completion_guard_fires_once() {
        let fixed = Fixed::new("/", "x");
        let completions = fixed.completions.clone();
        let d = Arc::new(dispatcher(vec![shared(Dynamic(fixed))], AllowList::default()));
        let id = d.open();
        let head = RequestHead::new(Method::GET, "/", peer("127.0.0.1:1"));
        call(&d, id, &head, None);

        let mut guard = Completion::new(d.clone(), id);
        guard.set(TerminationReason::TimeoutReached);
        drop(guard);
        drop(Completion::new(d.clone(), id));

        assert_eq!(*completions.lock().unwrap(), vec![TerminationReason::TimeoutReached]);
    }

    #[test]
    fn test_unpaced_dispatch_skips_the_sleep_but_keeps_the_ceiling() {
        let wait = BodyWait {
            ceiling: 2,
            interval: Some(std::time::Duration::from_secs(5)),
        };
        let d = Dispatcher::new(
            vec![shared(Dynamic(Fixed::new("/", "x")))],
            AllowList::default(),
            wait,
        );
        let head = RequestHead::new(Method::POST, "/", peer("127.0.0.1:1"));
        let id = d.open();
        let started = std::time::Instant::now();

        let mut flows = Vec::new();
        for _ in 0..3 {
            let mut ctx = RequestContext::new(id, &head, None);
            flows.push(d.dispatch_unpaced(&mut ctx));
            assert_eq!(ctx.body_wait().interval, None);
        }

        assert_eq!(flows, vec![Flow::Continue, Flow::Continue, Flow::Abort]);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_existing_state_keeps_its_controller() {
        let a = Fixed::new("/", "a");
        let d = dispatcher(vec![shared(Dynamic(a))], AllowList::default());
        let id = d.open();
        let post = RequestHead::new(Method::POST, "/", peer("127.0.0.1:1"));
        call(&d, id, &post, None);

        // same exchange, a path no controller would match on its own
        let other = RequestHead::new(Method::POST, "zzz", peer("127.0.0.1:1"));
        let (_, reply) = call(&d, id, &other, Some(b"1"));
        assert_eq!(reply.unwrap().body, "a");
    }
}
