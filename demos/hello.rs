//! A small site served by vigil.
//!
//! Routes are matched with `matchit`; the dynamic controller waits for POST
//! bodies on its own, and a plain controller answers health checks directly.
//! Settings come from `VIGIL_*` environment variables, e.g.
//! `VIGIL_PORT=3000 VIGIL_BIND_LOOPBACK=true cargo run --example hello`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use matchit::Router;
use vigil::{
    ConnectionState, Controller, Dynamic, DynamicController, Flow, Method, Reply,
    RequestContext, ResponseParams, ServerConfig, StatusCode, WebServer,
};

#[derive(Clone, Copy)]
enum Route {
    Welcome,
    Hello,
    Echo,
    Counter,
}

/// Serves every route except the health check.
struct Site {
    router: Router<Route>,
    visits: AtomicUsize,
}

impl Site {
    fn new() -> Result<Self, matchit::InsertError> {
        let mut router = Router::new();
        router.insert("/", Route::Welcome)?;
        router.insert("/hello/:name", Route::Hello)?;
        router.insert("/echo", Route::Echo)?;
        router.insert("/counter", Route::Counter)?;

        Ok(Self {
            router,
            visits: AtomicUsize::new(0),
        })
    }
}

impl DynamicController for Site {
    fn valid_path(&self, path: &str, method: &Method) -> bool {
        match self.router.at(path) {
            Ok(matched) => match matched.value {
                Route::Echo => *method == Method::POST,
                _ => *method == Method::GET,
            },
            Err(_) => false,
        }
    }

    fn create_response(
        &self,
        ctx: &RequestContext<'_>,
        state: &ConnectionState,
        body: &mut Vec<u8>,
    ) -> ResponseParams {
        let matched = match self.router.at(ctx.path()) {
            Ok(matched) => matched,
            Err(_) => return ResponseParams::status(StatusCode::NOT_FOUND),
        };

        match matched.value {
            Route::Welcome => body.extend_from_slice(b"Welcome to vigil!"),
            Route::Hello => {
                let name = matched.params.get("name").unwrap_or("world");
                body.extend_from_slice(format!("Hello, {}!", name).as_bytes());
            }
            Route::Echo => {
                body.extend_from_slice(&state.request_data);
                return ResponseParams::ok().header("content-type", "application/octet-stream");
            }
            Route::Counter => {
                let count = self.visits.fetch_add(1, Ordering::Relaxed) + 1;
                body.extend_from_slice(format!("Counter: {}", count).as_bytes());
            }
        }

        ResponseParams::ok().header("content-type", "text/plain; charset=utf-8")
    }
}

/// Answers `/health` on the first invocation, without any state.
struct Health;

impl Controller for Health {
    fn valid_path(&self, path: &str, method: &Method) -> bool {
        path == "/health" && *method == Method::GET
    }

    fn handle_request(
        &self,
        ctx: &mut RequestContext<'_>,
        _: &mut Option<ConnectionState>,
    ) -> Flow {
        ctx.queue_response(Reply::new(StatusCode::OK, "up"));
        Flow::Continue
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::new()?;
    let mut server = WebServer::from_config(&config)?;

    server
        .add_controller(Arc::new(Health))
        .add_controller(Arc::new(Dynamic(Site::new()?)));

    println!("Server running on port {}", config.port);
    println!("Try these routes:");
    println!("  - GET  /");
    println!("  - GET  /hello/your-name");
    println!("  - GET  /counter");
    println!("  - POST /echo");
    println!("  - GET  /health");

    server.start()?;
    Ok(())
}
