//! Remote script execution.
//!
//! The crate does not embed a language runtime. A host that wants scripting
//! installs a [`ScriptEngine`]; the bridge runs it on the UI context with the
//! registered module names, the type registry and the widget tree in scope.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{Span, debug, error, warn};

use crate::component::Desktop;
use crate::error::PoolError;
use crate::server::request::Request;
use crate::server::response::Response;
use crate::server::worker_pool::PoolHandle;
use crate::types::TypeRegistry;
use crate::ui::UiContext;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    /// Raised by the script itself; the message is returned to the caller.
    #[error("{0}")]
    Script(String),

    #[error("unhandled exception while processing script")]
    Unhandled,

    #[error("scripting is not available")]
    Unavailable,
}

/// What a script can see.
pub struct ScriptScope<'a> {
    pub modules: &'a [String],
    pub types: &'a TypeRegistry,
    pub desktop: &'a dyn Desktop,
}

/// Embedded script runtime. Only ever called on the UI context.
pub trait ScriptEngine: Send {
    fn run(&mut self, source: &str, scope: &ScriptScope<'_>) -> Result<(), ScriptError>;
}

pub struct ScriptBridge {
    engine: Option<Mutex<Box<dyn ScriptEngine>>>,
    ui: Arc<dyn UiContext>,
    types: Arc<TypeRegistry>,
    desktop: Arc<dyn Desktop>,
}

impl ScriptBridge {
    pub fn new(
        engine: Option<Box<dyn ScriptEngine>>,
        ui: Arc<dyn UiContext>,
        types: Arc<TypeRegistry>,
        desktop: Arc<dyn Desktop>,
    ) -> Self {
        Self {
            engine: engine.map(Mutex::new),
            ui,
            types,
            desktop,
        }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    /// Queue `request` for execution.
    ///
    /// The pool job posts the script onto the UI context; once the engine
    /// returns, the response send is handed back to the pool so the UI thread
    /// never blocks on the socket.
    pub fn submit(
        self: &Arc<Self>,
        request: Request,
        modules: Vec<String>,
        pool: &PoolHandle,
    ) -> Result<(), PoolError> {
        let bridge = self.clone();
        let reply_pool = pool.clone();
        let span = Span::current();

        pool.submit(move || {
            let _entered = span.enter();
            let reply_to = request.connection.clone();
            let job_span = span.clone();

            let posted = bridge.ui.post(Box::new({
                let bridge = bridge.clone();
                move || {
                    let _entered = job_span.enter();
                    let response = bridge.run(&request.body_text(), &modules);
                    send_from_pool(&reply_pool, request, response);
                }
            }));

            if let Err(e) = posted {
                warn!(error = %e, "Unable to post script onto UI context");
                if let Some(connection) = reply_to {
                    let _ = connection.send(&Response::internal_error(e.to_string()));
                }
            }
        })
    }

    /// Run `source` on the calling thread and map the outcome to a response.
    pub(crate) fn run(&self, source: &str, modules: &[String]) -> Response {
        let Some(engine) = &self.engine else {
            return Response::internal_error(ScriptError::Unavailable.to_string());
        };

        let scope = ScriptScope {
            modules,
            types: &self.types,
            desktop: self.desktop.as_ref(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.run(source, &scope)
        }));

        match outcome {
            Ok(Ok(())) => {
                debug!(bytes = source.len(), "Script completed");
                Response::result(true)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Script failed");
                Response::internal_error(e.to_string())
            }
            Err(panic) => {
                error!(panic = ?panic, "Script engine panicked");
                Response::internal_error(ScriptError::Unhandled.to_string())
            }
        }
    }
}

fn send_from_pool(pool: &PoolHandle, request: Request, response: Response) {
    let span = Span::current();
    let submitted = pool.submit(move || {
        let _entered = span.enter();
        if let Err(e) = request.respond(&response) {
            debug!(error = %e, "Failed to send script response");
        }
    });

    if let Err(e) = submitted {
        warn!(error = %e, "Dropping script response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::testing::desktop;
    use crate::component::find_component_by_id;
    use crate::server::codec;
    use crate::server::request::Connection;
    use crate::server::worker_pool::{WorkerPool, WorkerPoolConfig};
    use crate::ui::MessageLoop;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    /// Records what it was asked to run; `fail:` scripts report an error.
    struct Recorder {
        seen: Arc<Mutex<Vec<(String, Vec<String>, bool)>>>,
    }

    impl ScriptEngine for Recorder {
        fn run(&mut self, source: &str, scope: &ScriptScope<'_>) -> Result<(), ScriptError> {
            if source == "panic" {
                panic!("engine crashed");
            }
            let has_ok = find_component_by_id(scope.desktop, "ok").is_some();
            self.seen
                .lock()
                .unwrap()
                .push((source.to_string(), scope.modules.to_vec(), has_ok));
            match source.strip_prefix("fail:") {
                Some(message) => Err(ScriptError::Script(message.to_string())),
                None => Ok(()),
            }
        }
    }

    fn bridge(with_engine: bool) -> (Arc<ScriptBridge>, Arc<Mutex<Vec<(String, Vec<String>, bool)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine: Option<Box<dyn ScriptEngine>> = with_engine.then(|| {
            Box::new(Recorder { seen: seen.clone() }) as Box<dyn ScriptEngine>
        });
        let (desktop, _, _) = desktop();
        let ui = Arc::new(MessageLoop::new(4).unwrap());
        let bridge = ScriptBridge::new(engine, ui, Arc::new(TypeRegistry::new()), desktop);
        (Arc::new(bridge), seen)
    }

    fn error_of(response: &Response) -> String {
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        body["error"].as_str().unwrap_or_default().to_string()
    }

    #[test]
    fn run_reports_success_and_scope() {
        let (bridge, seen) = bridge(true);
        let modules = vec!["app".to_string()];

        let response = bridge.run("print(1)", &modules);
        assert_eq!(response.body, br#"{"result":true}"#);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("print(1)".to_string(), modules, true));
    }

    #[test]
    fn run_maps_failures() {
        let (bridge, _) = bridge(true);

        let response = bridge.run("fail:name 'x' is not defined", &[]);
        assert_eq!(response.status, 500);
        assert_eq!(error_of(&response), "name 'x' is not defined");

        let response = bridge.run("panic", &[]);
        assert_eq!(error_of(&response), "unhandled exception while processing script");

        // The engine is still usable after a panic.
        assert_eq!(bridge.run("ok", &[]).status, 200);
    }

    #[test]
    fn missing_engine_is_reported() {
        let (bridge, _) = bridge(false);
        assert!(!bridge.is_available());
        assert_eq!(error_of(&bridge.run("anything", &[])), "scripting is not available");
    }

    #[test]
    fn submit_answers_on_the_connection() {
        let (bridge, seen) = bridge(true);
        let pool = WorkerPool::new(WorkerPoolConfig::default()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, peer) = listener.accept().unwrap();

        let request = Request {
            body: b"fail:boom".to_vec(),
            connection: Some(Arc::new(Connection::new(server_side, peer))),
            ..Default::default()
        };
        bridge
            .submit(request, vec!["app".to_string()], &pool.handle())
            .unwrap();

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).unwrap();

        let response = codec::parse_response(&raw).unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body, br#"{"error":"boom"}"#);
        assert_eq!(seen.lock().unwrap()[0].1, vec!["app".to_string()]);

        pool.shutdown(Duration::from_secs(5));
    }
}
