//! Endpoint table.
//!
//! Maps request paths to handlers. The same lock also guards the list of
//! modules handed to remote scripts; both are only touched in short critical
//! sections (insert, lookup-and-clone).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::request::Request;
use super::response::Response;

/// Handler for structured-data requests. Runs on a worker thread.
pub trait Endpoint: Send + Sync {
    fn handle(&self, request: &Request) -> Response;
}

impl<F> Endpoint for F
where
    F: Fn(&Request) -> Response + Send + Sync,
{
    fn handle(&self, request: &Request) -> Response {
        self(request)
    }
}

#[derive(Default)]
struct Table {
    endpoints: HashMap<String, Arc<dyn Endpoint>>,
    modules: Vec<String>,
}

#[derive(Default)]
pub struct EndpointRegistry {
    table: Mutex<Table>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` under `path`, replacing any earlier registration.
    pub fn register(&self, path: impl Into<String>, endpoint: impl Endpoint + 'static) {
        self.register_arc(path, Arc::new(endpoint));
    }

    pub fn register_arc(&self, path: impl Into<String>, endpoint: Arc<dyn Endpoint>) {
        self.lock().endpoints.insert(path.into(), endpoint);
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<dyn Endpoint>> {
        self.lock().endpoints.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().endpoints.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().endpoints.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Add module names exposed to remote scripts. Duplicates are ignored.
    pub fn add_modules<I, S>(&self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = self.lock();
        for module in modules {
            let module = module.into();
            if !table.modules.contains(&module) {
                table.modules.push(module);
            }
        }
    }

    pub fn modules(&self) -> Vec<String> {
        self.lock().modules.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
