//! In-process GUI automation server.
//!
//! Embed an [`AutomationServer`] in a desktop application to let an external
//! test driver inspect, click and render widgets, and run scripts, over a
//! small HTTP-shaped protocol on a local TCP port.

pub mod client;
pub mod component;
pub mod config;
pub mod error;
pub mod logging;
pub mod script;
pub mod server;
pub mod types;
pub mod ui;

pub use client::{ClientError, ProbeClient, ProbeResponse};
pub use component::{Bounds, Component, ComponentInfo, Desktop};
pub use config::ServerConfig;
pub use error::{PoolError, ServerError, UiError};
pub use script::{ScriptEngine, ScriptError, ScriptScope};
pub use server::{AutomationServer, Request, Response, Services};
pub use types::{TypeRegistry, Typed};
pub use ui::{MessageLoop, UiContext};
