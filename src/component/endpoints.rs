//! Built-in endpoints.
//!
//! Each handler validates its arguments synchronously on the worker thread,
//! then does the widget work on the UI context and waits for the outcome.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{ComponentInfo, Desktop, find_component_by_id};
use crate::error::UiError;
use crate::server::endpoints::EndpointRegistry;
use crate::server::request::Request;
use crate::server::response::Response;
use crate::types::TypeRegistry;
use crate::ui::{self, UiContext};

pub const SLEEP: &str = "/uiprobe/sleep";
pub const COMPONENT_EXISTS: &str = "/uiprobe/component/exists";
pub const COMPONENT_VISIBLE: &str = "/uiprobe/component/visible";
pub const COMPONENT_INFO: &str = "/uiprobe/component/info";
pub const COMPONENT_CLICK: &str = "/uiprobe/component/click";
pub const COMPONENT_RENDER: &str = "/uiprobe/component/render";

const DEFAULT_SLEEP_MS: u64 = 100;
const DEFAULT_CLICK_MS: u64 = 100;

/// Handlers for the built-in endpoints, sharing the host's collaborators.
pub struct ComponentEndpoints {
    desktop: Arc<dyn Desktop>,
    ui: Arc<dyn UiContext>,
    types: Arc<TypeRegistry>,
}

impl ComponentEndpoints {
    pub fn new(desktop: Arc<dyn Desktop>, ui: Arc<dyn UiContext>, types: Arc<TypeRegistry>) -> Self {
        Self { desktop, ui, types }
    }

    pub fn register(self: Arc<Self>, registry: &EndpointRegistry) {
        let routes: [(&str, fn(&Self, &Request) -> Response); 6] = [
            (SLEEP, Self::sleep),
            (COMPONENT_EXISTS, Self::exists),
            (COMPONENT_VISIBLE, Self::visible),
            (COMPONENT_INFO, Self::info),
            (COMPONENT_CLICK, Self::click),
            (COMPONENT_RENDER, Self::render),
        ];

        for (path, handler) in routes {
            let endpoints = self.clone();
            registry.register(path, move |request: &Request| handler(&endpoints, request));
        }
    }

    pub fn sleep(&self, request: &Request) -> Response {
        let duration = Duration::from_millis(request.u64_param("time", DEFAULT_SLEEP_MS));

        if request.bool_param("messageThread", false) {
            if let Err(e) = ui::invoke(self.ui.as_ref(), move || std::thread::sleep(duration)) {
                return ui_failure(e);
            }
        } else {
            std::thread::sleep(duration);
        }

        Response::result(true)
    }

    pub fn exists(&self, request: &Request) -> Response {
        let id = match component_id(request) {
            Ok(id) => id,
            Err(response) => return response,
        };

        let desktop = self.desktop.clone();
        match ui::invoke(self.ui.as_ref(), move || {
            find_component_by_id(desktop.as_ref(), &id).is_some()
        }) {
            Ok(found) => Response::result(found),
            Err(e) => ui_failure(e),
        }
    }

    pub fn visible(&self, request: &Request) -> Response {
        let id = match component_id(request) {
            Ok(id) => id,
            Err(response) => return response,
        };

        let desktop = self.desktop.clone();
        match ui::invoke(self.ui.as_ref(), move || {
            find_component_by_id(desktop.as_ref(), &id).is_some_and(|c| c.is_visible())
        }) {
            Ok(visible) => Response::result(visible),
            Err(e) => ui_failure(e),
        }
    }

    /// Unknown ids answer with a `null` result rather than an error.
    pub fn info(&self, request: &Request) -> Response {
        let id = match component_id(request) {
            Ok(id) => id,
            Err(response) => return response,
        };
        let recursive = request.bool_param("recursive", false);

        let desktop = self.desktop.clone();
        let types = self.types.clone();
        match ui::invoke(self.ui.as_ref(), move || {
            find_component_by_id(desktop.as_ref(), &id)
                .map(|component| ComponentInfo::capture(component.as_ref(), &types, recursive))
        }) {
            Ok(info) => Response::result(info),
            Err(e) => ui_failure(e),
        }
    }

    /// Press, let the UI settle for `time` ms, release.
    pub fn click(&self, request: &Request) -> Response {
        let id = match component_id(request) {
            Ok(id) => id,
            Err(response) => return response,
        };
        let settle = Duration::from_millis(request.u64_param("time", DEFAULT_CLICK_MS));

        let desktop = self.desktop.clone();
        let pressed = ui::invoke(self.ui.as_ref(), move || {
            let component = find_component_by_id(desktop.as_ref(), &id);
            if let Some(component) = &component {
                component.press();
            }
            component
        });

        let component = match pressed {
            Ok(Some(component)) => component,
            Ok(None) => return Response::internal_error("component id not found"),
            Err(e) => return ui_failure(e),
        };

        // Sleep here rather than on the UI thread so the host keeps
        // dispatching events between press and release.
        std::thread::sleep(settle);

        match ui::invoke(self.ui.as_ref(), move || component.release()) {
            Ok(()) => Response::result(true),
            Err(e) => ui_failure(e),
        }
    }

    pub fn render(&self, request: &Request) -> Response {
        let id = match component_id(request) {
            Ok(id) => id,
            Err(response) => return response,
        };
        let with_children = request.bool_param("withChildren", false);

        let desktop = self.desktop.clone();
        match ui::invoke(self.ui.as_ref(), move || {
            find_component_by_id(desktop.as_ref(), &id).map(|c| c.render_png(with_children))
        }) {
            Ok(Some(Some(png))) => {
                debug!(bytes = png.len(), "Rendered component");
                Response::png(png)
            }
            Ok(Some(None)) => Response::internal_error("unable to render component"),
            Ok(None) => Response::internal_error("component id not found"),
            Err(e) => ui_failure(e),
        }
    }
}

fn component_id(request: &Request) -> Result<String, Response> {
    let id = request.str_param("id");
    if id.is_empty() {
        return Err(Response::internal_error("invalid component id specified"));
    }
    Ok(id)
}

fn ui_failure(error: UiError) -> Response {
    warn!(error = %error, "UI context failed to run endpoint work");
    Response::internal_error(error.to_string())
}
