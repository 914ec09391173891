//! Widget introspection.
//!
//! The widget tree belongs to the host application. It is exposed to the
//! server through [`Desktop`] (the top-level windows) and [`Component`]
//! (one widget). All of these methods are only ever called on the UI context.
//!
//! ## Architecture
//!
//! - `mod.rs`: collaborator traits, lookup helpers and the info snapshot
//! - `endpoints`: built-in endpoints (exists, visible, info, click, render, sleep)

pub mod endpoints;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::types::{TypeRegistry, Typed};

/// Name reported for components whose concrete type is not registered.
pub const BASE_TYPE_NAME: &str = "Component";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// One widget of the host application.
pub trait Component: Typed + Send + Sync {
    /// Identifier used by remote callers to address the widget.
    fn id(&self) -> String;

    fn name(&self) -> String {
        String::new()
    }

    fn is_visible(&self) -> bool;

    /// Visible and every ancestor visible.
    fn is_showing(&self) -> bool {
        self.is_visible()
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn bounds(&self) -> Bounds;

    /// Free-form properties reported by the info endpoint.
    fn properties(&self) -> Map<String, Value> {
        Map::new()
    }

    fn children(&self) -> Vec<Arc<dyn Component>>;

    /// Synthesized mouse down at the centre of the widget.
    fn press(&self) {}

    /// Synthesized mouse up matching the last [`press`](Component::press).
    fn release(&self) {}

    /// Render to PNG bytes, with or without children. `None` when the widget
    /// cannot be rendered (e.g. zero size).
    fn render_png(&self, with_children: bool) -> Option<Vec<u8>> {
        let _ = with_children;
        None
    }
}

/// The set of top-level windows.
pub trait Desktop: Send + Sync {
    fn windows(&self) -> Vec<Arc<dyn Component>>;
}

/// Depth-first search for a component by id across all windows.
pub fn find_component_by_id(desktop: &dyn Desktop, id: &str) -> Option<Arc<dyn Component>> {
    desktop
        .windows()
        .into_iter()
        .find_map(|window| find_in(window, id))
}

fn find_in(component: Arc<dyn Component>, id: &str) -> Option<Arc<dyn Component>> {
    if component.id() == id {
        return Some(component);
    }
    component
        .children()
        .into_iter()
        .find_map(|child| find_in(child, id))
}

/// All components whose reported type name equals `type_name`.
pub fn find_components_by_type(
    desktop: &dyn Desktop,
    types: &TypeRegistry,
    type_name: &str,
) -> Vec<Arc<dyn Component>> {
    let mut found = Vec::new();
    let mut pending = desktop.windows();
    while let Some(component) = pending.pop() {
        if reported_type_name(types, component.as_ref()) == type_name {
            found.push(component.clone());
        }
        pending.extend(component.children());
    }
    found
}

/// The type name a remote caller sees for `component`.
pub fn reported_type_name(types: &TypeRegistry, component: &dyn Component) -> &'static str {
    types.resolve(component).type_name_or(BASE_TYPE_NAME)
}

/// Snapshot of a component for the info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub visible: bool,
    pub showing: bool,
    pub enabled: bool,
    pub bounds: Bounds,
    pub properties: Map<String, Value>,
    pub num_children: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ComponentInfo>>,
}

impl ComponentInfo {
    pub fn capture(component: &dyn Component, types: &TypeRegistry, recursive: bool) -> Self {
        let children = component.children();
        Self {
            id: component.id(),
            name: component.name(),
            type_name: reported_type_name(types, component).to_string(),
            visible: component.is_visible(),
            showing: component.is_showing(),
            enabled: component.is_enabled(),
            bounds: component.bounds(),
            properties: component.properties(),
            num_children: children.len(),
            children: recursive.then(|| {
                children
                    .iter()
                    .map(|child| Self::capture(child.as_ref(), types, true))
                    .collect()
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Small in-memory widget tree used by unit tests.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub struct Panel {
        pub id: String,
        pub visible: AtomicBool,
        pub children: Mutex<Vec<Arc<dyn Component>>>,
    }

    impl Panel {
        pub fn new(id: &str, children: Vec<Arc<dyn Component>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                visible: AtomicBool::new(true),
                children: Mutex::new(children),
            })
        }
    }

    impl Component for Panel {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn is_visible(&self) -> bool {
            self.visible.load(Ordering::SeqCst)
        }

        fn bounds(&self) -> Bounds {
            Bounds {
                x: 0,
                y: 0,
                width: 200,
                height: 100,
            }
        }

        fn children(&self) -> Vec<Arc<dyn Component>> {
            self.children.lock().unwrap().clone()
        }
    }

    pub struct Button {
        pub id: String,
        pub presses: AtomicUsize,
        pub releases: AtomicUsize,
    }

    impl Button {
        pub fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                presses: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            })
        }
    }

    impl Component for Button {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn name(&self) -> String {
            format!("button {}", self.id)
        }

        fn is_visible(&self) -> bool {
            true
        }

        fn bounds(&self) -> Bounds {
            Bounds {
                x: 10,
                y: 10,
                width: 80,
                height: 20,
            }
        }

        fn children(&self) -> Vec<Arc<dyn Component>> {
            Vec::new()
        }

        fn press(&self) {
            self.presses.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn render_png(&self, _with_children: bool) -> Option<Vec<u8>> {
            Some(vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'])
        }
    }

    pub struct Windows(pub Vec<Arc<dyn Component>>);

    impl Desktop for Windows {
        fn windows(&self) -> Vec<Arc<dyn Component>> {
            self.0.clone()
        }
    }

    /// `main` panel holding `ok` and `cancel` buttons.
    pub fn desktop() -> (Arc<Windows>, Arc<Panel>, Arc<Button>) {
        let ok = Button::new("ok");
        let cancel = Button::new("cancel");
        let children: Vec<Arc<dyn Component>> = vec![ok.clone() as Arc<dyn Component>, cancel];
        let main = Panel::new("main", children);
        let desktop = Arc::new(Windows(vec![main.clone() as Arc<dyn Component>]));
        (desktop, main, ok)
    }
}
