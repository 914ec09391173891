//! Runtime type registry.
//!
//! Components reach the server as `&dyn Component`, which only tells a remote
//! caller about the base trait. The registry is an open set of
//! `type name -> downcast` entries that application setup code fills in for
//! the concrete widget types it wants reported. Resolving an object looks up
//! the name of its concrete type and, when an entry exists, re-validates the
//! relationship through `Any` before handing back the retyped reference.
//!
//! ```ignore
//! let types = TypeRegistry::new();
//! types.register_type::<Slider>();
//!
//! let resolved = types.resolve(component.as_ref());
//! if let Some(descriptor) = resolved.descriptor {
//!     println!("concrete type: {}", descriptor.name);
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Anything whose concrete type can be named at runtime.
///
/// Implemented for every `'static` type. Trait objects whose trait has
/// `Typed` as a supertrait dispatch to the concrete type's implementation, so
/// `runtime_type_name` on a `&dyn Component` names the widget, not the trait.
pub trait Typed: Any {
    fn runtime_type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> Typed for T {
    fn runtime_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Static description of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: &'static str,
    pub id: TypeId,
}

impl TypeDescriptor {
    pub fn of<T: Any>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            id: TypeId::of::<T>(),
        }
    }
}

/// Checks that `object` really is the registered type and returns it with
/// that type's descriptor, or `None` for a mismatched candidate.
pub type DowncastFn = for<'a> fn(&'a dyn Any) -> Option<(&'a dyn Any, TypeDescriptor)>;

/// Downcast function for `T`, suitable for [`TypeRegistry::register`].
pub fn downcast_to<T: Any>(object: &dyn Any) -> Option<(&dyn Any, TypeDescriptor)> {
    object
        .downcast_ref::<T>()
        .map(|concrete| (concrete as &dyn Any, TypeDescriptor::of::<T>()))
}

/// Outcome of [`TypeRegistry::resolve`].
#[derive(Clone, Copy)]
pub struct Resolved<'a> {
    pub object: &'a dyn Any,
    /// `None` when the concrete type is not registered (or failed validation).
    pub descriptor: Option<TypeDescriptor>,
}

impl<'a> Resolved<'a> {
    pub fn downcast<T: Any>(&self) -> Option<&'a T> {
        match self.descriptor {
            Some(descriptor) if descriptor.id == TypeId::of::<T>() => {
                let object: &'a dyn Any = self.object;
                object.downcast_ref::<T>()
            }
            _ => None,
        }
    }

    /// Name to report for the object, falling back to `base` when no override applies.
    pub fn type_name_or(&self, base: &'static str) -> &'static str {
        self.descriptor.map_or(base, |descriptor| descriptor.name)
    }
}

#[derive(Default)]
pub struct TypeRegistry {
    entries: Mutex<HashMap<String, DowncastFn>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the downcast for a runtime type name.
    pub fn register(&self, type_name: impl Into<String>, downcast: DowncastFn) {
        self.lock().insert(type_name.into(), downcast);
    }

    /// Register `T` under its own runtime type name.
    pub fn register_type<T: Any>(&self) {
        self.register(std::any::type_name::<T>(), downcast_to::<T>);
    }

    /// Resolve `object` to its most-derived registered type.
    ///
    /// Pass the trait object itself (`arc.as_ref()`), not a smart pointer to
    /// it, otherwise the pointer type is what gets named.
    pub fn resolve<'a, O: Typed + ?Sized>(&self, object: &'a O) -> Resolved<'a> {
        let any = object.as_any();
        let downcast = self.lock().get(object.runtime_type_name()).copied();

        match downcast.and_then(|downcast| downcast(any)) {
            Some((object, descriptor)) => Resolved {
                object,
                descriptor: Some(descriptor),
            },
            None => Resolved {
                object: any,
                descriptor: None,
            },
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.lock().contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DowncastFn>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Widget: Typed {
        fn label(&self) -> &str;
    }

    struct Slider {
        value: f64,
    }

    struct Knob;

    impl Widget for Slider {
        fn label(&self) -> &str {
            "slider"
        }
    }

    impl Widget for Knob {
        fn label(&self) -> &str {
            "knob"
        }
    }

    #[test]
    fn registered_type_resolves_to_concrete() {
        let types = TypeRegistry::new();
        types.register_type::<Slider>();

        let widget: Box<dyn Widget> = Box::new(Slider { value: 0.5 });
        let resolved = types.resolve(widget.as_ref());

        let descriptor = resolved.descriptor.expect("slider is registered");
        assert_eq!(descriptor, TypeDescriptor::of::<Slider>());
        let slider = resolved.downcast::<Slider>().expect("retyped as slider");
        assert_eq!(slider.value, 0.5);
        assert_eq!(widget.label(), "slider");
    }

    #[test]
    fn unregistered_type_is_returned_unchanged() {
        let types = TypeRegistry::new();
        types.register_type::<Slider>();

        let widget: Box<dyn Widget> = Box::new(Knob);
        let resolved = types.resolve(widget.as_ref());

        assert!(resolved.descriptor.is_none());
        assert!(resolved.downcast::<Knob>().is_none());
        assert!(resolved.object.downcast_ref::<Knob>().is_some());
        assert_eq!(resolved.type_name_or("Widget"), "Widget");
    }

    #[test]
    fn mismatched_downcast_yields_no_override() {
        let types = TypeRegistry::new();
        types.register(std::any::type_name::<Knob>(), downcast_to::<Slider>);

        let widget: Box<dyn Widget> = Box::new(Knob);
        let resolved = types.resolve(widget.as_ref());

        assert!(resolved.descriptor.is_none());
        assert!(resolved.object.downcast_ref::<Knob>().is_some());
    }

    #[test]
    fn last_registration_wins_and_clear_empties() {
        let types = TypeRegistry::new();
        let name = std::any::type_name::<Slider>();
        types.register(name, downcast_to::<Knob>);
        types.register(name, downcast_to::<Slider>);
        assert_eq!(types.len(), 1);

        let widget: Box<dyn Widget> = Box::new(Slider { value: 1.0 });
        assert!(types.resolve(widget.as_ref()).downcast::<Slider>().is_some());

        types.clear();
        assert!(types.is_empty());
        assert!(!types.contains(name));
        assert!(types.resolve(widget.as_ref()).descriptor.is_none());
    }
}
