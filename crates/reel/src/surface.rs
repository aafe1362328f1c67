//! Weak index-to-surface bindings, scoped to one coordinator.
//!
//! The UI layer owns every surface. The registry only remembers which surface is on screen for
//! which feed index so players can be routed to it; dropping the last strong reference on the
//! UI side is enough to make a binding disappear.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// An opaque rendering target owned by the host.
pub trait RenderSurface: Send + Sync {
    /// Stable identity, used to make repeated binds of the same surface free.
    fn surface_id(&self) -> u64;
}

#[derive(Default)]
pub struct SurfaceRegistry {
    bindings: HashMap<usize, (u64, Weak<dyn RenderSurface>)>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `surface` to `index`. Returns `false` if that exact surface was already bound.
    pub fn bind(&mut self, index: usize, surface: &Arc<dyn RenderSurface>) -> bool {
        let surface_id = surface.surface_id();
        if let Some((bound_id, weak)) = self.bindings.get(&index)
            && *bound_id == surface_id
            && weak.strong_count() > 0
        {
            return false;
        }
        self.bindings
            .insert(index, (surface_id, Arc::downgrade(surface)));
        true
    }

    /// Forget the binding for `index`. Returns whether one existed.
    pub fn unbind(&mut self, index: usize) -> bool {
        self.bindings.remove(&index).is_some()
    }

    /// The live surface bound to `index`, pruning a dead binding.
    pub fn get(&mut self, index: usize) -> Option<Arc<dyn RenderSurface>> {
        let (_, weak) = self.bindings.get(&index)?;
        match weak.upgrade() {
            Some(surface) => Some(surface),
            None => {
                self.bindings.remove(&index);
                None
            }
        }
    }

    pub fn is_bound(&mut self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestSurface(u64);

    impl RenderSurface for TestSurface {
        fn surface_id(&self) -> u64 {
            self.0
        }
    }

    fn surface(id: u64) -> Arc<dyn RenderSurface> {
        Arc::new(TestSurface(id))
    }

    #[test]
    fn test_rebinding_same_surface_is_noop() {
        let mut registry = SurfaceRegistry::new();
        let s = surface(1);
        assert!(registry.bind(0, &s));
        assert!(!registry.bind(0, &s));
        assert!(registry.bind(0, &surface(2)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_does_not_own_surfaces() {
        let mut registry = SurfaceRegistry::new();
        let s = surface(1);
        registry.bind(3, &s);
        assert!(registry.is_bound(3));
        drop(s);
        assert!(registry.get(3).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unbind() {
        let mut registry = SurfaceRegistry::new();
        let s = surface(1);
        registry.bind(0, &s);
        assert!(registry.unbind(0));
        assert!(!registry.unbind(0));
        assert_eq!(Arc::strong_count(&s), 1);
    }
}
