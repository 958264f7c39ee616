use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Type-keyed map of service handles (`Arc<dyn RepositoryService>`, ...).
///
/// Registering a second handle for the same service type replaces the first.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Entry>,
}

struct Entry {
    name: &'static str,
    handle: Box<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.services.values().map(|e| e.name).collect();
        names.sort_unstable();
        f.debug_struct("ServiceRegistry").field("services", &names).finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S>(&mut self, service: Arc<S>)
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.services.insert(
            TypeId::of::<S>(),
            Entry {
                name: std::any::type_name::<S>(),
                handle: Box::new(service),
            },
        );
    }

    pub fn get<S>(&self) -> Option<Arc<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.services
            .get(&TypeId::of::<S>())
            .and_then(|e| e.handle.downcast_ref::<Arc<S>>())
            .cloned()
    }

    pub fn contains<S>(&self) -> bool
    where
        S: ?Sized + 'static,
    {
        self.services.contains_key(&TypeId::of::<S>())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
