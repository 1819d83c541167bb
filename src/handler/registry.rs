//! Component registry.
//!
//! A minimal type-keyed container: the bus resolves handler instances from it
//! by handler type, and applications may pre-register handlers that need
//! constructor arguments.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::locks::{read_ignore_poison, write_ignore_poison};

type Component = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn() -> Component + Send + Sync>;

/// Instance lifetime of a registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance, built on first resolve and shared afterwards.
    Singleton,
    /// A fresh instance on every resolve.
    PerResolve,
}

struct Registration {
    lifetime: Lifetime,
    factory: Factory,
    instance: OnceLock<Component>,
}

impl Registration {
    fn instance(&self) -> Component {
        // ---
        match self.lifetime {
            Lifetime::Singleton => self.instance.get_or_init(|| (self.factory)()).clone(),
            Lifetime::PerResolve => (self.factory)(),
        }
    }
}

/// Type-keyed component registry.
///
/// Safe for concurrent use. Resolution of singletons defers thread safety of
/// the instance itself to the component (`T: Send + Sync`).
///
/// # Example
///
/// ```
/// use mom_pubsub::{ComponentRegistry, Lifetime};
///
/// struct Clock { offset: i64 }
///
/// let registry = ComponentRegistry::new();
/// registry.register(Lifetime::Singleton, || Clock { offset: 5 });
///
/// let clock = registry.resolve::<Clock>().unwrap();
/// assert_eq!(clock.offset, 5);
/// ```
#[derive(Default)]
pub struct ComponentRegistry {
    entries: RwLock<HashMap<TypeId, Arc<Registration>>>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` built by `factory`, replacing any previous registration.
    pub fn register<T, F>(&self, lifetime: Lifetime, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        // ---
        let registration = Self::registration(lifetime, factory);
        write_ignore_poison(&self.entries).insert(TypeId::of::<T>(), registration);
    }

    /// Register `T` unless a registration already exists.
    ///
    /// Returns `true` when the registration was added.
    pub fn register_if_absent<T, F>(&self, lifetime: Lifetime, factory: F) -> bool
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        // ---
        let mut entries = write_ignore_poison(&self.entries);
        if entries.contains_key(&TypeId::of::<T>()) {
            return false;
        }
        entries.insert(TypeId::of::<T>(), Self::registration(lifetime, factory));
        true
    }

    /// Register an already built singleton.
    pub fn register_instance<T>(&self, instance: T)
    where
        T: Send + Sync + 'static,
    {
        // ---
        let component: Component = Arc::new(instance);
        let registration = Registration {
            lifetime: Lifetime::Singleton,
            factory: {
                let component = component.clone();
                Arc::new(move || component.clone())
            },
            instance: OnceLock::from(component),
        };
        write_ignore_poison(&self.entries).insert(TypeId::of::<T>(), Arc::new(registration));
    }

    /// Whether `T` has been registered.
    pub fn is_registered<T: 'static>(&self) -> bool {
        read_ignore_poison(&self.entries).contains_key(&TypeId::of::<T>())
    }

    /// Lifetime `T` was registered with.
    pub fn lifetime_of<T: 'static>(&self) -> Option<Lifetime> {
        read_ignore_poison(&self.entries)
            .get(&TypeId::of::<T>())
            .map(|registration| registration.lifetime)
    }

    /// Resolve an instance of `T`, or `None` when `T` is not registered.
    pub fn resolve<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        // ---
        let registration = read_ignore_poison(&self.entries)
            .get(&TypeId::of::<T>())
            .cloned()?;

        // Factory runs outside the map lock
        registration.instance().downcast::<T>().ok()
    }

    fn registration<T, F>(lifetime: Lifetime, factory: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Arc::new(Registration {
            lifetime,
            factory: Arc::new(move || Arc::new(factory()) as Component),
            instance: OnceLock::new(),
        })
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("registrations", &read_ignore_poison(&self.entries).len())
            .finish()
    }
}
