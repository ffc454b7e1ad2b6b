//! String-keyed object factory scoped to one (module, capability) pair.
//!
//! A [`Manifest`] owns every instance it creates and hands out opaque
//! [`Instance`] handles. Only handles issued by an entry can be destroyed
//! through that entry, so a foreign or stale handle never frees anything.

mod class_loader;

pub use class_loader::ClassLoader;

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::abi::{guard_with_default, Capability, CapabilityId, HEARTH_ABI_VERSION};
use crate::error::{Error, Result};

/// Constructs a new instance. `None` means construction failed.
pub type CreateFn<C> = fn() -> Option<Box<<C as Capability>::Object>>;

/// Returns the module-wide singleton for a class.
pub type SingletonFn<C> = fn() -> &'static <C as Capability>::Object;

static NEXT_ARENA: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to an instance owned by a [`Manifest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instance {
    arena: u64,
    slot: u64,
}

type Factory<C> = Box<dyn Fn() -> Option<Box<<C as Capability>::Object>> + Send + Sync>;
type Accessor<C> = Box<dyn Fn() -> Option<&'static <C as Capability>::Object> + Send + Sync>;

enum Constructor<C: Capability> {
    Factory(Factory<C>),
    Singleton(Accessor<C>),
}

pub struct ManifestEntry<C: Capability> {
    name: String,
    constructor: Constructor<C>,
    owned: HashMap<u64, Box<C::Object>>,
}

impl<C: Capability> ManifestEntry<C> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_creatable(&self) -> bool {
        matches!(self.constructor, Constructor::Factory(_))
    }

    /// Number of live instances this entry owns.
    #[must_use]
    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }
}

/// Factory registry for capability `C`.
pub struct Manifest<C: Capability> {
    arena: u64,
    next_slot: u64,
    entries: BTreeMap<String, ManifestEntry<C>>,
    slots: HashMap<u64, String>,
}

impl<C: Capability> Manifest<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: NEXT_ARENA.fetch_add(1, Ordering::Relaxed),
            next_slot: 1,
            entries: BTreeMap::new(),
            slots: HashMap::new(),
        }
    }

    /// Register `name` with exactly one of a factory or a singleton accessor.
    ///
    /// The constructor is wrapped in a panic guard here, in the registering
    /// module, so a panicking factory yields no instance.
    ///
    /// # Errors
    /// [`Error::InvalidRegistration`] if both or neither are given, or the
    /// name is already taken.
    pub fn register(
        &mut self,
        name: &str,
        create: Option<CreateFn<C>>,
        singleton: Option<SingletonFn<C>>,
    ) -> Result<()> {
        let constructor = match (create, singleton) {
            (Some(create), None) => {
                Constructor::Factory(Box::new(move || guard_with_default(C::NAME, None, create)))
            }
            (None, Some(singleton)) => Constructor::Singleton(Box::new(move || {
                guard_with_default(C::NAME, None, || Some(singleton()))
            })),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidRegistration {
                    name: name.to_string(),
                    reason: "a class is either creatable or a singleton, not both",
                })
            }
            (None, None) => {
                return Err(Error::InvalidRegistration {
                    name: name.to_string(),
                    reason: "no constructor or singleton accessor given",
                })
            }
        };

        if self.entries.contains_key(name) {
            return Err(Error::InvalidRegistration {
                name: name.to_string(),
                reason: "already registered",
            });
        }

        debug!("Registered {} class {}", C::NAME, name);
        self.entries.insert(
            name.to_string(),
            ManifestEntry {
                name: name.to_string(),
                constructor,
                owned: HashMap::new(),
            },
        );
        Ok(())
    }

    /// # Errors
    /// See [`register`](Self::register).
    pub fn register_factory(&mut self, name: &str, create: CreateFn<C>) -> Result<()> {
        self.register(name, Some(create), None)
    }

    /// # Errors
    /// See [`register`](Self::register).
    pub fn register_singleton(&mut self, name: &str, singleton: SingletonFn<C>) -> Result<()> {
        self.register(name, None, Some(singleton))
    }

    /// Construct a new instance of `name` and take ownership of it.
    ///
    /// # Errors
    /// [`Error::ClassNotFound`], [`Error::InvalidAccess`] for singletons, or
    /// [`Error::NullInstance`] if the factory produced nothing.
    pub fn create(&mut self, name: &str) -> Result<Instance> {
        let object = match &self.entry(name)?.constructor {
            Constructor::Factory(create) => create(),
            Constructor::Singleton(_) => {
                return Err(Error::invalid_access(name, "singleton classes cannot be created"))
            }
        };
        self.own_and_track(name, object)
    }

    /// The singleton registered under `name`.
    ///
    /// # Errors
    /// [`Error::ClassNotFound`], [`Error::InvalidAccess`] if `name` is a
    /// creatable class, or [`Error::NullInstance`] if the accessor panicked.
    pub fn instance(&self, name: &str) -> Result<&C::Object> {
        match &self.entry(name)?.constructor {
            Constructor::Singleton(singleton) => {
                singleton().ok_or_else(|| Error::NullInstance(name.to_string()))
            }
            Constructor::Factory(_) => Err(Error::invalid_access(name, "class is not a singleton")),
        }
    }

    #[must_use]
    pub fn is_create_allowed(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(ManifestEntry::is_creatable)
    }

    /// Take ownership of a freshly constructed instance on behalf of `name`.
    ///
    /// # Errors
    /// [`Error::NullInstance`] for `None`, [`Error::InvalidAccess`] if `name`
    /// is a singleton, [`Error::ClassNotFound`] if it is not registered.
    pub fn own_and_track(
        &mut self,
        name: &str,
        instance: Option<Box<C::Object>>,
    ) -> Result<Instance> {
        let arena = self.arena;
        let slot = self.next_slot;

        let entry = self.entry_mut(name)?;
        if !entry.is_creatable() {
            return Err(Error::invalid_access(name, "singletons are never owned by the caller"));
        }
        let object = instance.ok_or_else(|| Error::NullInstance(name.to_string()))?;

        entry.owned.insert(slot, object);
        self.slots.insert(slot, name.to_string());
        self.next_slot += 1;
        Ok(Instance { arena, slot })
    }

    /// Destroy `instance`, which must have been issued by the `name` entry.
    ///
    /// # Errors
    /// [`Error::InvalidAccess`] for any handle this entry did not issue; no
    /// deallocation happens in that case.
    pub fn destroy(&mut self, name: &str, instance: Instance) -> Result<()> {
        let arena = self.arena;
        let entry = self.entry_mut(name)?;

        if instance.arena != arena {
            return Err(Error::invalid_access(name, "instance belongs to another manifest"));
        }
        let Some(object) = entry.owned.remove(&instance.slot) else {
            return Err(Error::invalid_access(name, "instance is not owned by this class"));
        };

        drop(object);
        self.slots.remove(&instance.slot);
        Ok(())
    }

    /// # Errors
    /// [`Error::InvalidAccess`] if this manifest does not own `instance`.
    pub fn get(&self, instance: Instance) -> Result<&C::Object> {
        let name = self.owner_of(instance)?;
        self.entries
            .get(name)
            .and_then(|entry| entry.owned.get(&instance.slot))
            .map(|object| &**object)
            .ok_or_else(|| Error::invalid_access(name, "instance is not owned by this class"))
    }

    /// # Errors
    /// [`Error::InvalidAccess`] if this manifest does not own `instance`.
    pub fn get_mut(&mut self, instance: Instance) -> Result<&mut C::Object> {
        let name = self.owner_of(instance)?.to_string();
        self.entries
            .get_mut(&name)
            .and_then(|entry| entry.owned.get_mut(&instance.slot))
            .map(|object| &mut **object)
            .ok_or_else(|| Error::invalid_access(name, "instance is not owned by this class"))
    }

    #[must_use]
    pub fn owns(&self, instance: Instance) -> bool {
        instance.arena == self.arena && self.slots.contains_key(&instance.slot)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered class names, sorted.
    #[must_use]
    pub fn class_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    #[must_use]
    pub fn entry_info(&self, name: &str) -> Option<&ManifestEntry<C>> {
        self.entries.get(name)
    }

    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw pointer handed to a module's builder symbol.
    pub(crate) fn as_builder_arg(&mut self) -> *mut c_void {
        (self as *mut Self).cast()
    }

    fn owner_of(&self, instance: Instance) -> Result<&str> {
        if instance.arena != self.arena {
            return Err(Error::invalid_access(C::NAME, "instance belongs to another manifest"));
        }
        self.slots
            .get(&instance.slot)
            .map(String::as_str)
            .ok_or_else(|| Error::invalid_access(C::NAME, "instance was already destroyed"))
    }

    fn entry(&self, name: &str) -> Result<&ManifestEntry<C>> {
        self.entries.get(name).ok_or_else(|| class_not_found::<C>(name))
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut ManifestEntry<C>> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| class_not_found::<C>(name))
    }
}

impl<C: Capability> Default for Manifest<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Capability> Drop for Manifest<C> {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            debug!(
                "Destroying {} remaining {} instances",
                self.slots.len(),
                C::NAME
            );
        }
        self.entries.clear();
    }
}

pub(crate) fn class_not_found<C: Capability>(name: &str) -> Error {
    Error::ClassNotFound {
        capability: C::NAME,
        name: name.to_string(),
    }
}

/// Module-side half of the builder contract: checks the host's ABI version
/// and the capability token before treating `raw` as a manifest for `C`.
///
/// ```rust,ignore
/// #[no_mangle]
/// pub unsafe extern "C" fn hearth_manifest_benchmark(
///     abi: u64,
///     id: CapabilityId,
///     raw: *mut c_void,
/// ) -> bool {
///     guard_with_default("hearth_manifest_benchmark", false, || {
///         let Some(manifest) = manifest_from_raw::<BenchmarkCapability>(abi, id, raw) else {
///             return false;
///         };
///         manifest.register_factory("copy", CopyBench::create).is_ok()
///     })
/// }
/// ```
///
/// # Safety
/// `raw` must be null or the pointer the host passed alongside `abi` and `id`.
pub unsafe fn manifest_from_raw<'a, C: Capability>(
    abi: u64,
    id: CapabilityId,
    raw: *mut c_void,
) -> Option<&'a mut Manifest<C>> {
    if abi != HEARTH_ABI_VERSION {
        debug!("Host manifest ABI {:#x} differs from {:#x}", abi, HEARTH_ABI_VERSION);
        return None;
    }
    if id != C::ID || raw.is_null() {
        return None;
    }
    Some(&mut *raw.cast::<Manifest<C>>())
}
