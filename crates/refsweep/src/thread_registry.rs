//! Per-type registries and shutdown hooks
//!
//! Every `Handle<T, N>` instantiation gets its own registry, created on first
//! use and leaked to obtain a `&'static` reference, one per instantiation per
//! thread. Handles are `!Send`, so a handle only ever sees the registries of
//! the thread that created it.
//!
//! The first handle construction of each instantiation also registers a
//! shutdown hook. [`finalize`] runs all hooks, forcing a final collection of
//! every registry on the thread. When the thread exits, a thread-local guard
//! sweeps the blocks that are already unreferenced, or runs [`finalize`] if
//! that was enabled in the [`CollectorConfig`](crate::CollectorConfig).
//!
//! Registry slots are leaked, so each thread keeps one small allocation per
//! instantiation it touched after it exits. Handle drops that run during
//! thread-local teardown may still reach a slot through its `&'static`
//! reference.

use crate::config;
use crate::registry::TrackingRegistry;
use crate::sweep::{self, SweepStats};
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;

/// Thread-local registry slot for one `(T, N)` instantiation
pub(crate) struct TypeRegistry<T> {
    pub(crate) table: RefCell<TrackingRegistry<T>>,
    pub(crate) stats: Cell<SweepStats>,
    hooked: Cell<bool>,
    pub(crate) type_name: &'static str,
    pub(crate) arity: usize,
}

impl<T> TypeRegistry<T> {
    pub(crate) fn new(type_name: &'static str, arity: usize) -> Self {
        Self {
            table: RefCell::new(TrackingRegistry::new()),
            stats: Cell::new(SweepStats::default()),
            hooked: Cell::new(false),
            type_name,
            arity,
        }
    }

    /// Track `address`, inserting or incrementing. Null is ignored.
    ///
    /// # Safety
    /// See [`TrackingRegistry::insert`].
    pub(crate) unsafe fn track(&self, address: *mut T) {
        let is_array = self.arity > 0;
        // SAFETY: forwarded to the caller
        unsafe {
            self.table
                .borrow_mut()
                .track(address, is_array, self.arity)
        };
    }

    pub(crate) fn retain(&self, address: *const T) {
        self.table.borrow_mut().retain(address);
    }

    /// Drop a reference; true when the count reached zero.
    pub(crate) fn drop_ref(&self, address: *const T) -> bool {
        self.table.borrow_mut().drop_ref(address) == Some(0)
    }

    pub(crate) fn refcount_of(&self, address: *const T) -> Option<usize> {
        self.table.borrow().refcount_of(address)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub(crate) fn collect(&self) -> usize {
        sweep::collect(self)
    }

    /// First call returns true; later calls false.
    fn mark_hooked(&self) -> bool {
        !self.hooked.replace(true)
    }
}

/// Registry key: one per `(T, N)` pair
struct SlotKey<T, const N: usize>(PhantomData<T>);

/// Outcome of running one type's shutdown hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizedType {
    /// Element type name
    pub type_name: &'static str,
    /// Fixed array arity (0 for scalars)
    pub arity: usize,
    /// Records still referenced by live (leaked) handles before shutdown
    pub leaked: usize,
    /// Payloads released by the shutdown
    pub released: usize,
}

/// Result of [`finalize`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    /// One entry per registered type, in registration order
    pub types: Vec<FinalizedType>,
}

impl FinalizeReport {
    /// Payloads released across all types
    pub fn total_released(&self) -> usize {
        self.types.iter().map(|t| t.released).sum()
    }

    /// Records that were still referenced when finalization ran
    pub fn total_leaked(&self) -> usize {
        self.types.iter().map(|t| t.leaked).sum()
    }
}

#[derive(Clone, Copy)]
struct ShutdownHook {
    type_name: &'static str,
    run: unsafe fn() -> Option<FinalizedType>,
    sweep: fn() -> usize,
}

/// Sweeps or finalizes this thread's registries when the thread exits
struct FinalizeOnExit;

impl Drop for FinalizeOnExit {
    fn drop(&mut self) {
        if config::config().finalize_on_thread_exit() {
            // SAFETY: enabling finalization at exit is `unsafe` and carries
            // the contract of `finalize`
            let _ = unsafe { finalize() };
        } else {
            sweep_unreferenced();
        }
    }
}

thread_local! {
    static REGISTRIES: RefCell<FxHashMap<TypeId, &'static dyn Any>> =
        RefCell::new(FxHashMap::default());

    static SHUTDOWN_HOOKS: RefCell<Vec<ShutdownHook>> = const { RefCell::new(Vec::new()) };

    static EXIT_GUARD: FinalizeOnExit = const { FinalizeOnExit };
}

/// Registry for `(T, N)` on this thread, created on first use
pub(crate) fn registry_for<T: 'static, const N: usize>() -> &'static TypeRegistry<T> {
    REGISTRIES.with(|map| lookup_or_create::<T, N>(map))
}

/// Like [`registry_for`], but returns `None` once thread-local storage is
/// being destroyed
pub(crate) fn try_registry_for<T: 'static, const N: usize>() -> Option<&'static TypeRegistry<T>> {
    REGISTRIES
        .try_with(|map| lookup_or_create::<T, N>(map))
        .ok()
}

fn lookup_or_create<T: 'static, const N: usize>(
    map: &RefCell<FxHashMap<TypeId, &'static dyn Any>>,
) -> &'static TypeRegistry<T> {
    let key = TypeId::of::<SlotKey<T, N>>();
    if let Some(&slot) = map.borrow().get(&key) {
        return slot
            .downcast_ref::<TypeRegistry<T>>()
            .expect("registry slot holds a different type");
    }

    let slot: &'static TypeRegistry<T> = Box::leak(Box::new(TypeRegistry::new(
        std::any::type_name::<T>(),
        N,
    )));
    map.borrow_mut().insert(key, slot);
    slot
}

/// Register the `(T, N)` shutdown hook; only the first call has an effect.
pub(crate) fn register_shutdown_hook<T: 'static, const N: usize>(registry: &TypeRegistry<T>) {
    if !registry.mark_hooked() {
        return;
    }

    SHUTDOWN_HOOKS.with(|hooks| {
        hooks.borrow_mut().push(ShutdownHook {
            type_name: registry.type_name,
            run: run_shutdown_hook::<T, N>,
            sweep: sweep_registry::<T, N>,
        })
    });
    // Touching the guard arms its destructor for this thread
    EXIT_GUARD.with(|_| {});

    #[cfg(feature = "sweep_logging")]
    tracing::debug!(
        target: "refsweep::sweep",
        element = registry.type_name,
        arity = N,
        "shutdown hook registered"
    );
}

fn sweep_registry<T: 'static, const N: usize>() -> usize {
    try_registry_for::<T, N>().map_or(0, TypeRegistry::collect)
}

unsafe fn run_shutdown_hook<T: 'static, const N: usize>() -> Option<FinalizedType> {
    let registry = try_registry_for::<T, N>()?;
    let leaked = registry.table.borrow().live_count();

    #[cfg(feature = "sweep_logging")]
    if leaked > 0 {
        tracing::warn!(
            target: "refsweep::sweep",
            element = registry.type_name,
            arity = N,
            leaked,
            "finalizing registry with live references"
        );
    }

    // SAFETY: forwarded from `finalize`
    let released = unsafe { sweep::shutdown(registry) };
    Some(FinalizedType {
        type_name: registry.type_name,
        arity: N,
        leaked,
        released,
    })
}

/// Force a final collection of every registry on this thread.
///
/// Each registered type has all its counts zeroed and is swept, releasing
/// every tracked block. Types are processed in registration order.
///
/// # Safety
/// No handle created on this thread may be dereferenced afterwards; any
/// handle still alive now points at freed memory.
pub unsafe fn finalize() -> FinalizeReport {
    let hooks = SHUTDOWN_HOOKS
        .try_with(|hooks| hooks.borrow().clone())
        .unwrap_or_default();

    let types = hooks
        .iter()
        // SAFETY: forwarded to the caller
        .filter_map(|hook| unsafe { (hook.run)() })
        .collect();
    FinalizeReport { types }
}

/// Sweep every registered registry on this thread, releasing only blocks
/// that are already unreferenced. Returns the number released.
fn sweep_unreferenced() -> usize {
    let hooks = SHUTDOWN_HOOKS
        .try_with(|hooks| hooks.borrow().clone())
        .unwrap_or_default();
    hooks.iter().map(|hook| (hook.sweep)()).sum()
}

/// Names of the element types whose shutdown hooks are registered on this
/// thread, in registration order
pub fn registered_types() -> Vec<&'static str> {
    SHUTDOWN_HOOKS
        .try_with(|hooks| hooks.borrow().iter().map(|h| h.type_name).collect())
        .unwrap_or_default()
}
