//! Reference-counted handles
//!
//! A [`Handle`] points at a heap block whose lifetime is governed by the
//! thread-local registry for its `(T, N)` instantiation. Constructing or
//! cloning a handle adds a reference; dropping one removes it and runs a
//! collection sweep, which frees every block whose count reached zero.
//!
//! `N` is the fixed array arity: `Handle<T>` (`N = 0`) targets a single boxed
//! value, `Handle<T, 5>` a boxed `[T; 5]`.
//!
//! Blocks are identified by address, so zero-sized element types are
//! rejected at compile time:
//!
//! ```compile_fail
//! struct Unit;
//! let _h = refsweep::Handle::new(Unit);
//! ```

use crate::config;
use crate::error::{HandleError, Result};
use crate::iter::BoundedIter;
use crate::record::AllocationRecord;
use crate::sweep::SweepStats;
use crate::thread_registry::{self, TypeRegistry};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, Index};
use std::ptr;

/// Reference-counted pointer with sweep-based reclamation
pub struct Handle<T: 'static, const N: usize = 0> {
    /// Block this handle references (may be null)
    target: *mut T,
    /// Cached from the target's record
    is_array: bool,
    /// Cached from the target's record
    array_length: usize,
    _marker: PhantomData<T>,
}

impl<T: 'static, const N: usize> Handle<T, N> {
    const IS_ARRAY: bool = N > 0;

    fn registry() -> &'static TypeRegistry<T> {
        // Every zero-sized box has the same dangling address, so distinct
        // allocations would collapse into one record
        const { assert!(size_of::<T>() != 0, "Handle element types must not be zero-sized") };
        thread_registry::registry_for::<T, N>()
    }

    /// Registry lookup that also arms the shutdown hook on first construction
    fn registry_for_construction() -> &'static TypeRegistry<T> {
        let registry = Self::registry();
        thread_registry::register_shutdown_hook::<T, N>(registry);
        registry
    }

    /// A handle with no target. It tracks nothing until reassigned.
    pub fn null() -> Self {
        Self::registry_for_construction();
        Self {
            target: ptr::null_mut(),
            is_array: Self::IS_ARRAY,
            array_length: N,
            _marker: PhantomData,
        }
    }

    /// Wrap a raw block, adding a reference to it.
    ///
    /// If the block is already tracked its count is incremented; otherwise a
    /// new record with a count of one is created. Null is accepted and never
    /// tracked.
    ///
    /// # Safety
    /// `raw` must be null, already tracked by a `Handle<T, N>` on this thread,
    /// or come from `Box::into_raw` of a `Box<T>` (`N == 0`) or a
    /// `Box<[T; N]>` (`N > 0`). Ownership passes to the registry: the block
    /// must not be freed or reused by the caller.
    pub unsafe fn from_raw(raw: *mut T) -> Self {
        let registry = Self::registry_for_construction();
        // SAFETY: forwarded to the caller
        unsafe { registry.track(raw) };
        Self {
            target: raw,
            is_array: Self::IS_ARRAY,
            array_length: N,
            _marker: PhantomData,
        }
    }

    /// Retarget this handle to a raw block, returning `raw`.
    ///
    /// The new block gains a reference before the old one loses its own, so
    /// passing the handle's current target keeps its count unchanged. When
    /// the old block's count reaches zero it is swept.
    ///
    /// # Safety
    /// Same contract as [`from_raw`](Self::from_raw).
    pub unsafe fn assign_raw(&mut self, raw: *mut T) -> *mut T {
        let registry = Self::registry();
        // SAFETY: forwarded to the caller
        unsafe { registry.track(raw) };
        let reached_zero = registry.drop_ref(self.target);

        self.target = raw;
        self.is_array = Self::IS_ARRAY;
        self.array_length = N;

        if reached_zero {
            registry.collect();
        }
        raw
    }

    /// Retarget this handle to `other`'s block.
    ///
    /// `other`'s block gains a reference first, so handles that already share
    /// a target keep their count unchanged.
    pub fn assign(&mut self, other: &Self) {
        let registry = Self::registry();
        registry.retain(other.target);
        let reached_zero = registry.drop_ref(self.target);

        self.target = other.target;
        self.is_array = other.is_array;
        self.array_length = other.array_length;

        if reached_zero {
            registry.collect();
        }
    }

    /// Raw address of the target. Does not change any count.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.target
    }

    /// Whether the handle has no target
    #[inline]
    pub fn is_null(&self) -> bool {
        self.target.is_null()
    }

    /// Whether the handle targets an array block
    #[inline]
    pub fn is_array(&self) -> bool {
        self.is_array
    }

    /// Element count of an array target (0 for scalars)
    #[inline]
    pub fn array_length(&self) -> usize {
        if self.is_array { self.array_length } else { 0 }
    }

    /// Number of elements behind the handle: the array length, 1 for a
    /// scalar, 0 when null
    #[inline]
    pub fn extent(&self) -> usize {
        if self.target.is_null() {
            0
        } else if self.is_array {
            self.array_length
        } else {
            1
        }
    }

    /// Whether two handles share a target
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        ptr::eq(self.target, other.target)
    }

    /// Live references to this handle's target (0 when null or untracked)
    pub fn strong_count(&self) -> usize {
        if self.target.is_null() {
            return 0;
        }
        Self::registry().refcount_of(self.target).unwrap_or(0)
    }

    /// First element of the target, or `None` when null
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-null target stays allocated while this handle holds a
        // reference to it
        unsafe { self.target.as_ref() }
    }

    /// Like [`get`](Self::get), with an error for null handles
    pub fn try_get(&self) -> Result<&T> {
        self.get().ok_or(HandleError::Null)
    }

    /// The whole target as a slice (empty when null)
    pub fn as_slice(&self) -> &[T] {
        if self.target.is_null() {
            return &[];
        }
        // SAFETY: the target is a live block of `extent()` elements
        unsafe { std::slice::from_raw_parts(self.target, self.extent()) }
    }

    /// Element `index` of the target, or `None` when null or out of range
    pub fn element_at(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Like [`element_at`](Self::element_at), with a descriptive error
    pub fn try_element_at(&self, index: usize) -> Result<&T> {
        if self.target.is_null() {
            return Err(HandleError::Null);
        }
        self.element_at(index).ok_or(HandleError::OutOfBounds {
            index,
            extent: self.extent(),
        })
    }

    /// Mutable access to the first element, if this handle is the target's
    /// only reference
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.try_get_mut().ok()
    }

    /// Like [`get_mut`](Self::get_mut), with a descriptive error
    pub fn try_get_mut(&mut self) -> Result<&mut T> {
        self.check_unique()?;
        // SAFETY: non-null, live, and no other handle can observe it
        Ok(unsafe { &mut *self.target })
    }

    /// Mutable slice over the target, if this handle is its only reference
    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        self.check_unique().ok()?;
        let extent = self.extent();
        // SAFETY: non-null, live, and no other handle can observe it
        Some(unsafe { std::slice::from_raw_parts_mut(self.target, extent) })
    }

    fn check_unique(&self) -> Result<()> {
        if self.target.is_null() {
            return Err(HandleError::Null);
        }
        match self.strong_count() {
            1 => Ok(()),
            count => Err(HandleError::Shared { count }),
        }
    }

    /// Cursor at the first element of the target
    pub fn begin(&self) -> BoundedIter<'_, T> {
        // SAFETY: the block outlives the borrow of `self`
        unsafe { BoundedIter::new(self.target, 0, self.extent()) }
    }

    /// Cursor one past the last element of the target. Never readable.
    pub fn end(&self) -> BoundedIter<'_, T> {
        let extent = self.extent();
        // SAFETY: the block outlives the borrow of `self`
        unsafe { BoundedIter::new(self.target, extent, extent) }
    }

    /// Iterate the target's elements
    pub fn iter(&self) -> BoundedIter<'_, T> {
        self.begin()
    }

    /// Number of blocks tracked for this `(T, N)` on the current thread
    pub fn registry_size() -> usize {
        Self::registry().len()
    }

    /// Sweep the `(T, N)` registry. Returns whether anything was released.
    pub fn collect() -> bool {
        Self::registry().collect() > 0
    }

    /// Sweep statistics for the `(T, N)` registry
    pub fn stats() -> SweepStats {
        Self::registry().stats.get()
    }

    /// Zero every count in the `(T, N)` registry and release every block.
    ///
    /// Returns the number of blocks released.
    ///
    /// # Safety
    /// Every handle of this type still alive on this thread now points at
    /// freed memory and must not be dereferenced. Intended for handles that
    /// were leaked (e.g. with [`std::mem::forget`]).
    pub unsafe fn shutdown() -> usize {
        // SAFETY: forwarded to the caller
        unsafe { crate::sweep::shutdown(Self::registry()) }
    }

    /// Snapshot of the `(T, N)` registry for debugging
    pub fn dump() -> RegistryDump
    where
        T: fmt::Debug,
    {
        let registry = Self::registry();
        let table = registry.table.borrow();
        let entries = table
            .records()
            .map(|record| DumpEntry {
                address: record.address() as usize,
                refcount: record.refcount(),
                value: dump_value(record),
            })
            .collect();

        RegistryDump {
            type_name: registry.type_name,
            arity: N,
            entries,
        }
    }
}

fn dump_value<T: fmt::Debug>(record: &AllocationRecord<T>) -> Option<String> {
    if record.address().is_null() {
        return None;
    }
    // SAFETY: only called for records still held by a registry
    let values = unsafe { record.as_slice() };
    Some(if record.is_array() {
        format!("{values:?}")
    } else {
        format!("{:?}", values[0])
    })
}

impl<T: 'static> Handle<T> {
    /// Allocate `value` and wrap it
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }

    /// Wrap an existing box
    pub fn from_box(value: Box<T>) -> Self {
        // SAFETY: the pointer comes straight from `Box::into_raw`
        unsafe { Self::from_raw(Box::into_raw(value)) }
    }

    /// Retarget to a new boxed value, returning its address
    pub fn assign_box(&mut self, value: Box<T>) -> *mut T {
        // SAFETY: the pointer comes straight from `Box::into_raw`
        unsafe { self.assign_raw(Box::into_raw(value)) }
    }

    /// Retarget to a freshly allocated `value`, returning its address
    pub fn set(&mut self, value: T) -> *mut T {
        self.assign_box(Box::new(value))
    }
}

impl<T: 'static, const N: usize> Handle<T, N> {
    /// Allocate `values` and wrap them
    pub fn from_array(values: [T; N]) -> Self {
        Self::from_boxed_array(Box::new(values))
    }

    /// Wrap an existing boxed array
    pub fn from_boxed_array(values: Box<[T; N]>) -> Self {
        const { assert!(N > 0, "array handles need a nonzero arity") };
        // SAFETY: a `Box<[T; N]>` has the layout of the `[T]` of N elements
        // the registry releases for array records
        unsafe { Self::from_raw(Box::into_raw(values).cast::<T>()) }
    }

    /// Retarget to a new boxed array, returning its address
    pub fn assign_array(&mut self, values: Box<[T; N]>) -> *mut T {
        const { assert!(N > 0, "array handles need a nonzero arity") };
        // SAFETY: see `from_boxed_array`
        unsafe { self.assign_raw(Box::into_raw(values).cast::<T>()) }
    }
}

impl<T: 'static, const N: usize> Clone for Handle<T, N> {
    fn clone(&self) -> Self {
        Self::registry().retain(self.target);
        Self {
            target: self.target,
            is_array: self.is_array,
            array_length: self.array_length,
            _marker: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.assign(source);
    }
}

impl<T: 'static, const N: usize> Drop for Handle<T, N> {
    fn drop(&mut self) {
        let Some(registry) = thread_registry::try_registry_for::<T, N>() else {
            return;
        };
        let reached_zero = registry.drop_ref(self.target);
        if config::config().policy.should_collect(reached_zero) {
            registry.collect();
        }
    }
}

impl<T: 'static, const N: usize> Default for Handle<T, N> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: 'static, const N: usize> Deref for Handle<T, N> {
    type Target = T;

    /// # Panics
    /// Panics when the handle is null.
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced a null Handle"),
        }
    }
}

impl<T: 'static, const N: usize> Index<usize> for Handle<T, N> {
    type Output = T;

    /// # Panics
    /// Panics when the handle is null or `index` is past the extent.
    fn index(&self, index: usize) -> &T {
        match self.try_element_at(index) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<'a, T: 'static, const N: usize> IntoIterator for &'a Handle<T, N> {
    type Item = &'a T;
    type IntoIter = BoundedIter<'a, T>;

    fn into_iter(self) -> BoundedIter<'a, T> {
        self.begin()
    }
}

impl<T: fmt::Debug + 'static, const N: usize> fmt::Debug for Handle<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Handle");
        s.field("target", &self.target);
        if self.is_array {
            s.field("values", &self.as_slice());
        } else {
            s.field("value", &self.get());
        }
        s.finish()
    }
}

/// One row of a [`RegistryDump`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpEntry {
    /// Block address
    pub address: usize,
    /// Reference count at snapshot time
    pub refcount: usize,
    /// Debug rendering of the block (`None` for a null address)
    pub value: Option<String>,
}

/// Snapshot of one registry's records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryDump {
    /// Element type name
    pub type_name: &'static str,
    /// Fixed array arity (0 for scalars)
    pub arity: usize,
    /// Records in registry order
    pub entries: Vec<DumpEntry>,
}

impl fmt::Display for RegistryDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "registry<{}, {}>:", self.type_name, self.arity)?;
        if self.entries.is_empty() {
            return writeln!(f, "  (empty)");
        }
        writeln!(f, "  address            refcount  value")?;
        for entry in &self.entries {
            writeln!(
                f,
                "  {:#018x} {:>8}  {}",
                entry.address,
                entry.refcount,
                entry.value.as_deref().unwrap_or("---")
            )?;
        }
        Ok(())
    }
}
