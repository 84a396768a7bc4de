//! Tracking registry
//!
//! An append-ordered table of [`AllocationRecord`]s, searched linearly by
//! address. The registry owns the reference counts and is the only place
//! that decides when a block is released.

use crate::error::RegistryError;
use crate::record::AllocationRecord;
use crate::sweep;
use std::mem;
use std::ptr;

/// Table of tracked allocations for one element type
pub struct TrackingRegistry<T> {
    records: Vec<AllocationRecord<T>>,
}

impl<T> TrackingRegistry<T> {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Number of tracked records
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is tracked
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of the record tracking `address`, if any
    pub fn find(&self, address: *const T) -> Option<usize> {
        self.records
            .iter()
            .position(|record| ptr::eq(record.address(), address))
    }

    /// Record at `position`
    pub fn get(&self, position: usize) -> Option<&AllocationRecord<T>> {
        self.records.get(position)
    }

    /// Iterate records in insertion order
    pub fn records(&self) -> std::slice::Iter<'_, AllocationRecord<T>> {
        self.records.iter()
    }

    /// Reference count of `address`, or `None` when untracked
    pub fn refcount_of(&self, address: *const T) -> Option<usize> {
        self.find(address).map(|pos| self.records[pos].refcount())
    }

    /// Start tracking `address` with a reference count of one.
    ///
    /// Returns the position of the new record.
    ///
    /// # Safety
    /// `address` must be null or come from `Box::into_raw` of a `Box<T>` (when
    /// `is_array` is false) or of a boxed slice/array of `array_length`
    /// elements. The registry takes ownership: the block is freed by a later
    /// sweep and must not be freed by anyone else.
    pub unsafe fn insert(
        &mut self,
        address: *mut T,
        is_array: bool,
        array_length: usize,
    ) -> Result<usize, RegistryError> {
        if self.find(address).is_some() {
            return Err(RegistryError::AlreadyTracked {
                address: address as usize,
            });
        }
        self.records
            .push(AllocationRecord::new(address, is_array, array_length));
        Ok(self.records.len() - 1)
    }

    /// Add a reference to the record at `position`, returning the new count
    pub fn increment(&mut self, position: usize) -> Option<usize> {
        self.records.get_mut(position).map(AllocationRecord::increment)
    }

    /// Drop a reference from the record at `position`, returning the new
    /// count. Saturates at zero.
    pub fn decrement(&mut self, position: usize) -> Option<usize> {
        self.records.get_mut(position).map(AllocationRecord::decrement)
    }

    /// Find-or-insert-or-increment, returning the count after the call.
    ///
    /// Null addresses are never tracked and yield 0.
    ///
    /// # Safety
    /// Same contract as [`insert`](Self::insert) when `address` is not yet
    /// tracked.
    pub unsafe fn track(&mut self, address: *mut T, is_array: bool, array_length: usize) -> usize {
        if address.is_null() {
            return 0;
        }
        match self.find(address) {
            Some(pos) => self.records[pos].increment(),
            None => {
                self.records
                    .push(AllocationRecord::new(address, is_array, array_length));
                1
            }
        }
    }

    /// Add a reference to `address` if tracked; untracked addresses are ignored
    pub fn retain(&mut self, address: *const T) -> Option<usize> {
        let pos = self.find(address)?;
        self.increment(pos)
    }

    /// Drop a reference from `address` if tracked; untracked addresses are ignored
    pub fn drop_ref(&mut self, address: *const T) -> Option<usize> {
        let pos = self.find(address)?;
        self.decrement(pos)
    }

    /// Set every reference count to zero
    pub fn zero_all(&mut self) {
        for record in &mut self.records {
            record.clear_refcount();
        }
    }

    /// Number of records with a nonzero count
    pub fn live_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| !record.is_unreferenced())
            .count()
    }

    /// Detach every zero-count record, keeping the order of the survivors.
    ///
    /// The payloads are still allocated; the caller releases them.
    pub fn take_unreferenced(&mut self) -> Vec<AllocationRecord<T>> {
        if !self.records.iter().any(AllocationRecord::is_unreferenced) {
            return Vec::new();
        }

        let (dead, live): (Vec<_>, Vec<_>) = mem::take(&mut self.records)
            .into_iter()
            .partition(AllocationRecord::is_unreferenced);
        self.records = live;
        dead
    }

    /// Remove and free every zero-count record, returning how many payloads
    /// were released.
    pub fn sweep(&mut self) -> usize {
        // SAFETY: records were inserted under `insert`/`track`'s contract and
        // `take_unreferenced` detaches them
        unsafe { sweep::release_rounds(|| self.take_unreferenced()) }
    }

    /// Zero every count, then sweep. Safe on an empty registry.
    pub fn shutdown(&mut self) -> usize {
        if self.records.is_empty() {
            return 0;
        }
        self.zero_all();
        self.sweep()
    }
}

impl<T> Default for TrackingRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TrackingRegistry<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T> std::fmt::Debug for TrackingRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.records.iter()).finish()
    }
}
