//! Allocation records
//!
//! One record describes one tracked block: where it lives, how many handles
//! point at it, and whether it was allocated as an array. Records compare
//! equal when they track the same address, whatever their counts.

use std::fmt;
use std::ptr;

/// A tracked allocation
pub struct AllocationRecord<T> {
    /// Start of the tracked block
    address: *mut T,
    /// Live handles targeting `address`
    refcount: usize,
    /// Whether the block is a boxed slice
    is_array: bool,
    /// Element count for array blocks, 0 for scalars
    array_length: usize,
}

impl<T> AllocationRecord<T> {
    /// Create a record with a reference count of one
    pub fn new(address: *mut T, is_array: bool, array_length: usize) -> Self {
        Self {
            address,
            refcount: 1,
            is_array,
            array_length: if is_array { array_length } else { 0 },
        }
    }

    /// Address of the tracked block
    #[inline]
    pub fn address(&self) -> *mut T {
        self.address
    }

    /// Current reference count
    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    /// Whether the block was allocated as an array
    #[inline]
    pub fn is_array(&self) -> bool {
        self.is_array
    }

    /// Element count (0 for scalars)
    #[inline]
    pub fn array_length(&self) -> usize {
        self.array_length
    }

    /// Number of elements covered by the block
    #[inline]
    pub fn extent(&self) -> usize {
        if self.is_array { self.array_length } else { 1 }
    }

    /// Whether no handle references the block any more
    #[inline]
    pub fn is_unreferenced(&self) -> bool {
        self.refcount == 0
    }

    /// Add one reference, returning the new count
    pub fn increment(&mut self) -> usize {
        self.refcount = self.refcount.saturating_add(1);
        self.refcount
    }

    /// Drop one reference, returning the new count. Saturates at zero.
    pub fn decrement(&mut self) -> usize {
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount
    }

    pub(crate) fn clear_refcount(&mut self) {
        self.refcount = 0;
    }

    /// View the block as a slice.
    ///
    /// # Safety
    /// The block must still be allocated.
    pub(crate) unsafe fn as_slice(&self) -> &[T] {
        if self.address.is_null() {
            return &[];
        }
        // SAFETY: caller guarantees the block is live; extent matches the allocation
        unsafe { std::slice::from_raw_parts(self.address, self.extent()) }
    }

    /// Free the payload this record describes.
    ///
    /// Array records are released as `Box<[T]>` of `array_length` elements,
    /// scalar records as `Box<T>`. Returns `false` for a null address.
    ///
    /// # Safety
    /// `address` must come from `Box::into_raw` of a `Box<T>` (scalar) or of a
    /// boxed array/slice of exactly `array_length` elements (array), and must
    /// not have been released already.
    pub unsafe fn release(self) -> bool {
        if self.address.is_null() {
            return false;
        }

        if self.is_array {
            let slice = ptr::slice_from_raw_parts_mut(self.address, self.array_length);
            // SAFETY: caller guarantees the block is a boxed slice of this length
            drop(unsafe { Box::from_raw(slice) });
        } else {
            // SAFETY: caller guarantees the block is a boxed scalar
            drop(unsafe { Box::from_raw(self.address) });
        }
        true
    }
}

impl<T> PartialEq for AllocationRecord<T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.address, other.address)
    }
}

impl<T> Eq for AllocationRecord<T> {}

impl<T> fmt::Debug for AllocationRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRecord")
            .field("address", &self.address)
            .field("refcount", &self.refcount)
            .field("is_array", &self.is_array)
            .field("array_length", &self.array_length)
            .finish()
    }
}
