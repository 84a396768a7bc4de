//! Bounded iteration over handle targets
//!
//! A [`BoundedIter`] is a cursor over one contiguous block: a position plus
//! the start and end of the region it may visit. It borrows the handle it came
//! from, so the block stays allocated for as long as the cursor exists, and it
//! never touches reference counts.

use std::cmp::Ordering;
use std::fmt;
use std::iter::FusedIterator;
use std::marker::PhantomData;

/// Forward cursor over a handle's block
pub struct BoundedIter<'a, T> {
    /// First element of the region
    start: *const T,
    /// Offset of the current position from `start`
    offset: usize,
    /// Number of elements in the region
    extent: usize,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> BoundedIter<'a, T> {
    /// Cursor at `offset` within `extent` elements starting at `start`.
    ///
    /// # Safety
    /// `start..start + extent` must be a live allocation that outlives `'a`.
    pub(crate) unsafe fn new(start: *const T, offset: usize, extent: usize) -> Self {
        Self {
            start,
            offset,
            extent,
            _marker: PhantomData,
        }
    }

    /// Address of the current position
    #[inline]
    pub fn position(&self) -> *const T {
        self.start.wrapping_add(self.offset)
    }

    /// Address of the first element of the region
    #[inline]
    pub fn region_start(&self) -> *const T {
        self.start
    }

    /// Address one past the last element of the region
    #[inline]
    pub fn region_end(&self) -> *const T {
        self.start.wrapping_add(self.extent)
    }

    /// Elements left between the position and the end of the region
    #[inline]
    pub fn remaining(&self) -> usize {
        self.extent.saturating_sub(self.offset)
    }

    /// Whether the position is inside the region and can be read
    #[inline]
    pub fn in_bounds(&self) -> bool {
        self.offset < self.extent
    }

    /// Move the position forward by one element.
    ///
    /// Advancing past the end is allowed; the cursor just stops being readable.
    #[inline]
    pub fn advance(&mut self) {
        self.offset = self.offset.saturating_add(1);
    }

    /// Value at the current position, if inside the region
    pub fn try_value(&self) -> Option<&'a T> {
        if !self.in_bounds() {
            return None;
        }
        // SAFETY: offset < extent and the region outlives 'a
        Some(unsafe { &*self.start.add(self.offset) })
    }

    /// Value at the current position.
    ///
    /// # Panics
    /// Panics when the position is outside the region (including at `end()`).
    pub fn value(&self) -> &'a T {
        match self.try_value() {
            Some(value) => value,
            None => panic!(
                "BoundedIter read at offset {} outside region of {} elements",
                self.offset, self.extent
            ),
        }
    }

    // Offsets break ties for zero-sized elements, which all share one address.
    fn key(&self) -> (usize, usize) {
        (self.position() as usize, self.offset)
    }
}

impl<T> Clone for BoundedIter<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BoundedIter<'_, T> {}

impl<T> PartialEq for BoundedIter<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for BoundedIter<'_, T> {}

impl<T> PartialOrd for BoundedIter<'_, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for BoundedIter<'_, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl<'a, T> Iterator for BoundedIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let value = self.try_value()?;
        self.advance();
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for BoundedIter<'_, T> {}

impl<T> FusedIterator for BoundedIter<'_, T> {}

impl<T> fmt::Debug for BoundedIter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedIter")
            .field("position", &self.position())
            .field("region_start", &self.region_start())
            .field("region_end", &self.region_end())
            .finish()
    }
}
