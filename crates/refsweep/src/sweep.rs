//! Collection sweep
//!
//! A sweep runs in two phases. First, with the registry borrowed, every
//! zero-count record is detached. Then, with the borrow released, each
//! detached payload is freed. Payload destructors may drop further handles of
//! the same type, which re-enter the registry; the sweep repeats until a round
//! finds nothing to release.

use crate::record::AllocationRecord;
use crate::thread_registry::TypeRegistry;
use std::time::Instant;

/// Sweep statistics for one registry
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Number of sweeps run
    pub sweeps: u64,
    /// Payloads released across all sweeps
    pub released: u64,
    /// Payloads released by the last sweep
    pub last_released: usize,
    /// Number of forced shutdowns
    pub shutdowns: u64,
}

/// Release every zero-count record of `registry`.
///
/// Returns the number of payloads released.
pub(crate) fn collect<T>(registry: &TypeRegistry<T>) -> usize {
    let start = Instant::now();

    #[cfg(feature = "sweep_logging")]
    tracing::debug!(
        target: "refsweep::sweep",
        element = registry.type_name,
        arity = registry.arity,
        records = registry.table.borrow().len(),
        "sweep starting"
    );

    // SAFETY: records enter the registry only through handle construction,
    // whose contract hands the block over
    let released =
        unsafe { release_rounds(|| registry.table.borrow_mut().take_unreferenced()) };

    let mut stats = registry.stats.get();
    stats.sweeps += 1;
    stats.released += released as u64;
    stats.last_released = released;
    registry.stats.set(stats);

    #[cfg(feature = "sweep_logging")]
    if released > 0 {
        tracing::info!(
            target: "refsweep::sweep",
            element = registry.type_name,
            arity = registry.arity,
            released,
            remaining = registry.table.borrow().len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "sweep complete"
        );
    }
    #[cfg(not(feature = "sweep_logging"))]
    let _ = start;

    released
}

/// Release detached records, calling `take` for more until it returns none.
///
/// `take` must not keep the registry borrowed once it returns: payload
/// destructors may drop further handles of the same type. Returns the number
/// of payloads released.
///
/// # Safety
/// Every record `take` yields must have been inserted under the contract of
/// [`TrackingRegistry::insert`](crate::TrackingRegistry::insert) and already
/// be detached from its registry.
pub(crate) unsafe fn release_rounds<T>(
    mut take: impl FnMut() -> Vec<AllocationRecord<T>>,
) -> usize {
    let mut released = 0;
    loop {
        let dead = take();
        if dead.is_empty() {
            break;
        }

        for record in dead {
            #[cfg(feature = "sweep_logging")]
            tracing::debug!(
                target: "refsweep::sweep",
                address = ?record.address(),
                array = record.is_array(),
                length = record.array_length(),
                "releasing unreferenced block"
            );

            // SAFETY: forwarded to the caller; a detached record is released once
            if unsafe { record.release() } {
                released += 1;
            }
        }
    }
    released
}

/// Zero every count in `registry`, then sweep.
///
/// Returns the number of payloads released.
///
/// # Safety
/// No handle of this registry's type may be dereferenced afterwards; their
/// targets are freed.
pub(crate) unsafe fn shutdown<T>(registry: &TypeRegistry<T>) -> usize {
    {
        let mut table = registry.table.borrow_mut();
        if table.is_empty() {
            return 0;
        }

        #[cfg(feature = "sweep_logging")]
        tracing::debug!(
            target: "refsweep::sweep",
            element = registry.type_name,
            arity = registry.arity,
            records = table.len(),
            live = table.live_count(),
            "forced shutdown"
        );

        table.zero_all();
    }

    let released = collect(registry);

    let mut stats = registry.stats.get();
    stats.shutdowns += 1;
    registry.stats.set(stats);

    released
}
