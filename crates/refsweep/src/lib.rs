//! # refsweep
//!
//! Reference-counted handles with a sweep-based collector.
//!
//! ## Design
//!
//! - **Handles**: [`Handle<T, N>`] wraps a boxed value (`N = 0`) or a boxed
//!   `[T; N]`. Clones share the block; the block is freed once no handle
//!   references it.
//! - **Registries**: every `(T, N)` has its own thread-local table of
//!   [`AllocationRecord`]s, created on first use. The table owns the counts.
//! - **Sweeps**: dropping a handle runs a sweep that frees every zero-count
//!   block, with array or scalar release per record.
//! - **Finalization**: [`finalize`] force-collects every registry on the
//!   thread. Thread exit only sweeps unreferenced blocks unless finalization
//!   at exit is enabled in [`CollectorConfig`].
//!
//! Element types must not be zero-sized.
//!
//! There is no cycle detection: handles that reference each other in a cycle
//! are only reclaimed by [`finalize`] or [`Handle::shutdown`].
//!
//! ```
//! use refsweep::Handle;
//!
//! let mut h = Handle::new(19);
//! h.set(21);
//! let copy = h.clone();
//! assert_eq!(copy.strong_count(), 2);
//! drop(h);
//! drop(copy);
//! assert_eq!(Handle::<i32>::registry_size(), 0);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handle;
pub mod iter;
pub mod record;
pub mod registry;
pub mod sweep;
mod thread_registry;

pub use config::{CollectorConfig, SweepPolicy, config, set_config, with_config};
pub use error::{HandleError, RegistryError, Result};
pub use handle::{DumpEntry, Handle, RegistryDump};
pub use iter::BoundedIter;
pub use record::AllocationRecord;
pub use registry::TrackingRegistry;
pub use sweep::SweepStats;
pub use thread_registry::{FinalizeReport, FinalizedType, finalize, registered_types};
