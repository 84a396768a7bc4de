//! Handle and registry errors

use thiserror::Error;

/// Errors raised by direct use of a [`TrackingRegistry`](crate::TrackingRegistry)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The address already has a record
    #[error("address {address:#x} is already tracked")]
    AlreadyTracked {
        /// Address of the existing record
        address: usize,
    },
}

/// Errors returned by the fallible [`Handle`](crate::Handle) accessors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The handle has no target
    #[error("handle is null")]
    Null,

    /// Element index past the handle's extent
    #[error("index {index} out of bounds for extent {extent}")]
    OutOfBounds {
        /// Requested index
        index: usize,
        /// Number of elements behind the handle
        extent: usize,
    },

    /// Mutable access requested while other handles share the target
    #[error("target is shared by {count} handles")]
    Shared {
        /// Current reference count of the target
        count: usize,
    },
}

/// Result type for handle operations
pub type Result<T, E = HandleError> = std::result::Result<T, E>;
