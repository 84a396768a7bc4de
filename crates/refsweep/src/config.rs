//! Collector configuration
//!
//! Configuration is per thread, like the registries it governs. Changes
//! apply to every handle operation that runs afterwards on the same thread.

use std::cell::Cell;

/// When a handle drop runs a collection sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepPolicy {
    /// Sweep on every handle drop, whether or not it released the last reference
    #[default]
    EveryDrop,
    /// Sweep only when a drop or reassignment brought a count to zero
    OnZeroCount,
}

impl SweepPolicy {
    /// Whether a drop should sweep, given whether it zeroed its target's count
    #[inline]
    pub fn should_collect(self, reached_zero: bool) -> bool {
        match self {
            SweepPolicy::EveryDrop => true,
            SweepPolicy::OnZeroCount => reached_zero,
        }
    }
}

/// Collector configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Sweep trigger for handle drops (default: every drop)
    pub policy: SweepPolicy,
    finalize_on_thread_exit: bool,
}

impl CollectorConfig {
    const DEFAULT: Self = Self {
        policy: SweepPolicy::EveryDrop,
        finalize_on_thread_exit: false,
    };

    /// Replace the sweep policy
    pub fn with_policy(mut self, policy: SweepPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable or disable finalization at thread exit (default: disabled).
    ///
    /// When disabled, thread exit only sweeps blocks that are already
    /// unreferenced.
    ///
    /// # Safety
    /// Enabling it has the contract of [`finalize`](crate::finalize): once
    /// the thread starts tearing down, no handle on it may be dereferenced,
    /// including handles held by other thread-locals whose destructors run
    /// later.
    pub unsafe fn with_finalize_on_thread_exit(mut self, enabled: bool) -> Self {
        self.finalize_on_thread_exit = enabled;
        self
    }

    /// Whether [`finalize`](crate::finalize) runs when the thread exits
    #[inline]
    pub fn finalize_on_thread_exit(&self) -> bool {
        self.finalize_on_thread_exit
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

thread_local! {
    static CONFIG: Cell<CollectorConfig> = const { Cell::new(CollectorConfig::DEFAULT) };
}

/// Current configuration for this thread.
///
/// Falls back to the default once thread-local storage is being torn down.
pub fn config() -> CollectorConfig {
    CONFIG.try_with(Cell::get).unwrap_or_default()
}

/// Replace this thread's configuration, returning the previous one
pub fn set_config(config: CollectorConfig) -> CollectorConfig {
    CONFIG.with(|c| c.replace(config))
}

/// Run `f` with `config` installed, restoring the previous configuration afterwards
/// (also on unwind).
pub fn with_config<R>(config: CollectorConfig, f: impl FnOnce() -> R) -> R {
    struct Restore(CollectorConfig);

    impl Drop for Restore {
        fn drop(&mut self) {
            let _ = CONFIG.try_with(|c| c.set(self.0));
        }
    }

    let _restore = Restore(set_config(config));
    f()
}
