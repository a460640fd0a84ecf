use {crate::registry::FiberId, thiserror::Error};

/// Errors returned by the fallible fiber-local storage operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FiberLocalError {
    /// No fiber registry is installed on this thread.
    #[error("no fiber registry is installed on this thread")]
    NoRegistry,
    /// A registry is installed but none of its fibers is running.
    #[error("no fiber is active on this thread's registry")]
    NoActiveFiber,
    /// The fiber was never spawned on this registry or has already terminated.
    #[error("fiber {0} is not alive on this registry")]
    UnknownFiber(FiberId),
}
