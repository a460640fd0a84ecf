//! # minifiberlocal
//!
//! Fiber-local storage: one logical variable, one private value per fiber.
//!
//! Works like thread local storage, except the value is selected by the fiber currently active on
//! this thread's scheduler rather than by the OS thread. The scheduler itself is not part of this crate;
//! it plugs in through the [`Registry`] trait and is installed per thread with [`registry::enter`].
//! [`LocalRegistry`] is a minimal single-threaded implementation.
//!
//! ```
//! use {
//!     minifiberlocal::{registry, FiberLocal, LocalRegistry},
//!     std::rc::Rc,
//! };
//!
//! let fibers = Rc::new(LocalRegistry::new());
//! let _guard = registry::enter(fibers.clone());
//!
//! let counter = FiberLocal::<u32>::new();
//!
//! let a = fibers.spawn();
//! let b = fibers.spawn();
//!
//! fibers.switch_to(a).unwrap();
//! counter.set(5);
//!
//! fibers.switch_to(b).unwrap();
//! assert!(counter.get().is_null());
//!
//! fibers.switch_to(a).unwrap();
//! assert_eq!(counter.with(|value| value.copied()), Some(5));
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

mod cleanup;
mod error;
mod fiber_local;
pub mod registry;

pub use {
    cleanup::Cleanup,
    error::FiberLocalError,
    fiber_local::FiberLocal,
    registry::{Binding, FiberId, LocalRegistry, Registry, SlotId},
};
