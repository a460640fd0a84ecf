//! The boundary between fiber-local slots and whatever schedules the fibers.
//!
//! A slot never stores values itself. Each fiber owns a table of [`Binding`]s keyed by [`SlotId`],
//! kept by a [`Registry`] that also knows which fiber is running right now. Slots find the registry
//! of the calling thread through [`current`]; a scheduler (or a test) installs one with [`enter`].

mod local;

pub use local::LocalRegistry;

use {
    crate::{cleanup::Finalize, error::FiberLocalError},
    std::{
        cell::RefCell,
        fmt,
        ptr::NonNull,
        rc::Rc,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        thread,
    },
};

/// Identity of a fiber within one registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// Wraps a scheduler-chosen fiber identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a [`FiberLocal`] slot, the key into every fiber's table.
///
/// Assigned once per slot from a process-wide counter and never reused,
/// so it stays valid however the slot itself is moved.
///
/// [`FiberLocal`]: ../struct.FiberLocal.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value bound to one slot within one fiber, and the cleanup that finalizes it.
///
/// Only [`FiberLocal`] creates bindings; registries just hold on to them, under the [`slot`]
/// each binding was created for.
/// Dropping a binding that [`owns`] its value runs the slot's cleanup on it exactly once,
/// which is how a registry finalizes a terminating fiber's storage.
///
/// [`FiberLocal`]: ../struct.FiberLocal.html
/// [`owns`]: #method.owns
/// [`slot`]: #method.slot
pub struct Binding {
    slot: SlotId,
    value: NonNull<()>,
    cleanup: Option<Arc<dyn Finalize>>,
}

impl Binding {
    pub(crate) fn new(slot: SlotId, value: NonNull<()>, cleanup: Arc<dyn Finalize>) -> Self {
        Self {
            slot,
            value,
            cleanup: Some(cleanup),
        }
    }

    /// The slot that created the binding. Its value has that slot's type.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Type-erased pointer to the bound value.
    pub fn value(&self) -> NonNull<()> {
        self.value
    }

    /// Whether dropping the binding will finalize the value.
    pub fn owns(&self) -> bool {
        self.cleanup.is_some()
    }

    /// Gives up ownership of the value without finalizing it.
    pub(crate) fn disown(mut self) -> NonNull<()> {
        self.cleanup = None;
        self.value
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            // SAFETY: the pointer and the cleanup were paired by the slot that created the binding,
            // and taking the cleanup out makes this the only finalization.
            unsafe { cleanup.finalize(self.value.as_ptr()) };
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Binding")
            .field("slot", &self.slot)
            .field("value", &self.value)
            .field("owns", &self.owns())
            .finish()
    }
}

/// The scheduler side of fiber-local storage.
///
/// One registry serves one OS thread. It knows which of its fibers is active and keeps
/// a table of [`Binding`]s per fiber.
///
/// When a fiber terminates, the registry must drop each of its bindings,
/// which finalizes the values they still own.
///
/// # Safety
///
/// Slots trust the registry with type-erased values. Implementations must guarantee that:
/// 1) a binding is only ever stored under its own [`Binding::slot`]; [`set_binding`] must refuse
/// (panic, or drop the binding) when asked to store it under another slot, since `set_binding`
/// is safe to call;
/// 2) [`set_binding`] returns exactly the binding last stored for that fiber and slot, or `None`;
/// 3) [`get_binding`] returns the value of that same binding;
/// 4) a stored binding is dropped only when its fiber terminates, never earlier;
/// 5) no binding is dropped while internal state needed by these methods is borrowed,
/// since finalizers may run arbitrary code, including fiber-local accesses.
///
/// [`set_binding`]: #tymethod.set_binding
/// [`get_binding`]: #tymethod.get_binding
pub unsafe trait Registry {
    /// The fiber currently running on this thread, if any.
    fn active_fiber(&self) -> Option<FiberId>;

    /// The value bound to `slot` in `fiber`, if any.
    fn get_binding(&self, fiber: FiberId, slot: SlotId) -> Option<NonNull<()>>;

    /// Installs (`Some`) or erases (`None`) the binding of `slot` in `fiber`.
    /// A binding created for another slot must be refused.
    ///
    /// Returns the previous binding without finalizing it; the caller decides its fate.
    fn set_binding(&self, fiber: FiberId, slot: SlotId, binding: Option<Binding>) -> Option<Binding>;
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<dyn Registry>>> = RefCell::new(None);
}

/// Returns the registry installed on this thread, if any.
///
/// Also returns `None` once this thread's thread local storage is being torn down.
pub fn current() -> Option<Rc<dyn Registry>> {
    CURRENT
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

/// Installs `registry` as this thread's registry until the returned guard is dropped.
///
/// Guards nest: dropping one reinstates whatever was current when it was created.
/// They must be dropped in the reverse order of creation; debug builds panic otherwise.
pub fn enter(registry: Rc<dyn Registry>) -> EnterGuard {
    let installed = registry_addr(&registry);
    let previous = CURRENT.with(|current| current.replace(Some(registry)));

    EnterGuard {
        installed,
        previous,
    }
}

fn registry_addr(registry: &Rc<dyn Registry>) -> *const () {
    Rc::as_ptr(registry) as *const ()
}

/// Restores the previously installed registry on drop. See [`enter`].
#[must_use = "the registry is uninstalled as soon as the guard is dropped"]
pub struct EnterGuard {
    installed: *const (),
    previous: Option<Rc<dyn Registry>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        debug_assert!(
            thread::panicking()
                || current().map_or(true, |current| registry_addr(&current) == self.installed),
            "registry guards dropped out of order"
        );

        let previous = self.previous.take();
        // Dropped outside of the `RefCell` borrow: the last reference to a registry
        // finalizes its fibers' values.
        let replaced = CURRENT.try_with(|current| current.replace(previous));
        drop(replaced);
    }
}

impl fmt::Debug for EnterGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EnterGuard")
            .field("restores_registry", &self.previous.is_some())
            .finish()
    }
}

/// The current thread's registry and its active fiber.
pub(crate) fn active() -> Result<(Rc<dyn Registry>, FiberId), FiberLocalError> {
    let registry = current().ok_or(FiberLocalError::NoRegistry)?;
    let fiber = registry
        .active_fiber()
        .ok_or(FiberLocalError::NoActiveFiber)?;

    Ok((registry, fiber))
}
