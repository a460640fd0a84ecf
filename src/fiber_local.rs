use {
    crate::{
        cleanup::{Cleanup, Finalize},
        error::FiberLocalError,
        registry::{self, Binding, FiberId, Registry, SlotId},
    },
    log::{debug, trace},
    std::{fmt, mem, ptr, ptr::NonNull, rc::Rc, sync::Arc},
};

/// A fiber-local variable: every fiber sees its own value through the same handle.
///
/// The handle stores no values. It is only a key ([`SlotId`]) plus a [`Cleanup`] strategy;
/// the values live in the tables of the [`Registry`] installed on the calling thread,
/// one table per fiber.
///
/// A value bound with [`reset`] (or [`set`]) belongs to its binding until it is [`release`]d.
/// Owned values are finalized exactly once: when their fiber terminates, or when the handle is
/// dropped while their fiber is the active one, whichever comes first.
///
/// Accessing the value requires an active fiber. The plain methods panic without one,
/// the `try_` variants return a [`FiberLocalError`].
///
/// [`reset`]: #method.reset
/// [`set`]: #method.set
/// [`release`]: #method.release
pub struct FiberLocal<T: 'static> {
    id: SlotId,
    cleanup: Arc<Cleanup<T>>,
}

impl<T: 'static> FiberLocal<T> {
    /// Creates a slot whose values are dropped normally when finalized.
    pub fn new() -> Self {
        Self::with_cleanup(Cleanup::Destroy)
    }

    /// Creates a slot whose values are passed to `finalizer` when finalized.
    ///
    /// With `None`, finalization does nothing at all and the value's memory is not reclaimed.
    pub fn with_finalizer(finalizer: Option<fn(Box<T>)>) -> Self {
        Self::with_cleanup(Cleanup::Custom(finalizer))
    }

    /// Creates a slot with an explicit cleanup strategy.
    pub fn with_cleanup(cleanup: Cleanup<T>) -> Self {
        let id = SlotId::next();
        trace!("created fiber-local slot {} ({:?})", id, cleanup);

        Self {
            id,
            cleanup: Arc::new(cleanup),
        }
    }

    /// The key identifying this slot in every fiber's table.
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// The strategy finalizing this slot's values.
    pub fn cleanup(&self) -> &Cleanup<T> {
        &self.cleanup
    }

    /// Returns a pointer to the active fiber's value, or null if it has none.
    ///
    /// # Panics
    ///
    /// Panics if no fiber is active on this thread.
    #[track_caller]
    pub fn get(&self) -> *mut T {
        expect_fiber(self.try_get())
    }

    /// Like [`get`], but returns an error instead of panicking outside of a fiber.
    ///
    /// [`get`]: #method.get
    pub fn try_get(&self) -> Result<*mut T, FiberLocalError> {
        let (registry, fiber) = registry::active()?;

        Ok(registry
            .get_binding(fiber, self.id)
            .map_or(ptr::null_mut(), |value| value.cast::<T>().as_ptr()))
    }

    /// Binds `value` to the active fiber, taking ownership of it. `None` unbinds.
    ///
    /// Returns the value it replaces, if any. The replaced value is handed back as is:
    /// the slot's cleanup does not run on it.
    ///
    /// Passing the allocation that is already bound (or `None` to an empty slot) changes nothing.
    /// Zero-sized values have no allocation of their own and are always replaced.
    ///
    /// # Panics
    ///
    /// Panics if no fiber is active on this thread.
    #[track_caller]
    pub fn reset(&self, value: Option<Box<T>>) -> Option<Box<T>> {
        expect_fiber(self.try_reset(value))
    }

    /// Like [`reset`], but returns an error instead of panicking outside of a fiber.
    /// On error `value` is dropped.
    ///
    /// [`reset`]: #method.reset
    pub fn try_reset(&self, value: Option<Box<T>>) -> Result<Option<Box<T>>, FiberLocalError> {
        let (registry, fiber) = registry::active()?;

        let current = registry
            .get_binding(fiber, self.id)
            .map(NonNull::cast::<T>);
        let incoming = value.as_deref().map(NonNull::from);

        // Boxes of zero-sized types all share one dangling address.
        if current == incoming && mem::size_of::<T>() != 0 {
            // The binding already owns this allocation.
            mem::forget(value);
            return Ok(None);
        }

        let binding = value.map(|value| self.bind(value));
        trace!(
            "slot {} in fiber {}: {}",
            self.id,
            fiber,
            if binding.is_some() { "bound" } else { "unbound" }
        );

        let superseded = registry.set_binding(fiber, self.id, binding);
        Ok(superseded.map(|binding| self.reclaim(binding)))
    }

    /// Unbinds the active fiber's value and returns it without running the cleanup.
    ///
    /// The caller owns the returned value; the slot reads as empty afterwards.
    ///
    /// # Panics
    ///
    /// Panics if no fiber is active on this thread.
    #[track_caller]
    pub fn release(&self) -> Option<Box<T>> {
        expect_fiber(self.try_release())
    }

    /// Like [`release`], but returns an error instead of panicking outside of a fiber.
    ///
    /// [`release`]: #method.release
    pub fn try_release(&self) -> Result<Option<Box<T>>, FiberLocalError> {
        let (registry, fiber) = registry::active()?;

        let released = registry.set_binding(fiber, self.id, None);
        if released.is_some() {
            trace!("slot {} in fiber {}: released", self.id, fiber);
        }

        Ok(released.map(|binding| self.reclaim(binding)))
    }

    /// Boxes `value` and binds it to the active fiber. See [`reset`].
    ///
    /// [`reset`]: #method.reset
    #[track_caller]
    pub fn set(&self, value: T) -> Option<Box<T>> {
        self.reset(Some(Box::new(value)))
    }

    /// Unbinds and unboxes the active fiber's value. See [`release`].
    ///
    /// [`release`]: #method.release
    #[track_caller]
    pub fn take(&self) -> Option<T> {
        self.release().map(|value| *value)
    }

    /// Returns a reference to the active fiber's value, or `None` if it has none.
    ///
    /// # Safety
    ///
    /// The value must not be unbound, replaced or finalized while the reference is alive,
    /// and no mutable reference to it may exist meanwhile.
    ///
    /// # Panics
    ///
    /// Panics if no fiber is active on this thread.
    #[track_caller]
    pub unsafe fn as_ref(&self) -> Option<&T> {
        unsafe { self.get().as_ref() }
    }

    /// Returns a mutable reference to the active fiber's value, or `None` if it has none.
    ///
    /// # Safety
    ///
    /// The value must not be unbound, replaced or finalized while the reference is alive,
    /// and no other reference to it may exist meanwhile.
    ///
    /// # Panics
    ///
    /// Panics if no fiber is active on this thread.
    #[track_caller]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut(&self) -> Option<&mut T> {
        unsafe { self.get().as_mut() }
    }

    /// Calls `f` with the active fiber's value, or `None` if it has none.
    ///
    /// The value is checked out of the fiber's table for the duration of the call and put back
    /// afterwards, even if `f` panics. Meanwhile the slot reads as empty in this fiber.
    /// If `f` binds a new value to this slot, that value is kept when there was nothing to
    /// put back, and finalized otherwise.
    ///
    /// # Panics
    ///
    /// Panics if no fiber is active on this thread.
    #[track_caller]
    pub fn with<R, F: FnOnce(Option<&mut T>) -> R>(&self, f: F) -> R {
        let mut checkout = self.check_out();
        f(checkout.value.as_deref_mut())
    }

    /// Like [`with`], but first binds the value returned by `init` if the active fiber has none.
    ///
    /// [`with`]: #method.with
    #[track_caller]
    pub fn with_or_init<R, I, F>(&self, init: I, f: F) -> R
    where
        I: FnOnce() -> T,
        F: FnOnce(&mut T) -> R,
    {
        let mut checkout = self.check_out();
        let value: &mut T = checkout.value.get_or_insert_with(|| Box::new(init()));
        f(value)
    }

    fn bind(&self, value: Box<T>) -> Binding {
        let cleanup: Arc<dyn Finalize> = self.cleanup.clone();
        Binding::new(self.id, NonNull::from(Box::leak(value)).cast(), cleanup)
    }

    /// Takes the value back out of a binding this slot created.
    ///
    /// # Panics
    ///
    /// Panics if the binding belongs to another slot; it is then finalized by its own cleanup.
    fn reclaim(&self, binding: Binding) -> Box<T> {
        assert_eq!(
            binding.slot(),
            self.id,
            "binding of slot {} handed to slot {}",
            binding.slot(),
            self.id
        );

        let value = binding.disown().cast::<T>();
        // SAFETY: bindings of this slot are only created by `bind`, from a `Box<T>`.
        unsafe { Box::from_raw(value.as_ptr()) }
    }

    #[track_caller]
    fn check_out(&self) -> Checkout<'_, T> {
        let (registry, fiber) = expect_fiber(registry::active());

        let value = registry
            .set_binding(fiber, self.id, None)
            .map(|binding| self.reclaim(binding));

        Checkout {
            slot: self,
            registry,
            fiber,
            value,
        }
    }
}

impl<T: 'static> Default for FiberLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Drop for FiberLocal<T> {
    /// Finalizes the active fiber's value, if there is an active fiber.
    ///
    /// Values bound in other fibers stay where they are until those fibers terminate.
    fn drop(&mut self) {
        let (registry, fiber) = match registry::active() {
            Ok(active) => active,
            Err(err) => {
                debug!("dropped slot {} without finalizing anything: {}", self.id, err);
                return;
            }
        };

        if let Some(binding) = registry.set_binding(fiber, self.id, None) {
            trace!("slot {} dropped, finalizing its value in fiber {}", self.id, fiber);
            drop(binding);
        }
    }
}

impl<T: 'static> fmt::Debug for FiberLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FiberLocal")
            .field("id", &self.id)
            .field("cleanup", &*self.cleanup)
            .finish()
    }
}

/// A value checked out of a fiber's table by [`FiberLocal::with`], put back on drop.
struct Checkout<'a, T: 'static> {
    slot: &'a FiberLocal<T>,
    registry: Rc<dyn Registry>,
    fiber: FiberId,
    value: Option<Box<T>>,
}

impl<T: 'static> Drop for Checkout<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let binding = self.slot.bind(value);
            // Whatever was bound while the value was out gives way to it.
            drop(self.registry.set_binding(self.fiber, self.slot.id, Some(binding)));
        }
    }
}

#[track_caller]
fn expect_fiber<R>(result: Result<R, FiberLocalError>) -> R {
    match result {
        Ok(result) => result,
        Err(err) => panic!("fiber-local storage accessed outside of a fiber: {}", err),
    }
}
