use {
    super::{Binding, FiberId, Registry, SlotId},
    crate::error::FiberLocalError,
    log::{debug, trace, warn},
    std::{
        cell::RefCell,
        collections::{BTreeMap, HashMap},
        ptr::NonNull,
    },
};

/// How many times termination re-runs cleanups that bound new values to the dying fiber.
const MAX_CLEANUP_ROUNDS: usize = 4;

/// A minimal single-threaded [`Registry`].
///
/// It does not run or switch any code; it only tracks which fibers exist, which one is active,
/// and what each of them has bound. A scheduler drives it with [`spawn`], [`switch_to`],
/// [`suspend`] and [`terminate`] as its fibers come and go.
///
/// Dropping the registry terminates every fiber still alive. By then the registry is normally
/// no longer installed on the thread (its [`EnterGuard`] is gone, or the thread local holding it
/// is being destroyed), so no fiber is reachable from those cleanups: fiber-local accesses in them
/// panic, and the `try_` variants report [`FiberLocalError::NoRegistry`]. Call [`terminate`]
/// while the registry is still installed for cleanups that need fiber-local storage.
///
/// [`EnterGuard`]: struct.EnterGuard.html
/// [`FiberLocalError::NoRegistry`]: ../enum.FiberLocalError.html#variant.NoRegistry
/// [`spawn`]: #method.spawn
/// [`switch_to`]: #method.switch_to
/// [`suspend`]: #method.suspend
/// [`terminate`]: #method.terminate
#[derive(Default)]
pub struct LocalRegistry {
    state: RefCell<State>,
}

#[derive(Default)]
struct State {
    last_fiber: u64,
    active: Option<FiberId>,
    fibers: HashMap<FiberId, BTreeMap<SlotId, Binding>>,
}

impl LocalRegistry {
    /// Creates a registry with no fibers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new fiber with empty storage. It does not become active.
    pub fn spawn(&self) -> FiberId {
        let mut state = self.state.borrow_mut();
        state.last_fiber += 1;

        let fiber = FiberId::new(state.last_fiber);
        state.fibers.insert(fiber, BTreeMap::new());

        debug!("spawned fiber {}", fiber);
        fiber
    }

    /// Makes `fiber` the active fiber, returning the one that was active before.
    ///
    /// # Errors
    ///
    /// Returns an error if `fiber` is not alive.
    pub fn switch_to(&self, fiber: FiberId) -> Result<Option<FiberId>, FiberLocalError> {
        let mut state = self.state.borrow_mut();

        if !state.fibers.contains_key(&fiber) {
            return Err(FiberLocalError::UnknownFiber(fiber));
        }

        trace!("switching to fiber {}", fiber);
        Ok(state.active.replace(fiber))
    }

    /// Leaves no fiber active, returning the one that was.
    pub fn suspend(&self) -> Option<FiberId> {
        self.state.borrow_mut().active.take()
    }

    /// Finalizes everything `fiber` still owns and forgets the fiber.
    ///
    /// Returns how many bindings were finalized.
    ///
    /// Bindings are finalized one at a time, newest slot first; each leaves the table right before
    /// its cleanup runs, so the cleanup still sees the fiber's other values. If `fiber` is the active
    /// one it stays active meanwhile. Values bound by the cleanups themselves are finalized in
    /// further rounds.
    ///
    /// # Errors
    ///
    /// Returns an error if `fiber` is not alive.
    pub fn terminate(&self, fiber: FiberId) -> Result<usize, FiberLocalError> {
        if !self.is_alive(fiber) {
            return Err(FiberLocalError::UnknownFiber(fiber));
        }

        let mut finalized = 0;

        for _ in 0..MAX_CLEANUP_ROUNDS {
            let slots = self.bound_slots(fiber);
            if slots.is_empty() {
                break;
            }

            for slot in slots {
                if let Some(binding) = self.set_binding(fiber, slot, None) {
                    finalized += 1;
                    drop(binding);
                }
            }
        }

        let leftover = {
            let mut state = self.state.borrow_mut();
            if state.active == Some(fiber) {
                state.active = None;
            }
            state.fibers.remove(&fiber).unwrap_or_default()
        };

        if !leftover.is_empty() {
            warn!(
                "fiber {} still had {} binding(s) after {} cleanup rounds, finalizing them after termination",
                fiber,
                leftover.len(),
                MAX_CLEANUP_ROUNDS
            );
            finalized += leftover.len();
            drop(leftover);
        }

        debug!("terminated fiber {}, finalized {} binding(s)", fiber, finalized);
        Ok(finalized)
    }

    /// Whether `fiber` has been spawned and not yet terminated.
    pub fn is_alive(&self, fiber: FiberId) -> bool {
        self.state.borrow().fibers.contains_key(&fiber)
    }

    /// Number of live fibers.
    pub fn fiber_count(&self) -> usize {
        self.state.borrow().fibers.len()
    }

    /// Number of values bound in `fiber`; zero for a fiber that is not alive.
    pub fn binding_count(&self, fiber: FiberId) -> usize {
        self.state
            .borrow()
            .fibers
            .get(&fiber)
            .map_or(0, BTreeMap::len)
    }

    /// Slots bound in `fiber`, newest first.
    fn bound_slots(&self, fiber: FiberId) -> Vec<SlotId> {
        self.state
            .borrow()
            .fibers
            .get(&fiber)
            .map(|bindings| bindings.keys().rev().copied().collect())
            .unwrap_or_default()
    }
}

unsafe impl Registry for LocalRegistry {
    fn active_fiber(&self) -> Option<FiberId> {
        self.state.borrow().active
    }

    fn get_binding(&self, fiber: FiberId, slot: SlotId) -> Option<NonNull<()>> {
        self.state
            .borrow()
            .fibers
            .get(&fiber)?
            .get(&slot)
            .map(Binding::value)
    }

    /// # Panics
    ///
    /// Panics if `binding` was created for another slot. The binding is finalized by its own
    /// cleanup on the way out.
    fn set_binding(&self, fiber: FiberId, slot: SlotId, binding: Option<Binding>) -> Option<Binding> {
        if let Some(binding) = &binding {
            assert_eq!(
                binding.slot(),
                slot,
                "binding of slot {} cannot be stored under slot {}",
                binding.slot(),
                slot
            );
        }

        let mut state = self.state.borrow_mut();

        if let Some(bindings) = state.fibers.get_mut(&fiber) {
            return match binding {
                Some(binding) => bindings.insert(slot, binding),
                None => bindings.remove(&slot),
            };
        }

        drop(state);

        if binding.is_some() {
            warn!(
                "slot {} bound a value to fiber {} which is not alive, finalizing it",
                slot, fiber
            );
        }
        drop(binding);
        None
    }
}

impl Drop for LocalRegistry {
    fn drop(&mut self) {
        let mut fibers: Vec<FiberId> = self.state.get_mut().fibers.keys().copied().collect();
        fibers.sort();

        for fiber in fibers {
            if let Err(err) = self.terminate(fiber) {
                debug!("fiber {} vanished while the registry was dropped: {}", fiber, err);
            }
        }
    }
}
