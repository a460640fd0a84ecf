use {
    minifiberlocal::{registry, Binding, FiberId, FiberLocal, FiberLocalError, LocalRegistry, Registry, SlotId},
    std::{
        cell::{Cell, RefCell},
        collections::HashMap,
        mem,
        ptr::NonNull,
        rc::Rc,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    },
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Counted {
    drops: Arc<AtomicUsize>,
    value: i32,
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn counter_is_private_to_the_fiber_that_set_it() {
    init_logging();

    let drops = Arc::new(AtomicUsize::new(0));
    let fibers = Rc::new(LocalRegistry::new());
    let _guard = registry::enter(fibers.clone());

    let counter = FiberLocal::<Counted>::new();

    let f1 = fibers.spawn();
    let f2 = fibers.spawn();

    fibers.switch_to(f1).unwrap();
    counter.reset(Some(Box::new(Counted {
        drops: drops.clone(),
        value: 5,
    })));

    fibers.switch_to(f2).unwrap();
    assert!(counter.get().is_null());

    fibers.switch_to(f1).unwrap();
    let value = counter.get();
    assert!(!value.is_null());
    assert_eq!(unsafe { (*value).value }, 5);

    fibers.terminate(f1).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn released_value_escapes_the_custom_cleanup() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn record_call(_: Box<u64>) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    init_logging();

    let fibers = Rc::new(LocalRegistry::new());
    let _guard = registry::enter(fibers.clone());

    let slot = FiberLocal::with_finalizer(Some(record_call as fn(Box<u64>)));

    let fiber = fibers.spawn();
    fibers.switch_to(fiber).unwrap();

    slot.set(17);
    let bound = slot.get();

    let released = slot.release().unwrap();
    assert_eq!(&*released as *const u64, bound as *const u64);

    fibers.terminate(fiber).unwrap();
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    assert_eq!(*released, 17);
}

#[test]
fn each_thread_resolves_against_its_own_registry() {
    init_logging();

    let slot = Arc::new(FiberLocal::<u32>::new());

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let slot = slot.clone();
            thread::spawn(move || {
                let fibers = Rc::new(LocalRegistry::new());
                let _guard = registry::enter(fibers.clone());

                let fiber = fibers.spawn();
                fibers.switch_to(fiber).unwrap();

                assert!(slot.get().is_null());
                slot.set(n);
                slot.with(|value| value.copied())
            })
        })
        .collect();

    for (n, worker) in workers.into_iter().enumerate() {
        assert_eq!(worker.join().unwrap(), Some(n as u32));
    }

    assert_eq!(slot.try_get().err(), Some(FiberLocalError::NoRegistry));
}

/// A scheduler with a single fiber that can be restarted, standing in for an external runtime.
#[derive(Default)]
struct SingleFiber {
    running: Cell<bool>,
    generation: Cell<u64>,
    bindings: RefCell<HashMap<SlotId, Binding>>,
}

impl SingleFiber {
    fn start(&self) {
        self.generation.set(self.generation.get() + 1);
        self.running.set(true);
    }

    fn finish(&self) {
        self.running.set(false);
        let finished = mem::take(&mut *self.bindings.borrow_mut());
        drop(finished);
    }
}

unsafe impl Registry for SingleFiber {
    fn active_fiber(&self) -> Option<FiberId> {
        if self.running.get() {
            Some(FiberId::new(self.generation.get()))
        } else {
            None
        }
    }

    fn get_binding(&self, _fiber: FiberId, slot: SlotId) -> Option<NonNull<()>> {
        self.bindings.borrow().get(&slot).map(Binding::value)
    }

    fn set_binding(&self, _fiber: FiberId, slot: SlotId, binding: Option<Binding>) -> Option<Binding> {
        if let Some(binding) = &binding {
            assert_eq!(binding.slot(), slot);
        }

        let mut bindings = self.bindings.borrow_mut();
        match binding {
            Some(binding) => bindings.insert(slot, binding),
            None => bindings.remove(&slot),
        }
    }
}

#[test]
fn slots_work_against_an_injected_registry() {
    init_logging();

    let drops = Arc::new(AtomicUsize::new(0));
    let scheduler = Rc::new(SingleFiber::default());
    let _guard = registry::enter(scheduler.clone());

    let slot = FiberLocal::<Counted>::new();
    assert_eq!(slot.try_get().err(), Some(FiberLocalError::NoActiveFiber));

    scheduler.start();
    slot.set(Counted {
        drops: drops.clone(),
        value: 1,
    });
    assert_eq!(slot.with(|counted| counted.map(|counted| counted.value)), Some(1));

    scheduler.finish();
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    scheduler.start();
    assert!(slot.get().is_null());
    slot.set(Counted {
        drops: drops.clone(),
        value: 2,
    });

    // Dropping the slot while the fiber runs finalizes its value right away.
    drop(slot);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    assert!(scheduler.bindings.borrow().is_empty());
}
