use std::{fmt, mem, ptr::NonNull};

/// What happens to a fiber's value when its binding is finalized.
///
/// A [`FiberLocal`] picks its strategy at construction and shares it with every binding it creates,
/// so a binding can still finalize itself after the slot is gone.
///
/// [`FiberLocal`]: struct.FiberLocal.html
pub enum Cleanup<T> {
    /// Drops the value as an owned `Box<T>`.
    Destroy,
    /// Hands ownership of the value to the finalizer.
    ///
    /// With `None` nothing happens and the value's memory is not reclaimed:
    /// whoever kept a pointer to it is responsible for it.
    Custom(Option<fn(Box<T>)>),
}

impl<T> Cleanup<T> {
    /// Finalizes `value` according to the strategy. `None` is a no-op.
    pub fn invoke(&self, value: Option<Box<T>>) {
        let value = match value {
            Some(value) => value,
            None => return,
        };

        match self {
            Cleanup::Destroy => drop(value),
            Cleanup::Custom(Some(finalizer)) => finalizer(value),
            Cleanup::Custom(None) => mem::forget(value),
        }
    }
}

impl<T> Clone for Cleanup<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Cleanup<T> {}

impl<T> Default for Cleanup<T> {
    fn default() -> Self {
        Cleanup::Destroy
    }
}

impl<T> fmt::Debug for Cleanup<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Cleanup::Destroy => f.write_str("Destroy"),
            Cleanup::Custom(Some(finalizer)) => {
                f.debug_tuple("Custom").field(&(*finalizer as *const ())).finish()
            }
            Cleanup::Custom(None) => f.write_str("Custom(None)"),
        }
    }
}

/// Type-erased [`Cleanup`], so one fiber's table can hold bindings of unrelated types.
pub(crate) trait Finalize: Send + Sync {
    /// # Safety
    ///
    /// `raw` must be null or come from `Box::<T>::into_raw` (or `Box::leak`) for this strategy's `T`,
    /// and must not have been finalized or reclaimed already.
    unsafe fn finalize(&self, raw: *mut ());
}

impl<T: 'static> Finalize for Cleanup<T> {
    unsafe fn finalize(&self, raw: *mut ()) {
        let value = NonNull::new(raw.cast::<T>()).map(|ptr| unsafe { Box::from_raw(ptr.as_ptr()) });
        self.invoke(value);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{
            ptr,
            sync::{
                atomic::{AtomicUsize, Ordering},
                Arc,
            },
        },
    };

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn destroy_drops_the_value() {
        let drops = Arc::new(AtomicUsize::new(0));

        Cleanup::Destroy.invoke(Some(Box::new(Tracked(drops.clone()))));
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        Cleanup::<Tracked>::Destroy.invoke(None);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_finalizer_receives_the_value() {
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);

        fn finalize(value: Box<u32>) {
            FINALIZED.fetch_add(*value as usize, Ordering::SeqCst);
        }

        let cleanup = Cleanup::Custom(Some(finalize as fn(Box<u32>)));
        cleanup.invoke(Some(Box::new(7)));
        cleanup.invoke(None);

        assert_eq!(FINALIZED.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn custom_none_leaves_the_value_alone() {
        let drops = Arc::new(AtomicUsize::new(0));
        let raw = Box::into_raw(Box::new(Tracked(drops.clone())));

        let cleanup: Arc<dyn Finalize> = Arc::new(Cleanup::<Tracked>::Custom(None));
        unsafe { cleanup.finalize(raw.cast()) };
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        // Still ours to free.
        drop(unsafe { Box::from_raw(raw) });
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn erased_null_is_a_no_op() {
        let cleanup: Arc<dyn Finalize> = Arc::new(Cleanup::<Tracked>::Destroy);
        unsafe { cleanup.finalize(ptr::null_mut()) };
    }
}
