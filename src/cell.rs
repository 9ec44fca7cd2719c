//! Interior-mutability abstraction shared by `cache` and `core`.
//!
//! The default build is single-threaded (`spec.md` §5): a block handle is a
//! plain `Rc<RefCell<T>>`. The `lru` feature adds one mutex per handle
//! (`Arc<parking_lot::Mutex<T>>`) so the optional LRU build can be shared
//! across the host's reader threads while the RV core itself stays
//! single-threaded.

#[cfg(not(feature = "lru"))]
mod imp {
    use std::cell::RefCell;
    use std::rc::Rc;

    pub struct Shared<T>(Rc<RefCell<T>>);

    impl<T> Shared<T> {
        pub fn new(value: T) -> Self {
            Shared(Rc::new(RefCell::new(value)))
        }

        pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
            f(&self.0.borrow())
        }

        pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
            f(&mut self.0.borrow_mut())
        }

        pub fn ptr_eq(a: &Self, b: &Self) -> bool {
            Rc::ptr_eq(&a.0, &b.0)
        }
    }

    impl<T> Clone for Shared<T> {
        fn clone(&self) -> Self {
            Shared(self.0.clone())
        }
    }
}

#[cfg(feature = "lru")]
mod imp {
    use std::sync::Arc;

    use parking_lot::Mutex;

    pub struct Shared<T>(Arc<Mutex<T>>);

    impl<T> Shared<T> {
        pub fn new(value: T) -> Self {
            Shared(Arc::new(Mutex::new(value)))
        }

        pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
            f(&self.0.lock())
        }

        pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
            f(&mut self.0.lock())
        }

        pub fn ptr_eq(a: &Self, b: &Self) -> bool {
            Arc::ptr_eq(&a.0, &b.0)
        }
    }

    impl<T> Clone for Shared<T> {
        fn clone(&self) -> Self {
            Shared(self.0.clone())
        }
    }
}

pub use imp::Shared;
