//! Shared-ownership handles for nodes of the device tree.
//!
//! - [Handle<T>] owns a strong reference ([alloc::sync::Arc]). A parent keeps its children alive
//!   through handles, and descriptors keep their device alive through one.
//! - [HandleRef<T>] stores a weak reference ([alloc::sync::Weak]). Children point back to their
//!   parent with it, so the tree never forms a strong cycle.
//!
//! Call [HandleRef::get_handle] to upgrade. **Consumers must handle the [None] case explicitly.**
use alloc::sync::{Arc, Weak};
use core::{fmt::Debug, ops::Deref};

/// Strong owning handle backed by [Arc<T>].
pub struct Handle<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: ?Sized> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> From<T> for Handle<T> {
    fn from(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }
}

impl<T: ?Sized> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + Debug> Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T> Handle<T> {
    /// Build a value that needs a weak reference to itself while being constructed.
    pub fn new_cyclic<F>(build: F) -> Handle<T>
    where
        F: FnOnce(&HandleRef<T>) -> T,
    {
        Handle {
            inner: Arc::new_cyclic(|weak| {
                build(&HandleRef {
                    inner: weak.clone(),
                })
            }),
        }
    }
}

impl<T: ?Sized> Handle<T> {
    /// Create a non-owning [HandleRef<T>] to the same object.
    pub fn create_ref(&self) -> HandleRef<T> {
        HandleRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &Handle<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Weak (non-owning) handle backed by [Weak<T>].
pub struct HandleRef<T: ?Sized> {
    inner: Weak<T>,
}

impl<T: ?Sized> Clone for HandleRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> Debug for HandleRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("HandleRef(..)")
    }
}

impl<T: ?Sized> HandleRef<T> {
    /// Attempt to upgrade into a strong [Handle<T>].
    ///
    /// Return `None` once every strong owner has been dropped.
    pub fn get_handle(&self) -> Option<Handle<T>> {
        self.inner.upgrade().map(|inner| Handle { inner })
    }
}
