use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use super::CriticalSection;

/// Spin lock whose guard also masks interrupts.
///
/// State shared between task context and an interrupt handler lives behind one of these: a
/// handler can never spin on a lock held by the code it interrupted.
pub struct IrqSpinLock<T: ?Sized> {
    inner: Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> IrqSpinLock<T> {
        IrqSpinLock {
            inner: Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> IrqSpinLock<T> {
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let section = CriticalSection::enter();
        IrqSpinLockGuard {
            inner: self.inner.lock(),
            _section: section,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: Default> Default for IrqSpinLock<T> {
    fn default() -> Self {
        IrqSpinLock::new(T::default())
    }
}

impl<T: ?Sized + core::fmt::Debug> core::fmt::Debug for IrqSpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.inner.fmt(f)
    }
}

// region: IrqSpinLockGuard

pub struct IrqSpinLockGuard<'a, T: ?Sized> {
    // Fields drop in order: the lock is released before interrupts are unmasked.
    inner: MutexGuard<'a, T>,
    _section: CriticalSection,
}

impl<T: ?Sized> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

// endregion
