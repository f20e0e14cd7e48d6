//! Synchronization primitives that are safe to share with interrupt handlers.
mod intr;
mod spin;

pub use intr::{CriticalSection, InterruptControl, set_interrupt_control};
pub use spin::{IrqSpinLock, IrqSpinLockGuard};
