//! Critical sections.
//!
//! The board installs one [InterruptControl] at startup. A [CriticalSection] masks interrupts on
//! creation and puts back the previous mask when dropped, so sections nest freely. Until a
//! controller is installed, entering a section does nothing, which is what host-side tests use.
use core::marker::PhantomData;

use spin::Once;

/// Masks and unmasks interrupts on the current core.
pub trait InterruptControl: Sync {
    /// Mask interrupts and return the previous state.
    fn disable(&self) -> usize;
    /// Put back a state returned by [InterruptControl::disable].
    fn restore(&self, state: usize);
}

static CONTROL: Once<&'static dyn InterruptControl> = Once::new();

/// Install the interrupt controller. Only the first call has an effect; returns whether this
/// call installed `control`.
pub fn set_interrupt_control(control: &'static dyn InterruptControl) -> bool {
    let mut installed = false;
    CONTROL.call_once(|| {
        installed = true;
        control
    });
    installed
}

pub struct CriticalSection {
    saved: Option<usize>,
    // Bound to the core that entered it.
    _local: PhantomData<*const ()>,
}

impl CriticalSection {
    pub fn enter() -> CriticalSection {
        CriticalSection {
            saved: CONTROL.get().map(|control| control.disable()),
            _local: PhantomData,
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if let (Some(control), Some(state)) = (CONTROL.get(), self.saved) {
            control.restore(state);
        }
    }
}
