//! Fixed-capacity descriptor table.
use alloc::vec::Vec;

use crate::{
    dev::{
        Device, OpenFlags, Position,
        device::NO_POSITION,
        handle::Handle,
        ioctl::Callback,
    },
    error::{DevError, DevResult},
    sync::IrqSpinLock,
};

/// Index of an open-device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(usize);

impl Descriptor {
    pub fn index(self) -> usize {
        self.0
    }
}

impl From<Descriptor> for usize {
    fn from(desc: Descriptor) -> usize {
        desc.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

#[derive(Clone)]
pub(crate) struct Slot {
    pub device: Handle<Device>,
    pub flags: OpenFlags,
    pub position: Position,
    pub rd_call: Option<Callback>,
    pub wr_call: Option<Callback>,
}

impl Slot {
    pub fn callback(&self, direction: Direction) -> Option<&Callback> {
        match direction {
            Direction::Read => self.rd_call.as_ref(),
            Direction::Write => self.wr_call.as_ref(),
        }
    }

    pub fn callback_mut(&mut self, direction: Direction) -> &mut Option<Callback> {
        match direction {
            Direction::Read => &mut self.rd_call,
            Direction::Write => &mut self.wr_call,
        }
    }
}

pub(crate) struct DescriptorTable {
    slots: IrqSpinLock<Vec<Option<Slot>>>,
}

impl DescriptorTable {
    pub fn new(capacity: usize) -> DescriptorTable {
        let mut slots = Vec::new();
        slots.resize_with(capacity, || None);
        DescriptorTable {
            slots: IrqSpinLock::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    /// Claim the lowest free slot.
    pub fn allocate(&self, device: Handle<Device>, flags: OpenFlags) -> DevResult<Descriptor> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(DevError::NoMemory)?;
        slots[index] = Some(Slot {
            device,
            flags,
            position: NO_POSITION,
            rd_call: None,
            wr_call: None,
        });
        Ok(Descriptor(index))
    }

    pub fn free(&self, desc: Descriptor) -> DevResult<Slot> {
        self.slots
            .lock()
            .get_mut(desc.0)
            .and_then(Option::take)
            .ok_or(DevError::InvalidArgument)
    }

    /// Snapshot of a slot. The table lock is not held once this returns.
    pub fn get(&self, desc: Descriptor) -> DevResult<Slot> {
        self.with_slot(desc, |slot| slot.clone())
    }

    pub fn with_slot<R>(&self, desc: Descriptor, f: impl FnOnce(&mut Slot) -> R) -> DevResult<R> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(desc.0)
            .and_then(Option::as_mut)
            .ok_or(DevError::InvalidArgument)?;
        Ok(f(slot))
    }

    pub fn callback(&self, desc: Descriptor, direction: Direction) -> Option<Callback> {
        self.with_slot(desc, |slot| slot.callback(direction).cloned())
            .ok()
            .flatten()
    }
}
