//! Device nodes and the operations a driver plugs into them.
use alloc::{boxed::Box, vec::Vec};
use core::fmt::Debug;

use bitflags::bitflags;
use spin::RwLock;

use crate::{
    dev::{
        Descriptor,
        handle::{Handle, HandleRef},
        ioctl::{Command, IoctlArg},
        isr::{EventKind, Outcome},
    },
    error::{DevError, DevResult},
    sync::IrqSpinLock,
};

/// Name of the root node every path is resolved from.
pub const ROOT_NAME: &str = "dev";

/// Offset value meaning "no offset": the device is addressed as a whole.
pub const NO_POSITION: Position = -1;

/// Device-defined offset: register address, pin number, channel index.
pub type Position = i32;

bitflags! {
    /// Open modes a device supports.
    pub struct Capability: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const RDWR = Self::READ.bits | Self::WRITE.bits;
        const NONBLOCK = 1 << 2;
        /// At most one open at a time.
        const EXCLUSIVE = 1 << 5;
    }
}

bitflags! {
    /// Mode a descriptor is opened with.
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const RDWR = Self::READ.bits | Self::WRITE.bits;
        /// Writes return once queued; completion is signalled from the interrupt handler.
        const NONBLOCK = 1 << 2;
        /// Ask for the device's capabilities instead of opening it. See [Registry::access].
        ///
        /// [Registry::access]: crate::dev::Registry::access
        const QUERY = 1 << 8;
    }
}

bitflags! {
    /// Per-device arbitration bits.
    pub struct LockFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const RDWR = Self::READ.bits | Self::WRITE.bits;
        /// A non-blocking write is still in flight.
        const NONBLOCK = 1 << 2;
    }
}

impl OpenFlags {
    /// Capabilities a device needs to be opened with these flags.
    pub fn required(self) -> Capability {
        Capability::from_bits_truncate((self - OpenFlags::QUERY).bits())
    }

    pub fn transfer(self) -> Transfer {
        if self.contains(OpenFlags::NONBLOCK) {
            Transfer::Async
        } else {
            Transfer::Sync
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Complete before returning.
    Sync,
    /// Queue and return; the device reports completion through its interrupt handler.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Root,
    Adc,
    Can,
    Dac,
    I2c,
    Pin,
    Pwm,
    Serial,
    Spi,
    Timer,
    Gpio,
}

/// Driver-side operations of a device.
///
/// Every operation receives the [Device] it was registered on. Implementations own their
/// hardware driver and any buffers. They are never called with a registry lock held, so an
/// implementation may call back into the registry.
pub trait DeviceOps: Send + Sync {
    /// Bring the hardware up. Called when the first descriptor in the subtree opens.
    fn open(&self, _dev: &Device) -> DevResult<()> {
        Ok(())
    }

    /// Shut the hardware down. Called when the last descriptor in the subtree closes.
    fn close(&self, _dev: &Device) -> DevResult<()> {
        Ok(())
    }

    fn read(&self, _dev: &Device, _pos: Position, _buf: &mut [u8], _mode: Transfer) -> DevResult<usize> {
        Err(DevError::NotSupported)
    }

    fn write(&self, _dev: &Device, _pos: Position, _buf: &[u8], _mode: Transfer) -> DevResult<usize> {
        Err(DevError::NotSupported)
    }

    fn ioctl(&self, _dev: &Device, _pos: Position, _cmd: Command, _arg: IoctlArg<'_>) -> DevResult<usize> {
        Err(DevError::NotSupported)
    }

    /// Decode a hardware event into an [Outcome].
    fn isr(&self, _dev: &Device, _event: EventKind, _payload: &[u8]) -> DevResult<Outcome> {
        Err(DevError::NotSupported)
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeviceState {
    pub ref_count: usize,
    pub lock: LockFlags,
    /// Descriptors with a read callback installed.
    pub rd_waiters: Vec<Descriptor>,
    /// Descriptors with a write callback installed.
    pub wr_waiters: Vec<Descriptor>,
}

impl Default for LockFlags {
    fn default() -> Self {
        LockFlags::empty()
    }
}

pub struct Device {
    name: Box<str>,
    class: DeviceClass,
    caps: Capability,
    this: HandleRef<Device>,
    parent: Option<HandleRef<Device>>,
    children: RwLock<Vec<Handle<Device>>>,
    ops: Box<dyn DeviceOps>,
    pub(crate) state: IrqSpinLock<DeviceState>,
}

/// Placeholder operations of the root node.
struct RootOps;

impl DeviceOps for RootOps {}

impl Device {
    pub(crate) fn new_root() -> Handle<Device> {
        Handle::new_cyclic(|this| Device {
            name: Box::from(ROOT_NAME),
            class: DeviceClass::Root,
            caps: Capability::empty(),
            this: this.clone(),
            parent: None,
            children: RwLock::new(Vec::new()),
            ops: Box::new(RootOps),
            state: IrqSpinLock::default(),
        })
    }

    pub(crate) fn new_child(
        parent: &Handle<Device>,
        name: &str,
        class: DeviceClass,
        caps: Capability,
        ops: Box<dyn DeviceOps>,
    ) -> Handle<Device> {
        Handle::new_cyclic(|this| Device {
            name: Box::from(name),
            class,
            caps,
            this: this.clone(),
            parent: Some(parent.create_ref()),
            children: RwLock::new(Vec::new()),
            ops,
            state: IrqSpinLock::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn capability(&self) -> Capability {
        self.caps
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Weak reference to this node, for drivers that need to name their device later.
    pub fn create_ref(&self) -> HandleRef<Device> {
        self.this.clone()
    }

    pub fn parent(&self) -> Option<Handle<Device>> {
        self.parent.as_ref().and_then(HandleRef::get_handle)
    }

    pub fn children(&self) -> Vec<Handle<Device>> {
        self.children.read().clone()
    }

    pub fn child(&self, name: &str) -> Option<Handle<Device>> {
        self.children
            .read()
            .iter()
            .find(|child| child.name() == name)
            .cloned()
    }

    /// Number of descriptors holding this node open, directly or through a descendant.
    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    pub fn lock_flags(&self) -> LockFlags {
        self.state.lock().lock
    }

    pub(crate) fn ops(&self) -> &dyn DeviceOps {
        self.ops.as_ref()
    }

    pub(crate) fn children_mut(&self) -> spin::RwLockWriteGuard<'_, Vec<Handle<Device>>> {
        self.children.write()
    }

    /// This node followed by its ancestors, leaf first. The root is not included.
    pub(crate) fn lineage(&self) -> Vec<Handle<Device>> {
        let mut chain = Vec::new();
        let mut node = self.this.get_handle();
        while let Some(dev) = node {
            if dev.is_root() {
                break;
            }
            node = dev.parent();
            chain.push(dev);
        }
        chain
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("caps", &self.caps)
            .field("children", &self.children.read().len())
            .field("state", &*self.state.lock())
            .finish()
    }
}
