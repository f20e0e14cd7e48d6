//! devmgr: device management for small embedded targets.
//!
//! Drivers register devices under a `/dev`-rooted tree; applications open them by path and
//! get a descriptor for `read`, `write` and `ioctl`. Interrupt handlers feed events back through
//! [Registry::deliver_event], which runs the completion callbacks installed on the descriptors.
//! Devices sharing a physical bus (SPI, I2C, CAN) arbitrate for it through [bus::Bus].
#![cfg_attr(not(test), no_std)]
extern crate alloc;

#[macro_use]
pub mod logging;
pub mod bus;
pub mod class;
pub mod dev;
pub mod error;
pub mod sync;

pub use dev::{
    Access, Capability, Command, Descriptor, Device, DeviceClass, DeviceOps, EventKind, Handle, IoctlArg,
    OpenFlags, Outcome, Registry,
};
pub use error::{DevError, DevResult};
pub use utils::ring::RingBuffer;
