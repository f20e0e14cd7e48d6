//! Device model: the device tree, descriptors and the I/O surface built on them.
mod desc;
mod device;
pub mod handle;
mod ioctl;
mod isr;
mod lock;
mod registry;

pub use desc::Descriptor;
pub use device::{
    Capability, Device, DeviceClass, DeviceOps, LockFlags, NO_POSITION, OpenFlags, Position,
    ROOT_NAME, Transfer,
};
pub use handle::{Handle, HandleRef};
pub use ioctl::{Callback, Command, IoctlArg};
pub use isr::{EventKind, Outcome};
pub use registry::{Access, Registry};
