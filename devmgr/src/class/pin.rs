//! GPIO pins.
//!
//! The descriptor position selects the pin number. Reads and writes move one level byte per
//! pin access (`0` low, anything else high).
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    dev::{
        Capability, Command, Device, DeviceClass, DeviceOps, EventKind, Handle, IoctlArg, Outcome,
        Position, Registry, Transfer,
    },
    error::{DevError, DevResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PinMode {
    None = 0,
    Output = 1,
    OutputOpenDrain = 2,
    Input = 3,
    InputPullDown = 4,
    InputPullUp = 5,
    IrqRising = 6,
    IrqFalling = 7,
    IrqEdge = 8,
    IrqLow = 9,
    IrqHigh = 10,
}

pub trait PinDriver: Send + Sync {
    fn configure(&self, number: usize, mode: PinMode) -> DevResult<()>;
    fn read(&self, number: usize) -> DevResult<bool>;
    fn write(&self, number: usize, high: bool) -> DevResult<()>;
}

pub struct Pin<D: PinDriver> {
    driver: D,
}

fn pin_number(pos: Position) -> DevResult<usize> {
    usize::try_from(pos).map_err(|_| DevError::InvalidArgument)
}

impl<D: PinDriver + 'static> Pin<D> {
    pub fn new(driver: D) -> Pin<D> {
        Pin { driver }
    }

    pub fn register(self, registry: &Registry, path: &str) -> DevResult<Handle<Device>> {
        registry.register(path, DeviceClass::Pin, Capability::RDWR, self)
    }
}

impl<D: PinDriver> DeviceOps for Pin<D> {
    fn read(&self, _dev: &Device, pos: Position, buf: &mut [u8], _mode: Transfer) -> DevResult<usize> {
        let number = pin_number(pos)?;
        for level in buf.iter_mut() {
            *level = self.driver.read(number)? as u8;
        }
        Ok(buf.len())
    }

    fn write(&self, _dev: &Device, pos: Position, buf: &[u8], _mode: Transfer) -> DevResult<usize> {
        let number = pin_number(pos)?;
        for level in buf.iter() {
            self.driver.write(number, *level != 0)?;
        }
        Ok(buf.len())
    }

    /// `SetConfig` takes a `&PinMode`, or its raw number as [IoctlArg::Int].
    fn ioctl(&self, _dev: &Device, pos: Position, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        match cmd {
            Command::SetConfig => {
                let number = pin_number(pos)?;
                let mode = match arg {
                    IoctlArg::Int(raw) => u8::try_from(raw)
                        .ok()
                        .and_then(|raw| PinMode::try_from(raw).ok())
                        .ok_or(DevError::InvalidArgument)?,
                    _ => *arg.config::<PinMode>()?,
                };
                self.driver.configure(number, mode)?;
                Ok(size_of::<PinMode>())
            }
            _ => Err(DevError::NotSupported),
        }
    }

    /// A pin interrupt carries the pin number as a little-endian `u32` payload.
    fn isr(&self, _dev: &Device, event: EventKind, payload: &[u8]) -> DevResult<Outcome> {
        match event {
            EventKind::Read => {
                let raw: [u8; 4] = payload
                    .get(..4)
                    .and_then(|bytes| bytes.try_into().ok())
                    .ok_or(DevError::InvalidArgument)?;
                Ok(Outcome::ReadReady(u32::from_le_bytes(raw) as usize))
            }
            _ => Err(DevError::NotSupported),
        }
    }
}
