//! Control commands and their arguments.
//!
//! Commands share one 32-bit code space. Generic commands sit in the top byte (setters have bit 7
//! of that byte set, getters do not). Every other code is handed to the driver untouched as
//! [Command::Driver].
use alloc::sync::Arc;
use core::any::Any;

use num_enum::FromPrimitive;

use crate::{
    dev::Descriptor,
    error::{DevError, DevResult},
};

/// Completion notification, called from interrupt context with the descriptor it was installed
/// on and the size reported by the device.
pub type Callback = Arc<dyn Fn(Descriptor, usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum Command {
    SetPosition = 0x8100_0000,
    SetReadCallback = 0x8200_0000,
    SetWriteCallback = 0x8300_0000,
    SetConfig = 0x8600_0000,
    SetReadBufSize = 0x8700_0000,
    SetWriteBufSize = 0x8800_0000,
    ClearReadBuf = 0x8900_0000,
    ClearWriteBuf = 0x8a00_0000,

    GetPosition = 0x0100_0000,
    GetReadCallback = 0x0200_0000,
    GetWriteCallback = 0x0300_0000,
    GetConfig = 0x0600_0000,
    GetReadBufSize = 0x0700_0000,
    GetWriteBufSize = 0x0800_0000,
    GetReadDataSize = 0x0900_0000,
    GetWriteDataSize = 0x0a00_0000,

    /// Driver-defined command.
    #[num_enum(catch_all)]
    Driver(u32),
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::SetPosition => 0x8100_0000,
            Command::SetReadCallback => 0x8200_0000,
            Command::SetWriteCallback => 0x8300_0000,
            Command::SetConfig => 0x8600_0000,
            Command::SetReadBufSize => 0x8700_0000,
            Command::SetWriteBufSize => 0x8800_0000,
            Command::ClearReadBuf => 0x8900_0000,
            Command::ClearWriteBuf => 0x8a00_0000,
            Command::GetPosition => 0x0100_0000,
            Command::GetReadCallback => 0x0200_0000,
            Command::GetWriteCallback => 0x0300_0000,
            Command::GetConfig => 0x0600_0000,
            Command::GetReadBufSize => 0x0700_0000,
            Command::GetWriteBufSize => 0x0800_0000,
            Command::GetReadDataSize => 0x0900_0000,
            Command::GetWriteDataSize => 0x0a00_0000,
            Command::Driver(code) => code,
        }
    }

    /// Commands the registry answers itself, without asking the driver.
    pub fn is_registry_command(self) -> bool {
        matches!(
            self,
            Command::SetPosition
                | Command::GetPosition
                | Command::SetReadCallback
                | Command::GetReadCallback
                | Command::SetWriteCallback
                | Command::GetWriteCallback
        )
    }
}

/// Argument of a control command. Output variants borrow the caller's storage.
pub enum IoctlArg<'a> {
    None,
    Int(i32),
    IntOut(&'a mut i32),
    Size(usize),
    SizeOut(&'a mut usize),
    Callback(Option<Callback>),
    CallbackOut(&'a mut Option<Callback>),
    /// Class-specific configuration, e.g. `&SerialConfig`.
    Config(&'a dyn Any),
    ConfigOut(&'a mut dyn Any),
    /// Full-duplex transfer buffers.
    Exchange { rd: &'a mut [u8], wr: &'a [u8] },
}

impl<'a> IoctlArg<'a> {
    pub fn int(&self) -> DevResult<i32> {
        match self {
            IoctlArg::Int(value) => Ok(*value),
            _ => Err(DevError::InvalidArgument),
        }
    }

    pub fn size(&self) -> DevResult<usize> {
        match self {
            IoctlArg::Size(value) => Ok(*value),
            _ => Err(DevError::InvalidArgument),
        }
    }

    pub fn config<T: 'static>(&self) -> DevResult<&T> {
        match self {
            IoctlArg::Config(value) => value.downcast_ref::<T>().ok_or(DevError::InvalidArgument),
            _ => Err(DevError::InvalidArgument),
        }
    }

    pub fn store_int(self, value: i32) -> DevResult<usize> {
        match self {
            IoctlArg::IntOut(out) => {
                *out = value;
                Ok(size_of::<i32>())
            }
            _ => Err(DevError::InvalidArgument),
        }
    }

    pub fn store_size(self, value: usize) -> DevResult<usize> {
        match self {
            IoctlArg::SizeOut(out) => {
                *out = value;
                Ok(size_of::<usize>())
            }
            _ => Err(DevError::InvalidArgument),
        }
    }

    pub fn store_config<T: Clone + 'static>(self, value: &T) -> DevResult<usize> {
        match self {
            IoctlArg::ConfigOut(out) => {
                let out = out.downcast_mut::<T>().ok_or(DevError::InvalidArgument)?;
                *out = value.clone();
                Ok(size_of::<T>())
            }
            _ => Err(DevError::InvalidArgument),
        }
    }
}

impl core::fmt::Debug for IoctlArg<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IoctlArg::None => f.write_str("None"),
            IoctlArg::Int(value) => write!(f, "Int({})", value),
            IoctlArg::IntOut(_) => f.write_str("IntOut"),
            IoctlArg::Size(value) => write!(f, "Size({})", value),
            IoctlArg::SizeOut(_) => f.write_str("SizeOut"),
            IoctlArg::Callback(call) => write!(f, "Callback(set: {})", call.is_some()),
            IoctlArg::CallbackOut(_) => f.write_str("CallbackOut"),
            IoctlArg::Config(_) => f.write_str("Config"),
            IoctlArg::ConfigOut(_) => f.write_str("ConfigOut"),
            IoctlArg::Exchange { rd, wr } => write!(f, "Exchange({}, {})", rd.len(), wr.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes() {
        assert_eq!(Command::from(0x8600_0000), Command::SetConfig);
        assert_eq!(Command::from(0x0700_0000), Command::GetReadBufSize);
        assert_eq!(Command::from(0x0000_0001), Command::Driver(1));
        assert_eq!(Command::SetReadCallback.code(), 0x8200_0000);
        assert_eq!(Command::Driver(0x42).code(), 0x42);
    }

    #[test]
    fn typed_config() {
        let value = 7u16;
        assert_eq!(IoctlArg::Config(&value).config::<u16>(), Ok(&7));
        assert_eq!(IoctlArg::Config(&value).config::<u32>(), Err(DevError::InvalidArgument));

        let mut out = 0u16;
        assert_eq!(IoctlArg::ConfigOut(&mut out).store_config(&9u16), Ok(2));
        assert_eq!(out, 9);
    }
}
