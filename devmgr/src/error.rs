//! Error kinds shared by every device operation.
//!
//! Each kind has a stable negative integer code (`0` is success) and a fixed message, so boards
//! that report errors as plain numbers can still turn them back into text with [describe].
use core::fmt::{Debug, Display, Write};

/// An error that can be printed to a text sink.
pub trait MessageError: Debug {
    /// Print the error message to a writer.
    fn print_to_writer(&self, f: &mut dyn Write) {
        if let Err(err) = f.write_fmt(format_args!("{:?}", self)) {
            let _ = f.write_fmt(format_args!("Error on printing error message: {:?}", err));
        }
    }
}

impl Display for dyn MessageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.print_to_writer(f);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    /// Allocation failed, or no free descriptor slot is left.
    NoMemory,
    /// The hardware reported a failure.
    Io,
    /// No device exists at the given path.
    NotFound,
    /// Another descriptor or bus member currently holds the resource.
    Busy,
    /// A device with the same name is already registered under that parent.
    AlreadyExists,
    /// The device lacks the capability, or the operation is not implemented.
    NotSupported,
    /// Invalid descriptor, argument or state.
    InvalidArgument,
    /// The hardware did not answer in time.
    Timeout,
}

pub type DevResult<T> = Result<T, DevError>;

impl DevError {
    pub const fn code(self) -> i32 {
        match self {
            DevError::NoMemory => -1,
            DevError::Io => -2,
            DevError::NotFound => -3,
            DevError::Busy => -4,
            DevError::AlreadyExists => -5,
            DevError::NotSupported => -6,
            DevError::InvalidArgument => -7,
            DevError::Timeout => -8,
        }
    }

    pub const fn from_code(code: i32) -> Option<DevError> {
        match code {
            -1 => Some(DevError::NoMemory),
            -2 => Some(DevError::Io),
            -3 => Some(DevError::NotFound),
            -4 => Some(DevError::Busy),
            -5 => Some(DevError::AlreadyExists),
            -6 => Some(DevError::NotSupported),
            -7 => Some(DevError::InvalidArgument),
            -8 => Some(DevError::Timeout),
            _ => None,
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            DevError::NoMemory => "no enough memory",
            DevError::Io => "io error",
            DevError::NotFound => "not found",
            DevError::Busy => "resource busy",
            DevError::AlreadyExists => "exists",
            DevError::NotSupported => "operation not supported",
            DevError::InvalidArgument => "invalid argument",
            DevError::Timeout => "timeout",
        }
    }
}

impl Display for DevError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())
    }
}

impl MessageError for DevError {
    fn print_to_writer(&self, f: &mut dyn Write) {
        let _ = f.write_fmt(format_args!("{} ({})", self.message(), self.code()));
    }
}

/// Message for a raw status code. `0` is success; unknown codes get a generic message.
pub fn describe(code: i32) -> &'static str {
    if code == 0 {
        return "no error";
    }
    match DevError::from_code(code) {
        Some(err) => err.message(),
        None => "unknown error",
    }
}
