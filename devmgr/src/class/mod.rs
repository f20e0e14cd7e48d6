//! Device classes.
//!
//! Each class turns a small hardware trait, implemented by a chip-specific driver, into a
//! complete [DeviceOps](crate::dev::DeviceOps) implementation that can be registered.
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    dev::Position,
    error::{DevError, DevResult},
};

pub mod adc;
pub mod can;
pub mod dac;
pub mod i2c;
pub mod pin;
pub mod pwm;
pub mod serial;
pub mod spi;
pub mod timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitOrder {
    #[default]
    Lsb,
    Msb,
}

/// Channels of a multi-channel converter or timer.
pub(crate) const CHANNEL_MAX: usize = 32;

/// Size of one sample, duty or time value on the wire.
pub(crate) const WORD_SIZE: usize = size_of::<u32>();

/// Channel selected by a descriptor position.
pub(crate) fn channel_of(pos: Position) -> DevResult<usize> {
    usize::try_from(pos)
        .ok()
        .filter(|channel| *channel < CHANNEL_MAX)
        .ok_or(DevError::InvalidArgument)
}

/// Bit `n` set when channel `n` is on.
#[derive(Debug, Default)]
pub(crate) struct ChannelSet(AtomicU32);

impl ChannelSet {
    pub fn contains(&self, channel: usize) -> bool {
        self.0.load(Ordering::Relaxed) & (1 << channel) != 0
    }

    pub fn set(&self, channel: usize, on: bool) {
        if on {
            self.0.fetch_or(1 << channel, Ordering::Relaxed);
        } else {
            self.0.fetch_and(!(1 << channel), Ordering::Relaxed);
        }
    }

    /// Channels currently on.
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0.load(Ordering::Relaxed);
        (0..CHANNEL_MAX).filter(move |channel| bits & (1 << channel) != 0)
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    /// Clear the set, returning the channels that were on.
    pub fn take(&self) -> impl Iterator<Item = usize> {
        let bits = self.0.swap(0, Ordering::Relaxed);
        (0..CHANNEL_MAX).filter(move |channel| bits & (1 << channel) != 0)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn channel_set() {
        let set = ChannelSet::default();
        set.set(0, true);
        set.set(31, true);
        set.set(4, true);
        set.set(4, false);
        assert!(set.contains(31));
        assert!(!set.contains(4));
        assert_eq!(set.iter().collect::<Vec<_>>(), [0, 31]);
        assert_eq!(set.take().collect::<Vec<_>>(), [0, 31]);
        assert_eq!(set.iter().count(), 0);

        assert_eq!(channel_of(31), Ok(31));
        assert_eq!(channel_of(32), Err(DevError::InvalidArgument));
        assert_eq!(channel_of(-1), Err(DevError::InvalidArgument));
    }
}
