//! Analog-to-digital converters.
//!
//! The descriptor position selects the channel. A channel has to be enabled through
//! `SetConfig` before it can be read; samples are returned as little-endian `u32`.
use crate::{
    class::{ChannelSet, WORD_SIZE, channel_of},
    dev::{
        Capability, Command, Device, DeviceClass, DeviceOps, Handle, IoctlArg, Position, Registry,
        Transfer,
    },
    error::{DevError, DevResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdcConfig {
    pub enabled: bool,
}

pub trait AdcDriver: Send + Sync {
    /// Power the converter up or down.
    fn configure(&self, enable: bool) -> DevResult<()>;
    fn channel_configure(&self, channel: usize, enable: bool) -> DevResult<()>;
    fn read(&self, channel: usize) -> DevResult<u32>;
}

pub struct Adc<D: AdcDriver> {
    driver: D,
    channels: ChannelSet,
}

impl<D: AdcDriver + 'static> Adc<D> {
    pub fn new(driver: D) -> Adc<D> {
        Adc {
            driver,
            channels: ChannelSet::default(),
        }
    }

    pub fn register(self, registry: &Registry, path: &str) -> DevResult<Handle<Device>> {
        registry.register(path, DeviceClass::Adc, Capability::READ, self)
    }
}

impl<D: AdcDriver> DeviceOps for Adc<D> {
    fn open(&self, _dev: &Device) -> DevResult<()> {
        self.driver.configure(true)
    }

    fn close(&self, _dev: &Device) -> DevResult<()> {
        for channel in self.channels.take() {
            let _ = self.driver.channel_configure(channel, false);
        }
        self.driver.configure(false)
    }

    fn read(&self, _dev: &Device, pos: Position, buf: &mut [u8], _mode: Transfer) -> DevResult<usize> {
        let channel = channel_of(pos)?;
        if !self.channels.contains(channel) {
            return Err(DevError::InvalidArgument);
        }
        let mut count = 0;
        for sample in buf.chunks_exact_mut(WORD_SIZE) {
            sample.copy_from_slice(&self.driver.read(channel)?.to_le_bytes());
            count += WORD_SIZE;
        }
        Ok(count)
    }

    fn ioctl(&self, _dev: &Device, pos: Position, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        let channel = channel_of(pos)?;
        match cmd {
            Command::SetConfig => {
                let config = *arg.config::<AdcConfig>()?;
                self.driver.channel_configure(channel, config.enabled)?;
                self.channels.set(channel, config.enabled);
                Ok(size_of::<AdcConfig>())
            }
            Command::GetConfig => arg.store_config(&AdcConfig {
                enabled: self.channels.contains(channel),
            }),
            _ => Err(DevError::NotSupported),
        }
    }
}
