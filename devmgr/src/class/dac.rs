//! Digital-to-analog converters.
//!
//! The descriptor position selects the channel. Writes take little-endian `u32` output values;
//! only whole values are written, and the channel must have been enabled through `SetConfig`.
use crate::{
    class::{ChannelSet, WORD_SIZE, channel_of},
    dev::{
        Capability, Command, Device, DeviceClass, DeviceOps, Handle, IoctlArg, Position, Registry,
        Transfer,
    },
    error::{DevError, DevResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DacConfig {
    pub enabled: bool,
}

pub trait DacDriver: Send + Sync {
    /// Power the converter up or down.
    fn configure(&self, enable: bool) -> DevResult<()>;
    fn channel_configure(&self, channel: usize, enable: bool) -> DevResult<()>;
    fn write(&self, channel: usize, value: u32) -> DevResult<()>;
}

pub struct Dac<D: DacDriver> {
    driver: D,
    channels: ChannelSet,
}

impl<D: DacDriver + 'static> Dac<D> {
    pub fn new(driver: D) -> Dac<D> {
        Dac {
            driver,
            channels: ChannelSet::default(),
        }
    }

    pub fn register(self, registry: &Registry, path: &str) -> DevResult<Handle<Device>> {
        registry.register(path, DeviceClass::Dac, Capability::WRITE, self)
    }
}

impl<D: DacDriver> DeviceOps for Dac<D> {
    fn open(&self, _dev: &Device) -> DevResult<()> {
        self.driver.configure(true)
    }

    fn close(&self, _dev: &Device) -> DevResult<()> {
        for channel in self.channels.take() {
            let _ = self.driver.channel_configure(channel, false);
        }
        self.driver.configure(false)
    }

    fn write(&self, _dev: &Device, pos: Position, buf: &[u8], _mode: Transfer) -> DevResult<usize> {
        let channel = channel_of(pos)?;
        if !self.channels.contains(channel) {
            return Err(DevError::InvalidArgument);
        }
        let mut count = 0;
        for value in buf.chunks_exact(WORD_SIZE) {
            let value = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
            self.driver.write(channel, value)?;
            count += WORD_SIZE;
        }
        Ok(count)
    }

    fn ioctl(&self, _dev: &Device, pos: Position, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        let channel = channel_of(pos)?;
        match cmd {
            Command::SetConfig => {
                let config = *arg.config::<DacConfig>()?;
                self.driver.channel_configure(channel, config.enabled)?;
                self.channels.set(channel, config.enabled);
                Ok(size_of::<DacConfig>())
            }
            Command::GetConfig => arg.store_config(&DacConfig {
                enabled: self.channels.contains(channel),
            }),
            _ => Err(DevError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec::Vec};

    use spin::Mutex;

    use super::*;
    use crate::dev::OpenFlags;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Power(bool),
        Channel(usize, bool),
        Out(usize, u32),
    }

    #[derive(Default)]
    struct Converter {
        calls: Mutex<Vec<Call>>,
    }

    impl DacDriver for Arc<Converter> {
        fn configure(&self, enable: bool) -> DevResult<()> {
            self.calls.lock().push(Call::Power(enable));
            Ok(())
        }

        fn channel_configure(&self, channel: usize, enable: bool) -> DevResult<()> {
            self.calls.lock().push(Call::Channel(channel, enable));
            Ok(())
        }

        fn write(&self, channel: usize, value: u32) -> DevResult<()> {
            self.calls.lock().push(Call::Out(channel, value));
            Ok(())
        }
    }

    #[test]
    fn writes_whole_values_to_enabled_channels() {
        let registry = Registry::new();
        let dac = Arc::new(Converter::default());
        Dac::new(dac.clone()).register(&registry, "/dac1").unwrap();
        assert_eq!(registry.open("/dac1", OpenFlags::READ), Err(DevError::NotSupported));

        let desc = registry.open("/dac1", OpenFlags::WRITE).unwrap();
        registry.ioctl(desc, Command::SetPosition, IoctlArg::Int(1)).unwrap();
        assert_eq!(registry.write(desc, &7u32.to_le_bytes()), Err(DevError::InvalidArgument));

        registry
            .ioctl(desc, Command::SetConfig, IoctlArg::Config(&DacConfig { enabled: true }))
            .unwrap();
        let mut config = DacConfig::default();
        registry
            .ioctl(desc, Command::GetConfig, IoctlArg::ConfigOut(&mut config))
            .unwrap();
        assert!(config.enabled);

        let mut buf = Vec::new();
        buf.extend_from_slice(&0x0800u32.to_le_bytes());
        buf.extend_from_slice(&0x0fffu32.to_le_bytes());
        buf.push(0xaa);
        assert_eq!(registry.write(desc, &buf), Ok(8));

        registry.close(desc).unwrap();
        assert_eq!(
            *dac.calls.lock(),
            [
                Call::Power(true),
                Call::Channel(1, true),
                Call::Out(1, 0x0800),
                Call::Out(1, 0x0fff),
                Call::Channel(1, false),
                Call::Power(false),
            ]
        );
    }
}
