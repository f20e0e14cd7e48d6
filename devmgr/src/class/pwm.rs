//! Pulse-width modulation outputs.
//!
//! One timer drives every channel, so the frequency is shared and set with [PWM_SET_FREQ]. The
//! descriptor position selects the channel. Reads and writes move duty cycles as little-endian
//! `u32` parts per million of the period. Changing the frequency keeps the duty cycle of every
//! enabled channel.
use crate::{
    class::{ChannelSet, WORD_SIZE, channel_of},
    dev::{
        Capability, Command, Device, DeviceClass, DeviceOps, Handle, IoctlArg, Position, Registry,
        Transfer,
    },
    error::{DevError, DevResult},
    sync::IrqSpinLock,
};

/// Set the output frequency in Hz, as [IoctlArg::Int].
pub const PWM_SET_FREQ: u32 = 0x01;
/// Read back the frequency actually produced, into [IoctlArg::IntOut].
pub const PWM_GET_FREQ: u32 = 0x02;

/// Duty cycle of an always-on output.
pub const DUTY_FULL: u32 = 1_000_000;

/// Timer limits of the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmInfo {
    /// Timer input clock in Hz.
    pub clk: u32,
    pub prescaler_max: u32,
    pub period_max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    /// Output high while the counter is below the compare value.
    #[default]
    Normal,
    Inverted,
}

/// Per-channel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PwmConfig {
    pub enabled: bool,
    pub polarity: Polarity,
}

pub trait PwmDriver: Send + Sync {
    /// Power the timer up or down.
    fn configure(&self, enable: bool) -> DevResult<()>;
    fn channel_configure(&self, channel: usize, enable: bool, polarity: Polarity) -> DevResult<()>;
    /// (Re)start the counter with the given prescaler and period.
    fn start(&self, prescaler: u32, period: u32) -> DevResult<()>;
    /// Compare value of `channel`.
    fn read(&self, channel: usize) -> DevResult<u32>;
    fn write(&self, channel: usize, compare: u32) -> DevResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timing {
    /// Produced frequency, `0` before the first [PWM_SET_FREQ].
    freq: u32,
    prescaler: u32,
    period: u32,
}

impl Timing {
    const STOPPED: Timing = Timing {
        freq: 0,
        prescaler: 0,
        period: 1,
    };

    /// Prescaler and period producing the frequency closest to `freq`.
    fn for_frequency(info: &PwmInfo, freq: u32) -> DevResult<Timing> {
        if info.clk == 0 || freq == 0 || info.prescaler_max == 0 || info.period_max == 0 {
            return Err(DevError::InvalidArgument);
        }
        let product = info.clk / freq;
        let (prescaler, period) = if product <= info.period_max {
            (1, product.max(1))
        } else {
            let mut best = (1, info.period_max);
            let mut error_min = u32::MAX;
            let first = (product / info.period_max).clamp(1, info.prescaler_max);
            for prescaler in first..=info.prescaler_max {
                let period = (product / prescaler).clamp(1, info.period_max);
                let error = (info.clk / prescaler / period).abs_diff(freq);
                if error < error_min {
                    error_min = error;
                    best = (prescaler, period);
                }
                if error == 0 {
                    break;
                }
            }
            best
        };
        Ok(Timing {
            freq: info.clk / prescaler / period,
            prescaler,
            period,
        })
    }

    fn compare(&self, duty: u32) -> u32 {
        let compare = u64::from(duty) * u64::from(self.period) / u64::from(DUTY_FULL);
        compare.min(u64::from(self.period)) as u32
    }

    fn duty(&self, compare: u32) -> u32 {
        (u64::from(compare) * u64::from(DUTY_FULL) / u64::from(self.period)) as u32
    }
}

pub struct Pwm<D: PwmDriver> {
    driver: D,
    info: PwmInfo,
    channels: ChannelSet,
    inverted: ChannelSet,
    timing: IrqSpinLock<Timing>,
}

impl<D: PwmDriver + 'static> Pwm<D> {
    pub fn new(driver: D, info: PwmInfo) -> Pwm<D> {
        Pwm {
            driver,
            info,
            channels: ChannelSet::default(),
            inverted: ChannelSet::default(),
            timing: IrqSpinLock::new(Timing::STOPPED),
        }
    }

    pub fn register(self, registry: &Registry, path: &str) -> DevResult<Handle<Device>> {
        registry.register(path, DeviceClass::Pwm, Capability::RDWR, self)
    }
}

impl<D: PwmDriver> Pwm<D> {
    fn enabled_channel(&self, pos: Position) -> DevResult<usize> {
        let channel = channel_of(pos)?;
        if !self.channels.contains(channel) {
            return Err(DevError::InvalidArgument);
        }
        Ok(channel)
    }

    fn set_frequency(&self, freq: u32) -> DevResult<()> {
        let new = Timing::for_frequency(&self.info, freq)?;
        let old = *self.timing.lock();
        self.driver.start(new.prescaler, new.period)?;
        if old.freq != 0 {
            for channel in self.channels.iter() {
                let compare = self.driver.read(channel)?;
                let rescaled = u64::from(compare) * u64::from(new.period) / u64::from(old.period);
                self.driver.write(channel, rescaled.min(u64::from(new.period)) as u32)?;
            }
        }
        *self.timing.lock() = new;
        log::debug!("PWM running at {} Hz (prescaler {}, period {}).", new.freq, new.prescaler, new.period);
        Ok(())
    }
}

impl<D: PwmDriver> DeviceOps for Pwm<D> {
    fn open(&self, _dev: &Device) -> DevResult<()> {
        self.driver.configure(true)
    }

    fn close(&self, _dev: &Device) -> DevResult<()> {
        for channel in self.channels.take() {
            let _ = self.driver.channel_configure(channel, false, Polarity::Normal);
        }
        self.inverted.clear();
        self.driver.configure(false)
    }

    fn read(&self, _dev: &Device, pos: Position, buf: &mut [u8], _mode: Transfer) -> DevResult<usize> {
        let channel = self.enabled_channel(pos)?;
        let timing = *self.timing.lock();
        let mut count = 0;
        for duty in buf.chunks_exact_mut(WORD_SIZE) {
            let compare = self.driver.read(channel)?;
            duty.copy_from_slice(&timing.duty(compare).to_le_bytes());
            count += WORD_SIZE;
        }
        Ok(count)
    }

    fn write(&self, _dev: &Device, pos: Position, buf: &[u8], _mode: Transfer) -> DevResult<usize> {
        let channel = self.enabled_channel(pos)?;
        let timing = *self.timing.lock();
        let mut count = 0;
        for duty in buf.chunks_exact(WORD_SIZE) {
            let duty = u32::from_le_bytes([duty[0], duty[1], duty[2], duty[3]]);
            self.driver.write(channel, timing.compare(duty))?;
            count += WORD_SIZE;
        }
        Ok(count)
    }

    fn ioctl(&self, _dev: &Device, pos: Position, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        match cmd {
            Command::SetConfig => {
                let channel = channel_of(pos)?;
                let config = *arg.config::<PwmConfig>()?;
                self.driver
                    .channel_configure(channel, config.enabled, config.polarity)?;
                self.channels.set(channel, config.enabled);
                self.inverted
                    .set(channel, config.enabled && config.polarity == Polarity::Inverted);
                Ok(size_of::<PwmConfig>())
            }
            Command::GetConfig => {
                let channel = channel_of(pos)?;
                let polarity = if self.inverted.contains(channel) {
                    Polarity::Inverted
                } else {
                    Polarity::Normal
                };
                arg.store_config(&PwmConfig {
                    enabled: self.channels.contains(channel),
                    polarity,
                })
            }
            Command::Driver(PWM_SET_FREQ) => {
                let freq = u32::try_from(arg.int()?).map_err(|_| DevError::InvalidArgument)?;
                self.set_frequency(freq)?;
                Ok(size_of::<u32>())
            }
            Command::Driver(PWM_GET_FREQ) => arg.store_int(self.timing.lock().freq as i32),
            _ => Err(DevError::NotSupported),
        }
    }
}
