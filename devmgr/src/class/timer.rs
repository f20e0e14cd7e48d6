//! Hardware timers.
//!
//! Writing a little-endian `u32` timeout in microseconds (re)starts the timer; when several are
//! written only the last one counts. Reading returns the microseconds elapsed in the current
//! cycle. Each expiry is reported to read callbacks; a one-shot timer then stops.
//!
//! The counter ticks at 1 MHz. A timeout longer than the period register can hold is split into
//! `reload` equal hardware periods and only the last of them is reported.
use crate::{
    class::WORD_SIZE,
    dev::{
        Capability, Command, Device, DeviceClass, DeviceOps, EventKind, Handle, IoctlArg, Outcome,
        Position, Registry, Transfer,
    },
    error::{DevError, DevResult},
    sync::IrqSpinLock,
};

/// Counter rate the prescaler is set up for.
pub const TICK_HZ: u32 = 1_000_000;

/// Timer limits of the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerInfo {
    /// Timer input clock in Hz.
    pub clk: u32,
    pub prescaler_max: u32,
    pub period_max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerMode {
    /// Restart after every expiry.
    #[default]
    Period,
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerConfig {
    pub mode: TimerMode,
}

pub trait TimerDriver: Send + Sync {
    /// Power the timer up or down.
    fn configure(&self, enable: bool) -> DevResult<()>;
    fn start(&self, prescaler: u32, period: u32) -> DevResult<()>;
    fn stop(&self) -> DevResult<()>;
    /// Ticks counted in the current hardware period.
    fn count(&self) -> DevResult<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Schedule {
    mode: TimerMode,
    prescaler: u32,
    /// Ticks per hardware period.
    period: u32,
    /// Hardware periods per timeout, `0` while stopped.
    reload: u32,
    /// Hardware periods left in the current timeout.
    remaining: u32,
}

impl Schedule {
    fn plan(&mut self, info: &TimerInfo, timeout: u32) -> DevResult<()> {
        if info.clk == 0 {
            return Err(DevError::Io);
        }
        let prescaler = info.clk / TICK_HZ;
        if timeout == 0 || prescaler == 0 || prescaler > info.prescaler_max || info.period_max == 0 {
            return Err(DevError::InvalidArgument);
        }
        let reload = timeout.div_ceil(info.period_max);
        self.prescaler = prescaler;
        self.period = timeout / reload;
        self.reload = reload;
        self.remaining = reload;
        Ok(())
    }

    fn elapsed(&self, ticks: u32) -> u32 {
        (self.reload - self.remaining) * self.period + ticks
    }
}

pub struct Timer<D: TimerDriver> {
    driver: D,
    info: TimerInfo,
    schedule: IrqSpinLock<Schedule>,
}

impl<D: TimerDriver + 'static> Timer<D> {
    pub fn new(driver: D, info: TimerInfo) -> Timer<D> {
        Timer {
            driver,
            info,
            schedule: IrqSpinLock::new(Schedule::default()),
        }
    }

    pub fn register(self, registry: &Registry, path: &str) -> DevResult<Handle<Device>> {
        registry.register(path, DeviceClass::Timer, Capability::RDWR, self)
    }
}

impl<D: TimerDriver> DeviceOps for Timer<D> {
    fn open(&self, _dev: &Device) -> DevResult<()> {
        self.driver.configure(true)
    }

    fn close(&self, _dev: &Device) -> DevResult<()> {
        let _ = self.driver.stop();
        {
            let mut schedule = self.schedule.lock();
            schedule.reload = 0;
            schedule.remaining = 0;
        }
        self.driver.configure(false)
    }

    fn read(&self, _dev: &Device, _pos: Position, buf: &mut [u8], _mode: Transfer) -> DevResult<usize> {
        let mut count = 0;
        for elapsed in buf.chunks_exact_mut(WORD_SIZE) {
            let ticks = match self.driver.count() {
                Ok(ticks) => ticks,
                Err(err) if count == 0 => return Err(err),
                Err(_) => break,
            };
            let value = self.schedule.lock().elapsed(ticks);
            elapsed.copy_from_slice(&value.to_le_bytes());
            count += WORD_SIZE;
        }
        Ok(count)
    }

    fn write(&self, _dev: &Device, _pos: Position, buf: &[u8], _mode: Transfer) -> DevResult<usize> {
        let Some(last) = buf.chunks_exact(WORD_SIZE).last() else {
            return Ok(0);
        };
        let timeout = u32::from_le_bytes([last[0], last[1], last[2], last[3]]);
        let written = buf.len() - buf.len() % WORD_SIZE;

        self.driver.stop()?;
        let (prescaler, period) = {
            let mut schedule = self.schedule.lock();
            schedule.plan(&self.info, timeout)?;
            (schedule.prescaler, schedule.period)
        };
        self.driver.start(prescaler, period)?;
        log::trace!("Timer armed for {} us (prescaler {}, period {}).", timeout, prescaler, period);
        Ok(written)
    }

    fn ioctl(&self, _dev: &Device, _pos: Position, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        match cmd {
            Command::SetConfig => {
                let config = *arg.config::<TimerConfig>()?;
                self.schedule.lock().mode = config.mode;
                Ok(size_of::<TimerConfig>())
            }
            Command::GetConfig => arg.store_config(&TimerConfig {
                mode: self.schedule.lock().mode,
            }),
            _ => Err(DevError::NotSupported),
        }
    }

    fn isr(&self, _dev: &Device, event: EventKind, _payload: &[u8]) -> DevResult<Outcome> {
        if event != EventKind::Read {
            return Err(DevError::NotSupported);
        }
        let one_shot = {
            let mut schedule = self.schedule.lock();
            if schedule.reload == 0 {
                return Ok(Outcome::None);
            }
            schedule.remaining = schedule.remaining.saturating_sub(1);
            if schedule.remaining > 0 {
                return Ok(Outcome::None);
            }
            schedule.remaining = schedule.reload;
            let one_shot = schedule.mode == TimerMode::OneShot;
            if one_shot {
                schedule.reload = 0;
                schedule.remaining = 0;
            }
            one_shot
        };
        if one_shot {
            self.driver.stop()?;
        }
        Ok(Outcome::ReadReady(WORD_SIZE))
    }
}
