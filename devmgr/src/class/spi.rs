//! SPI buses and devices.
//!
//! Each device is selected by its own chip-select pin. A host device asserts its CS line
//! around every transfer and, when the descriptor position is not negative, sends it as a
//! register address before the data. A follower device holds the bus for as long as it is a
//! follower; words received while its CS line is active collect in its RX FIFO.
//!
//! ```ignore
//! let (_, spi1) = Spi::register_bus(&registry, "/spi1", driver)?;
//! spi1.register_device(&registry, "flash", SpiChannel::low(4), SpiConfig::DEFAULT, config::SPI_RD_BUFSZ)?;
//! let flash = registry.open("/spi1/flash", OpenFlags::RDWR)?;
//! ```
use alloc::sync::Arc;

use crate::{
    bus::{Bus, BusConfig, BusProtocol, FRAME_MAX, Received, Role, Target},
    class::{BitOrder, pin::PinMode},
    dev::{Device, DeviceClass, EventKind, Handle, IoctlArg, Position, Registry},
    error::{DevError, DevResult},
};

/// Driver command: full-duplex exchange, argument [IoctlArg::Exchange].
pub const SPI_TRANSFER: u32 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpiMode {
    /// CPOL 0, CPHA 0.
    #[default]
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    #[default]
    Eight,
    Sixteen,
    ThirtyTwo,
}

impl DataBits {
    /// Bytes per word.
    pub const fn width(self) -> usize {
        match self {
            DataBits::Eight => 1,
            DataBits::Sixteen => 2,
            DataBits::ThirtyTwo => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq)]
pub struct SpiConfig {
    pub baud_rate: u32,
    pub role: Role,
    pub mode: SpiMode,
    pub data_bits: DataBits,
    pub bit_order: BitOrder,
    /// Width of the register address sent ahead of a transfer.
    pub reg_bits: u8,
}

impl SpiConfig {
    pub const DEFAULT: SpiConfig = SpiConfig {
        baud_rate: 3_000_000,
        role: Role::Host,
        mode: SpiMode::Mode0,
        data_bits: DataBits::Eight,
        bit_order: BitOrder::Msb,
        reg_bits: 8,
    };
}

impl Default for SpiConfig {
    fn default() -> Self {
        SpiConfig::DEFAULT
    }
}

/// Compares the fields programmed into the controller. `reg_bits` only shapes transfers.
impl PartialEq for SpiConfig {
    fn eq(&self, other: &Self) -> bool {
        self.baud_rate == other.baud_rate
            && self.role == other.role
            && self.mode == other.mode
            && self.data_bits == other.data_bits
            && self.bit_order == other.bit_order
    }
}

impl BusConfig for SpiConfig {
    fn role(&self) -> Role {
        self.role
    }

    fn disabled() -> Self {
        SpiConfig {
            baud_rate: 0,
            ..SpiConfig::DEFAULT
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsActive {
    #[default]
    Low,
    High,
    /// No CS line, or one driven by the hardware.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiChannel {
    pub cs_pin: usize,
    pub cs_active: CsActive,
}

impl SpiChannel {
    pub const fn low(cs_pin: usize) -> SpiChannel {
        SpiChannel {
            cs_pin,
            cs_active: CsActive::Low,
        }
    }

    pub const fn high(cs_pin: usize) -> SpiChannel {
        SpiChannel {
            cs_pin,
            cs_active: CsActive::High,
        }
    }
}

pub trait SpiDriver: Send + Sync {
    fn configure(&self, config: &SpiConfig) -> DevResult<()>;
    /// Shift one word out and return the word shifted in.
    fn exchange(&self, word: u32) -> DevResult<u32>;
    /// Word latched by the receive interrupt.
    fn receive(&self) -> DevResult<u32>;
    fn cs_configure(&self, pin: usize, mode: PinMode) -> DevResult<()>;
    fn cs_write(&self, pin: usize, high: bool) -> DevResult<()>;
    fn cs_read(&self, pin: usize) -> DevResult<bool>;
}

pub struct Spi<D: SpiDriver>(pub D);

pub type SpiBus<D> = Bus<Spi<D>>;

impl<D: SpiDriver + 'static> Spi<D> {
    pub fn register_bus(registry: &Registry, path: &str, driver: D) -> DevResult<(Handle<Device>, Arc<SpiBus<D>>)> {
        Bus::register(registry, path, DeviceClass::Spi, Spi(driver), SpiConfig::DEFAULT)
    }
}

impl<D: SpiDriver> Spi<D> {
    /// Drive the CS line of `channel` to its active or idle level.
    fn select(&self, channel: SpiChannel, active: bool) -> DevResult<()> {
        match channel.cs_active {
            CsActive::None => Ok(()),
            CsActive::Low => self.0.cs_write(channel.cs_pin, !active),
            CsActive::High => self.0.cs_write(channel.cs_pin, active),
        }
    }

    /// Run `transfer` with the CS line asserted when acting as host.
    fn framed(
        &self,
        channel: SpiChannel,
        config: &SpiConfig,
        transfer: impl FnOnce() -> DevResult<usize>,
    ) -> DevResult<usize> {
        if config.is_follower() {
            return transfer();
        }
        self.select(channel, true)?;
        let result = transfer();
        let deselect = self.select(channel, false);
        let size = result?;
        deselect?;
        Ok(size)
    }

    fn send_register(&self, config: &SpiConfig, pos: Position) -> DevResult<()> {
        if pos < 0 || config.is_follower() {
            return Ok(());
        }
        let bytes = (pos as u32).to_le_bytes();
        let len = usize::from(config.reg_bits / 8).min(bytes.len());
        self.shift_out(config.data_bits.width(), &bytes[..len])?;
        Ok(())
    }

    fn shift_in(&self, width: usize, buf: &mut [u8]) -> DevResult<usize> {
        let mut count = 0;
        for word in buf.chunks_exact_mut(width) {
            let value = self.0.exchange(0)?;
            word.copy_from_slice(&value.to_le_bytes()[..width]);
            count += width;
        }
        Ok(count)
    }

    fn shift_out(&self, width: usize, buf: &[u8]) -> DevResult<usize> {
        let mut count = 0;
        for word in buf.chunks_exact(width) {
            let mut raw = [0u8; 4];
            raw[..width].copy_from_slice(word);
            self.0.exchange(u32::from_le_bytes(raw))?;
            count += width;
        }
        Ok(count)
    }

    fn shift_both(&self, width: usize, rd: &mut [u8], wr: &[u8]) -> DevResult<usize> {
        let mut count = 0;
        for (inbound, outbound) in rd.chunks_exact_mut(width).zip(wr.chunks_exact(width)) {
            let mut raw = [0u8; 4];
            raw[..width].copy_from_slice(outbound);
            let value = self.0.exchange(u32::from_le_bytes(raw))?;
            inbound.copy_from_slice(&value.to_le_bytes()[..width]);
            count += width;
        }
        Ok(count)
    }
}

impl<D: SpiDriver + 'static> BusProtocol for Spi<D> {
    type Config = SpiConfig;
    type Channel = SpiChannel;

    fn configure(&self, config: &SpiConfig, _channel: Option<SpiChannel>) -> DevResult<()> {
        self.0.configure(config)
    }

    fn read(&self, channel: SpiChannel, config: &SpiConfig, pos: Position, buf: &mut [u8]) -> DevResult<usize> {
        self.framed(channel, config, || {
            self.send_register(config, pos)?;
            self.shift_in(config.data_bits.width(), buf)
        })
    }

    fn write(&self, channel: SpiChannel, config: &SpiConfig, pos: Position, buf: &[u8]) -> DevResult<usize> {
        self.framed(channel, config, || {
            self.send_register(config, pos)?;
            self.shift_out(config.data_bits.width(), buf)
        })
    }

    fn control(&self, channel: SpiChannel, config: &SpiConfig, code: u32, arg: IoctlArg<'_>) -> DevResult<usize> {
        match (code, arg) {
            (SPI_TRANSFER, IoctlArg::Exchange { rd, wr }) => {
                self.framed(channel, config, || self.shift_both(config.data_bits.width(), rd, wr))
            }
            (SPI_TRANSFER, _) => Err(DevError::InvalidArgument),
            _ => Err(DevError::NotSupported),
        }
    }

    fn receive(
        &self,
        event: EventKind,
        _payload: &[u8],
        owner: Option<SpiChannel>,
        config: &SpiConfig,
        frame: &mut [u8; FRAME_MAX],
    ) -> DevResult<Option<Received<SpiChannel>>> {
        if event != EventKind::Read {
            return Err(DevError::NotSupported);
        }
        let word = self.0.receive()?;
        // Data clocked in while this device was not selected belongs to someone else.
        if let Some(channel) = owner {
            let selected = match channel.cs_active {
                CsActive::None => true,
                CsActive::Low => !self.0.cs_read(channel.cs_pin)?,
                CsActive::High => self.0.cs_read(channel.cs_pin)?,
            };
            if !selected {
                return Ok(None);
            }
        }
        let width = config.data_bits.width();
        frame[..width].copy_from_slice(&word.to_le_bytes()[..width]);
        Ok(Some(Received {
            target: Target::Owner,
            len: width,
        }))
    }

    fn attach(&self, channel: SpiChannel, config: &SpiConfig) -> DevResult<()> {
        let mode = match (channel.cs_active, config.role) {
            (CsActive::None, _) => return Ok(()),
            (_, Role::Host) => PinMode::Output,
            (CsActive::Low, Role::Follower) => PinMode::InputPullUp,
            (CsActive::High, Role::Follower) => PinMode::InputPullDown,
        };
        self.0.cs_configure(channel.cs_pin, mode)?;
        if config.role == Role::Host {
            self.select(channel, false)?;
        }
        Ok(())
    }

    fn detach(&self, channel: SpiChannel) -> DevResult<()> {
        if channel.cs_active == CsActive::None {
            return Ok(());
        }
        self.0.cs_configure(channel.cs_pin, PinMode::None)
    }
}
