//! I2C buses and devices.
//!
//! A device is identified by its 7- or 10-bit address. Host transfers are framed as
//! `START addr(W) [reg] [START addr(R)] data STOP`, the register address being sent only when
//! the descriptor position is not negative. A follower device answers at its own address and
//! keeps the bus; received bytes collect in its RX FIFO.
use alloc::sync::Arc;

use crate::{
    bus::{Bus, BusConfig, BusProtocol, FRAME_MAX, Received, Role, Target},
    dev::{Device, DeviceClass, EventKind, Handle, Position, Registry},
    error::{DevError, DevResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressBits {
    #[default]
    Seven,
    Ten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cAddress {
    pub addr: u16,
    pub bits: AddressBits,
}

impl I2cAddress {
    pub const fn seven(addr: u16) -> I2cAddress {
        I2cAddress {
            addr,
            bits: AddressBits::Seven,
        }
    }

    pub const fn ten(addr: u16) -> I2cAddress {
        I2cAddress {
            addr,
            bits: AddressBits::Ten,
        }
    }

    /// Address phase as sent on the wire, direction bit included.
    ///
    /// A 10-bit address takes two bytes: `11110 A9 A8 R/W` followed by `A7..A0`.
    pub const fn header(&self, read: bool) -> u16 {
        let rw = read as u16;
        match self.bits {
            AddressBits::Seven => ((self.addr & 0x7F) << 1) | rw,
            AddressBits::Ten => ((0xF0 | ((self.addr >> 7) & 0x06) | rw) << 8) | (self.addr & 0xFF),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq)]
pub struct I2cConfig {
    pub baud_rate: u32,
    pub role: Role,
    /// Width of the register address sent ahead of a transfer.
    pub reg_bits: u8,
}

impl I2cConfig {
    pub const DEFAULT: I2cConfig = I2cConfig {
        baud_rate: 100_000,
        role: Role::Host,
        reg_bits: 8,
    };
}

impl Default for I2cConfig {
    fn default() -> Self {
        I2cConfig::DEFAULT
    }
}

impl PartialEq for I2cConfig {
    fn eq(&self, other: &Self) -> bool {
        self.baud_rate == other.baud_rate && self.role == other.role
    }
}

impl BusConfig for I2cConfig {
    fn role(&self) -> Role {
        self.role
    }

    fn disabled() -> Self {
        I2cConfig {
            baud_rate: 0,
            role: Role::Host,
            reg_bits: 0,
        }
    }
}

pub trait I2cDriver: Send + Sync {
    /// Apply `config`. `own` is the address to answer at when acting as follower.
    fn configure(&self, config: &I2cConfig, own: Option<I2cAddress>) -> DevResult<()>;
    fn start(&self) -> DevResult<()>;
    fn send_address(&self, addr: I2cAddress, read: bool) -> DevResult<()>;
    fn stop(&self) -> DevResult<()>;
    /// Clock in one byte, acknowledging it when `ack` is set.
    fn read_byte(&self, ack: bool) -> DevResult<u8>;
    fn write_byte(&self, byte: u8) -> DevResult<()>;
    /// Byte latched by the receive interrupt.
    fn receive(&self) -> DevResult<u8>;
}

pub struct I2c<D: I2cDriver>(pub D);

pub type I2cBus<D> = Bus<I2c<D>>;

impl<D: I2cDriver + 'static> I2c<D> {
    pub fn register_bus(registry: &Registry, path: &str, driver: D) -> DevResult<(Handle<Device>, Arc<I2cBus<D>>)> {
        Bus::register(registry, path, DeviceClass::I2c, I2c(driver), I2cConfig::DEFAULT)
    }
}

impl<D: I2cDriver> I2c<D> {
    fn begin(&self, addr: I2cAddress, read: bool) -> DevResult<()> {
        self.0.start()?;
        self.0.send_address(addr, read)
    }

    fn send_register(&self, config: &I2cConfig, pos: Position) -> DevResult<()> {
        let bytes = (pos as u32).to_le_bytes();
        let len = usize::from(config.reg_bits / 8).min(bytes.len());
        bytes[..len].iter().try_for_each(|byte| self.0.write_byte(*byte))
    }

    fn read_bytes(&self, buf: &mut [u8]) -> DevResult<usize> {
        let last = buf.len().saturating_sub(1);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.0.read_byte(i != last)?;
        }
        Ok(buf.len())
    }

    fn write_bytes(&self, buf: &[u8]) -> DevResult<usize> {
        buf.iter().try_for_each(|byte| self.0.write_byte(*byte))?;
        Ok(buf.len())
    }

    /// Run `transfer` and send STOP whatever its outcome.
    fn stopped(&self, transfer: impl FnOnce() -> DevResult<usize>) -> DevResult<usize> {
        let result = transfer();
        let stop = self.0.stop();
        let size = result?;
        stop?;
        Ok(size)
    }
}

impl<D: I2cDriver + 'static> BusProtocol for I2c<D> {
    type Config = I2cConfig;
    type Channel = I2cAddress;

    fn configure(&self, config: &I2cConfig, channel: Option<I2cAddress>) -> DevResult<()> {
        let own = if config.is_follower() { channel } else { None };
        self.0.configure(config, own)
    }

    fn read(&self, channel: I2cAddress, config: &I2cConfig, pos: Position, buf: &mut [u8]) -> DevResult<usize> {
        if config.is_follower() {
            return self.read_bytes(buf);
        }
        self.stopped(|| {
            if pos >= 0 {
                self.begin(channel, false)?;
                self.send_register(config, pos)?;
            }
            self.begin(channel, true)?;
            self.read_bytes(buf)
        })
    }

    fn write(&self, channel: I2cAddress, config: &I2cConfig, pos: Position, buf: &[u8]) -> DevResult<usize> {
        if config.is_follower() {
            return self.write_bytes(buf);
        }
        self.stopped(|| {
            self.begin(channel, false)?;
            if pos >= 0 {
                self.send_register(config, pos)?;
            }
            self.write_bytes(buf)
        })
    }

    fn receive(
        &self,
        event: EventKind,
        _payload: &[u8],
        _owner: Option<I2cAddress>,
        _config: &I2cConfig,
        frame: &mut [u8; FRAME_MAX],
    ) -> DevResult<Option<Received<I2cAddress>>> {
        if event != EventKind::Read {
            return Err(DevError::NotSupported);
        }
        frame[0] = self.0.receive()?;
        Ok(Some(Received {
            target: Target::Owner,
            len: 1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use alloc::{collections::VecDeque, vec::Vec};

    use spin::Mutex;

    use super::*;
    use crate::dev::{Command, IoctlArg, OpenFlags};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Cond {
        Configure(u32, Option<u16>),
        Start,
        Addr(u16, bool),
        Stop,
        Rd(bool),
        Wr(u8),
    }

    #[derive(Default)]
    struct Controller {
        conds: Mutex<Vec<Cond>>,
        incoming: Mutex<VecDeque<u8>>,
        nak_address: Mutex<Option<u16>>,
    }

    impl Controller {
        fn take(&self) -> Vec<Cond> {
            core::mem::take(&mut *self.conds.lock())
        }
    }

    impl I2cDriver for Arc<Controller> {
        fn configure(&self, config: &I2cConfig, own: Option<I2cAddress>) -> DevResult<()> {
            self.conds
                .lock()
                .push(Cond::Configure(config.baud_rate, own.map(|own| own.addr)));
            Ok(())
        }

        fn start(&self) -> DevResult<()> {
            self.conds.lock().push(Cond::Start);
            Ok(())
        }

        fn send_address(&self, addr: I2cAddress, read: bool) -> DevResult<()> {
            self.conds.lock().push(Cond::Addr(addr.addr, read));
            if *self.nak_address.lock() == Some(addr.addr) {
                return Err(DevError::Io);
            }
            Ok(())
        }

        fn stop(&self) -> DevResult<()> {
            self.conds.lock().push(Cond::Stop);
            Ok(())
        }

        fn read_byte(&self, ack: bool) -> DevResult<u8> {
            self.conds.lock().push(Cond::Rd(ack));
            Ok(self.incoming.lock().pop_front().unwrap_or(0xFF))
        }

        fn write_byte(&self, byte: u8) -> DevResult<()> {
            self.conds.lock().push(Cond::Wr(byte));
            Ok(())
        }

        fn receive(&self) -> DevResult<u8> {
            Ok(self.incoming.lock().pop_front().unwrap_or(0))
        }
    }

    fn fixture() -> (Registry, Arc<Controller>, Handle<Device>, Arc<I2cBus<Arc<Controller>>>) {
        let registry = Registry::new();
        let ctl = Arc::new(Controller::default());
        let (bus_dev, bus) = I2c::register_bus(&registry, "/i2c1", ctl.clone()).unwrap();
        (registry, ctl, bus_dev, bus)
    }

    #[test]
    fn address_headers() {
        assert_eq!(I2cAddress::seven(0x50).header(false), 0xA0);
        assert_eq!(I2cAddress::seven(0x50).header(true), 0xA1);
        assert_eq!(I2cAddress::ten(0x3FF).header(false), 0xF6FF);
        assert_eq!(I2cAddress::ten(0x123).header(true), 0xF323);
    }

    #[test]
    fn register_read_uses_repeated_start() {
        let (registry, ctl, _, bus) = fixture();
        bus.register_device(&registry, "eeprom", I2cAddress::seven(0x50), I2cConfig::DEFAULT, 0)
            .unwrap();
        let desc = registry.open("/i2c1/eeprom", OpenFlags::RDWR).unwrap();
        registry.ioctl(desc, Command::SetPosition, IoctlArg::Int(0x10)).unwrap();
        assert_eq!(ctl.take(), [Cond::Configure(100_000, None)]);

        ctl.incoming.lock().extend([0xDE, 0xAD]);
        let mut buf = [0u8; 2];
        assert_eq!(registry.read(desc, &mut buf), Ok(2));
        assert_eq!(buf, [0xDE, 0xAD]);
        assert_eq!(
            ctl.take(),
            [
                Cond::Start,
                Cond::Addr(0x50, false),
                Cond::Wr(0x10),
                Cond::Start,
                Cond::Addr(0x50, true),
                Cond::Rd(true),
                Cond::Rd(false),
                Cond::Stop,
            ]
        );

        assert_eq!(registry.write(desc, &[1, 2]), Ok(2));
        assert_eq!(
            ctl.take(),
            [
                Cond::Start,
                Cond::Addr(0x50, false),
                Cond::Wr(0x10),
                Cond::Wr(1),
                Cond::Wr(2),
                Cond::Stop,
            ]
        );
    }

    #[test]
    fn plain_transfers_and_nak() {
        let (registry, ctl, _, bus) = fixture();
        let fast = I2cConfig {
            baud_rate: 400_000,
            ..I2cConfig::DEFAULT
        };
        bus.register_device(&registry, "sensor", I2cAddress::seven(0x1D), fast, 0)
            .unwrap();
        let desc = registry.open("/i2c1/sensor", OpenFlags::RDWR).unwrap();
        ctl.take();

        let mut buf = [0u8; 1];
        ctl.incoming.lock().push_back(0x42);
        assert_eq!(registry.read(desc, &mut buf), Ok(1));
        assert_eq!(
            ctl.take(),
            [
                Cond::Configure(400_000, None),
                Cond::Start,
                Cond::Addr(0x1D, true),
                Cond::Rd(false),
                Cond::Stop,
            ]
        );

        // A missing device still gets its STOP, and the bus is free afterwards.
        *ctl.nak_address.lock() = Some(0x1D);
        assert_eq!(registry.write(desc, &[7]), Err(DevError::Io));
        assert_eq!(ctl.take(), [Cond::Start, Cond::Addr(0x1D, false), Cond::Stop]);
        assert!(!bus.is_held());
    }

    #[test]
    fn follower_buffers_received_bytes() {
        let (registry, ctl, bus_dev, bus) = fixture();
        let follower = I2cConfig {
            role: Role::Follower,
            ..I2cConfig::DEFAULT
        };
        bus.register_device(&registry, "peer", I2cAddress::seven(0x33), follower, 4)
            .unwrap();
        let host = bus
            .register_device(&registry, "host", I2cAddress::seven(0x34), I2cConfig::DEFAULT, 0)
            .unwrap();
        let peer = registry.open("/i2c1/peer", OpenFlags::RDWR).unwrap();
        assert_eq!(
            ctl.take(),
            [Cond::Configure(100_000, None), Cond::Configure(100_000, Some(0x33))]
        );

        let other = registry.open("/i2c1/host", OpenFlags::RDWR).unwrap();
        assert_eq!(host.ref_count(), 1);
        assert_eq!(registry.write(other, &[0]), Err(DevError::Busy));

        ctl.incoming.lock().extend([1, 2, 3, 4, 5]);
        for _ in 0..5 {
            registry.deliver_event(&bus_dev, EventKind::Read, &[]).unwrap();
        }
        let mut buf = [0u8; 8];
        // The FIFO keeps the latest four.
        assert_eq!(registry.read(peer, &mut buf), Ok(4));
        assert_eq!(buf[..4], [2, 3, 4, 5]);

        assert_eq!(registry.write(peer, &[9]), Ok(1));
        assert_eq!(ctl.take(), [Cond::Wr(9)]);

        registry.close(peer).unwrap();
        assert!(!bus.is_held());
        assert_eq!(registry.write(other, &[0]), Ok(1));
    }
}
