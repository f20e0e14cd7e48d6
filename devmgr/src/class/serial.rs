//! Serial ports (UART).
//!
//! Received bytes are pushed into an RX FIFO by the receive interrupt and drained by `read`.
//! Without an RX FIFO, `read` polls the hardware. Writes on a non-blocking descriptor are
//! queued into a TX FIFO and fed to the hardware from the transmit interrupt, which reports
//! completion once the FIFO runs dry.
use core::sync::atomic::{AtomicUsize, Ordering};

use utils::ring::RingBuffer;

use crate::{
    class::BitOrder,
    dev::{
        Capability, Command, Device, DeviceClass, DeviceOps, EventKind, Handle, IoctlArg, Outcome,
        Position, Registry, Transfer,
    },
    error::{DevError, DevResult},
    sync::IrqSpinLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub bit_order: BitOrder,
    pub invert: bool,
}

impl SerialConfig {
    /// 115200 baud, 8N1, LSB first.
    pub const DEFAULT: SerialConfig = SerialConfig {
        baud_rate: 115_200,
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::None,
        bit_order: BitOrder::Lsb,
        invert: false,
    };

    /// Applied on close.
    pub const DISABLED: SerialConfig = SerialConfig {
        baud_rate: 0,
        data_bits: 0,
        stop_bits: 0,
        parity: Parity::None,
        bit_order: BitOrder::Lsb,
        invert: false,
    };
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig::DEFAULT
    }
}

pub trait SerialDriver: Send + Sync {
    fn configure(&self, config: &SerialConfig) -> DevResult<()>;
    /// Receive one byte. Polls until one is available or the driver gives up.
    fn read_byte(&self) -> DevResult<u8>;
    fn write_byte(&self, byte: u8) -> DevResult<()>;
    /// Enable the transmit-empty interrupt.
    fn start_tx(&self);
    fn stop_tx(&self);
}

pub struct Serial<D: SerialDriver> {
    driver: D,
    config: IrqSpinLock<SerialConfig>,
    rx: IrqSpinLock<RingBuffer>,
    tx: IrqSpinLock<RingBuffer>,
    rx_bufsz: AtomicUsize,
    tx_bufsz: AtomicUsize,
}

impl<D: SerialDriver + 'static> Serial<D> {
    pub fn new(driver: D) -> Serial<D> {
        Serial::with_buffers(driver, config::SERIAL_RD_BUFSZ, config::SERIAL_WR_BUFSZ)
    }

    /// FIFO sizes take effect on open.
    pub fn with_buffers(driver: D, rx_bufsz: usize, tx_bufsz: usize) -> Serial<D> {
        Serial {
            driver,
            config: IrqSpinLock::new(SerialConfig::DEFAULT),
            rx: IrqSpinLock::new(RingBuffer::default()),
            tx: IrqSpinLock::new(RingBuffer::default()),
            rx_bufsz: AtomicUsize::new(rx_bufsz),
            tx_bufsz: AtomicUsize::new(tx_bufsz),
        }
    }

    pub fn register(self, registry: &Registry, path: &str) -> DevResult<Handle<Device>> {
        registry.register(
            path,
            DeviceClass::Serial,
            Capability::RDWR | Capability::NONBLOCK,
            self,
        )
    }

    fn poll_in(&self, buf: &mut [u8]) -> DevResult<usize> {
        for (count, slot) in buf.iter_mut().enumerate() {
            match self.driver.read_byte() {
                Ok(byte) => *slot = byte,
                Err(err) if count == 0 => return Err(err),
                Err(_) => return Ok(count),
            }
        }
        Ok(buf.len())
    }

    fn poll_out(&self, buf: &[u8]) -> DevResult<usize> {
        for (count, byte) in buf.iter().enumerate() {
            match self.driver.write_byte(*byte) {
                Ok(()) => {}
                Err(err) if count == 0 => return Err(err),
                Err(_) => return Ok(count),
            }
        }
        Ok(buf.len())
    }
}

impl<D: SerialDriver + 'static> DeviceOps for Serial<D> {
    fn open(&self, _dev: &Device) -> DevResult<()> {
        self.rx.lock().init(self.rx_bufsz.load(Ordering::Relaxed));
        self.tx.lock().init(self.tx_bufsz.load(Ordering::Relaxed));
        self.driver.configure(&self.config.lock())
    }

    fn close(&self, _dev: &Device) -> DevResult<()> {
        self.rx.lock().free();
        self.tx.lock().free();
        self.driver.configure(&SerialConfig::DISABLED)
    }

    fn read(&self, _dev: &Device, _pos: Position, buf: &mut [u8], _mode: Transfer) -> DevResult<usize> {
        {
            let mut rx = self.rx.lock();
            if rx.capacity() > 0 {
                return Ok(rx.read(buf));
            }
        }
        self.poll_in(buf)
    }

    fn write(&self, _dev: &Device, _pos: Position, buf: &[u8], mode: Transfer) -> DevResult<usize> {
        if mode == Transfer::Sync {
            return self.poll_out(buf);
        }
        let queued = {
            let mut tx = self.tx.lock();
            // Completion of a non-blocking write is only ever reported by the TX interrupt.
            if tx.capacity() == 0 {
                return Err(DevError::NotSupported);
            }
            tx.write(buf)
        };
        if queued > 0 {
            self.driver.start_tx();
        }
        Ok(queued)
    }

    fn ioctl(&self, _dev: &Device, _pos: Position, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        match cmd {
            Command::SetConfig => {
                let config = *arg.config::<SerialConfig>()?;
                self.driver.configure(&config)?;
                *self.config.lock() = config;
                Ok(size_of::<SerialConfig>())
            }
            Command::GetConfig => arg.store_config(&*self.config.lock()),
            Command::SetReadBufSize => {
                let size = arg.size()?;
                self.rx.lock().init(size);
                self.rx_bufsz.store(size, Ordering::Relaxed);
                Ok(size_of::<usize>())
            }
            Command::SetWriteBufSize => {
                let size = arg.size()?;
                self.tx.lock().init(size);
                self.tx_bufsz.store(size, Ordering::Relaxed);
                Ok(size_of::<usize>())
            }
            Command::GetReadBufSize => arg.store_size(self.rx_bufsz.load(Ordering::Relaxed)),
            Command::GetWriteBufSize => arg.store_size(self.tx_bufsz.load(Ordering::Relaxed)),
            Command::ClearReadBuf => {
                self.rx.lock().reset();
                Ok(0)
            }
            Command::ClearWriteBuf => {
                self.tx.lock().reset();
                Ok(0)
            }
            Command::GetReadDataSize => arg.store_size(self.rx.lock().data_size()),
            Command::GetWriteDataSize => arg.store_size(self.tx.lock().data_size()),
            _ => Err(DevError::NotSupported),
        }
    }

    fn isr(&self, _dev: &Device, event: EventKind, _payload: &[u8]) -> DevResult<Outcome> {
        match event {
            EventKind::Read => {
                let byte = self.driver.read_byte()?;
                let mut rx = self.rx.lock();
                if rx.capacity() == 0 {
                    return Ok(Outcome::None);
                }
                rx.push_force(byte);
                Ok(Outcome::ReadReady(rx.data_size()))
            }
            EventKind::Write => {
                let next = self.tx.lock().pop();
                match next {
                    Some(byte) => {
                        self.driver.write_byte(byte)?;
                        Ok(Outcome::None)
                    }
                    None => {
                        self.driver.stop_tx();
                        Ok(Outcome::WriteDone(0))
                    }
                }
            }
            EventKind::Driver(_) => Err(DevError::NotSupported),
        }
    }
}
