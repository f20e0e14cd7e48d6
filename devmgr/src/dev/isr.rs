//! Interrupt-side entry point.
//!
//! A board's interrupt handler calls [Registry::deliver_event] with the device that raised the
//! event. The device's [DeviceOps::isr](crate::dev::DeviceOps::isr) decodes it, and the registry
//! turns the [Outcome] into lock updates and callback invocations.
use num_enum::FromPrimitive;

use crate::{
    dev::{Device, LockFlags, Registry, desc::Direction, handle::Handle},
    error::{DevError, DevResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum EventKind {
    /// Data arrived.
    Read = 0x0100_0000,
    /// A queued transfer made progress or finished.
    Write = 0x0200_0000,
    #[num_enum(catch_all)]
    Driver(u32),
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// Nothing to report.
    None,
    /// `size` bytes are ready to be read from this device.
    ReadReady(usize),
    /// The in-flight non-blocking write finished.
    WriteDone(usize),
    /// Data was received on behalf of another device, typically a member of a bus.
    Routed { device: Handle<Device>, size: usize },
}

impl Registry {
    /// Process a hardware event raised by `dev`. Safe to call from interrupt context.
    ///
    /// Return the size reported by the device, `0` when there was nothing to report.
    pub fn deliver_event(&self, dev: &Device, event: EventKind, payload: &[u8]) -> DevResult<usize> {
        if dev.ref_count() == 0 {
            return Err(DevError::InvalidArgument);
        }
        match dev.ops().isr(dev, event, payload)? {
            Outcome::None => Ok(0),
            Outcome::ReadReady(size) => {
                self.notify(dev, Direction::Read, size);
                Ok(size)
            }
            Outcome::WriteDone(size) => {
                dev.state.lock().lock.remove(LockFlags::NONBLOCK);
                self.notify(dev, Direction::Write, size);
                Ok(size)
            }
            Outcome::Routed { device, size } => {
                self.notify(&device, Direction::Read, size);
                Ok(size)
            }
        }
    }

    /// Call every callback of `direction` installed on `dev`.
    fn notify(&self, dev: &Device, direction: Direction, size: usize) {
        let waiters = {
            let state = dev.state.lock();
            match direction {
                Direction::Read => state.rd_waiters.clone(),
                Direction::Write => state.wr_waiters.clone(),
            }
        };
        for desc in waiters {
            if let Some(call) = self.descs.callback(desc, direction) {
                call(desc, size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec::Vec};

    use spin::Mutex;

    use super::*;
    use crate::dev::{
        Capability, Command, DeviceClass, DeviceOps, Descriptor, IoctlArg, OpenFlags, Position,
        Transfer,
    };

    /// Queues writes and reports them done only when told to by an event.
    #[derive(Default)]
    struct Pulse {
        queued: Mutex<usize>,
    }

    impl DeviceOps for Pulse {
        fn read(&self, _dev: &Device, _pos: Position, buf: &mut [u8], _mode: Transfer) -> DevResult<usize> {
            Ok(buf.len())
        }

        fn write(&self, _dev: &Device, _pos: Position, buf: &[u8], mode: Transfer) -> DevResult<usize> {
            if mode == Transfer::Async {
                *self.queued.lock() += buf.len();
            }
            Ok(buf.len())
        }

        fn isr(&self, _dev: &Device, event: EventKind, payload: &[u8]) -> DevResult<Outcome> {
            match event {
                EventKind::Read => Ok(Outcome::ReadReady(payload.len())),
                EventKind::Write => Ok(Outcome::WriteDone(core::mem::take(&mut *self.queued.lock()))),
                EventKind::Driver(_) => Ok(Outcome::None),
            }
        }
    }

    type Calls = Arc<Mutex<Vec<(Descriptor, usize)>>>;

    fn recorder(calls: &Calls) -> IoctlArg<'static> {
        let calls = calls.clone();
        IoctlArg::Callback(Some(Arc::new(move |desc, size| calls.lock().push((desc, size)))))
    }

    fn setup() -> (Registry, Handle<Device>) {
        let registry = Registry::with_capacity(8);
        let dev = registry
            .register(
                "/pulse",
                DeviceClass::Serial,
                Capability::RDWR | Capability::NONBLOCK,
                Pulse::default(),
            )
            .unwrap();
        (registry, dev)
    }

    #[test]
    fn async_write_pends_until_completion() {
        let (registry, dev) = setup();
        let calls = Calls::default();
        let tx = registry
            .open("/dev/pulse", OpenFlags::WRITE | OpenFlags::NONBLOCK)
            .unwrap();
        let sync = registry.open("/dev/pulse", OpenFlags::WRITE).unwrap();
        registry.ioctl(tx, Command::SetWriteCallback, recorder(&calls)).unwrap();

        assert_eq!(registry.write(tx, b"hello"), Ok(5));
        assert!(dev.lock_flags().contains(LockFlags::NONBLOCK));
        assert_eq!(registry.write(tx, b"again"), Err(DevError::Busy));
        assert_eq!(registry.write(sync, b"x"), Err(DevError::Busy));

        assert_eq!(registry.deliver_event(&dev, EventKind::Write, &[]), Ok(5));
        assert!(dev.lock_flags().is_empty());
        assert_eq!(*calls.lock(), [(tx, 5)]);

        assert_eq!(registry.write(sync, b"x"), Ok(1));
        assert_eq!(registry.write(tx, b"again"), Ok(5));
    }

    #[test]
    fn empty_async_write_does_not_pend() {
        let (registry, dev) = setup();
        let tx = registry
            .open("pulse", OpenFlags::WRITE | OpenFlags::NONBLOCK)
            .unwrap();
        assert_eq!(registry.write(tx, &[]), Ok(0));
        assert!(dev.lock_flags().is_empty());
    }

    #[test]
    fn read_event_reaches_every_waiter() {
        let (registry, dev) = setup();
        let calls = Calls::default();
        let a = registry.open("/pulse", OpenFlags::READ).unwrap();
        let b = registry.open("/pulse", OpenFlags::READ).unwrap();
        let c = registry.open("/pulse", OpenFlags::READ).unwrap();
        registry.ioctl(a, Command::SetReadCallback, recorder(&calls)).unwrap();
        registry.ioctl(b, Command::SetReadCallback, recorder(&calls)).unwrap();
        registry.ioctl(c, Command::SetReadCallback, recorder(&calls)).unwrap();
        registry.close(c).unwrap();

        assert_eq!(registry.deliver_event(&dev, EventKind::Read, b"abc"), Ok(3));
        assert_eq!(*calls.lock(), [(a, 3), (b, 3)]);

        // Clearing a callback stops its notifications.
        registry.ioctl(a, Command::SetReadCallback, IoctlArg::Callback(None)).unwrap();
        calls.lock().clear();
        registry.deliver_event(&dev, EventKind::Read, b"z").unwrap();
        assert_eq!(*calls.lock(), [(b, 1)]);
    }

    #[test]
    fn events_on_closed_device_are_rejected() {
        let (registry, dev) = setup();
        assert_eq!(
            registry.deliver_event(&dev, EventKind::Read, b"a"),
            Err(DevError::InvalidArgument)
        );
        let desc = registry.open("/pulse", OpenFlags::READ).unwrap();
        assert_eq!(registry.deliver_event(&dev, EventKind::Driver(7), &[]), Ok(0));
        registry.close(desc).unwrap();
        assert_eq!(
            registry.deliver_event(&dev, EventKind::Write, &[]),
            Err(DevError::InvalidArgument)
        );
    }

    #[test]
    fn raw_event_codes() {
        assert_eq!(EventKind::from(0x0100_0000), EventKind::Read);
        assert_eq!(EventKind::from(0x0200_0000), EventKind::Write);
        assert_eq!(EventKind::from(0x0300_0000), EventKind::Driver(0x0300_0000));
    }
}
