//! Device operations of a bus and of the devices attached to it.
use alloc::{format, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};

use utils::ring::RingBuffer;

use super::{Bus, BusConfig, BusProtocol, FRAME_MAX, Member, OwnerId, Target};
use crate::{
    dev::{
        Capability, Command, Device, DeviceClass, DeviceOps, EventKind, Handle, HandleRef,
        IoctlArg, Outcome, Position, Registry, Transfer,
    },
    error::{DevError, DevResult},
    sync::IrqSpinLock,
};

impl<P: BusProtocol> Bus<P> {
    /// Register a bus at `path`. The bus device is opened implicitly through its members and
    /// explicitly only for bus-level configuration.
    pub fn register(
        registry: &Registry,
        path: &str,
        class: DeviceClass,
        protocol: P,
        default: P::Config,
    ) -> DevResult<(Handle<Device>, Arc<Bus<P>>)> {
        let bus = Arc::new(Bus::new(protocol, default));
        let dev = registry.register(path, class, Capability::empty(), BusOps(bus.clone()))?;
        bus.device.call_once(|| dev.create_ref());
        Ok((dev, bus))
    }

    /// Register a device named `name` on this bus.
    pub fn register_device(
        self: &Arc<Self>,
        registry: &Registry,
        name: &str,
        channel: P::Channel,
        config: P::Config,
        rx_bufsz: usize,
    ) -> DevResult<Handle<Device>> {
        let bus_dev = self
            .device
            .get()
            .and_then(HandleRef::get_handle)
            .ok_or(DevError::NotFound)?;
        let path = format!("{}/{}", registry.path_of(&bus_dev), name);
        registry.register(
            &path,
            bus_dev.class(),
            Capability::RDWR,
            BusDevice::new(self, channel, config, rx_bufsz),
        )
    }
}

/// Operations of the bus node itself.
pub struct BusOps<P: BusProtocol>(pub Arc<Bus<P>>);

impl<P: BusProtocol> DeviceOps for BusOps<P> {
    fn open(&self, _dev: &Device) -> DevResult<()> {
        self.0.power_up()
    }

    fn close(&self, _dev: &Device) -> DevResult<()> {
        self.0.power_down()
    }

    fn ioctl(&self, _dev: &Device, _pos: Position, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        match cmd {
            Command::SetConfig => {
                let config = arg.config::<P::Config>()?;
                self.0.reconfigure(config)?;
                Ok(size_of::<P::Config>())
            }
            Command::GetConfig => arg.store_config(&self.0.config()),
            _ => Err(DevError::NotSupported),
        }
    }

    /// Decode a receive interrupt and hand the frame to the member it belongs to.
    fn isr(&self, _dev: &Device, event: EventKind, payload: &[u8]) -> DevResult<Outcome> {
        let bus = &self.0;
        let owner = bus.owner_member().map(|member| member.channel);
        let mut frame = [0u8; FRAME_MAX];
        let config = bus.config();
        let Some(received) = bus.protocol.receive(event, payload, owner, &config, &mut frame)? else {
            return Ok(Outcome::None);
        };
        let member = match received.target {
            Target::Owner => bus.owner_member(),
            Target::Channel(channel) => bus.member_by_channel(channel),
        };
        let Some(member) = member else {
            log::trace!("No receiver for {:?} frame, dropped.", received.target);
            return Ok(Outcome::None);
        };

        let size = {
            let mut rx = member.rx.lock();
            rx.write_force(&frame[..received.len.min(FRAME_MAX)]);
            rx.data_size()
        };
        match member.device.lock().as_ref().and_then(HandleRef::get_handle) {
            Some(device) => Ok(Outcome::Routed { device, size }),
            None => Ok(Outcome::None),
        }
    }
}

/// A device attached to a bus. Every transfer takes the bus first.
pub struct BusDevice<P: BusProtocol> {
    bus: Arc<Bus<P>>,
    member: Arc<Member<P::Channel>>,
    config: IrqSpinLock<P::Config>,
    rx_bufsz: AtomicUsize,
}

impl<P: BusProtocol> BusDevice<P> {
    pub fn new(bus: &Arc<Bus<P>>, channel: P::Channel, config: P::Config, rx_bufsz: usize) -> BusDevice<P> {
        BusDevice {
            bus: bus.clone(),
            member: Arc::new(Member {
                id: bus.attach(),
                channel,
                device: IrqSpinLock::new(None),
                rx: IrqSpinLock::new(RingBuffer::default()),
            }),
            config: IrqSpinLock::new(config),
            rx_bufsz: AtomicUsize::new(rx_bufsz),
        }
    }

    pub fn id(&self) -> OwnerId {
        self.member.id
    }

    fn config(&self) -> P::Config {
        self.config.lock().clone()
    }

    fn buffered(&self, config: &P::Config) -> bool {
        (P::BUFFERED_READ || config.is_follower()) && self.member.rx.lock().capacity() > 0
    }
}

impl<P: BusProtocol> DeviceOps for BusDevice<P> {
    fn open(&self, dev: &Device) -> DevResult<()> {
        let config = self.config();
        let channel = self.member.channel;
        self.bus.protocol.attach(channel, &config)?;
        if config.is_follower() {
            if let Err(err) = self.bus.take(self.member.id, &config, Some(channel)) {
                let _ = self.bus.protocol.detach(channel);
                return Err(err);
            }
        }
        *self.member.device.lock() = Some(dev.create_ref());
        self.member.rx.lock().init(self.rx_bufsz.load(Ordering::Relaxed));
        self.bus.join(self.member.clone());
        Ok(())
    }

    fn close(&self, _dev: &Device) -> DevResult<()> {
        self.bus.leave(self.member.id);
        self.bus.disown(self.member.id);
        self.member.rx.lock().free();
        *self.member.device.lock() = None;
        self.bus.protocol.detach(self.member.channel)
    }

    fn read(&self, _dev: &Device, pos: Position, buf: &mut [u8], _mode: Transfer) -> DevResult<usize> {
        let config = self.config();
        if self.buffered(&config) {
            return Ok(self.member.rx.lock().read(buf));
        }
        let channel = self.member.channel;
        let _guard = self.bus.acquire(self.member.id, &config, Some(channel))?;
        self.bus.protocol.read(channel, &config, pos, buf)
    }

    fn write(&self, _dev: &Device, pos: Position, buf: &[u8], _mode: Transfer) -> DevResult<usize> {
        let config = self.config();
        let channel = self.member.channel;
        let _guard = self.bus.acquire(self.member.id, &config, Some(channel))?;
        self.bus.protocol.write(channel, &config, pos, buf)
    }

    fn ioctl(&self, _dev: &Device, _pos: Position, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        let id = self.member.id;
        let channel = self.member.channel;
        match cmd {
            Command::SetConfig => {
                let config = arg.config::<P::Config>()?.clone();
                // Whoever takes the bus next re-evaluates the hardware configuration.
                self.bus.disown(id);
                if config.is_follower() {
                    self.bus.take(id, &config, Some(channel))?;
                }
                *self.config.lock() = config;
                Ok(size_of::<P::Config>())
            }
            Command::GetConfig => arg.store_config(&self.config()),
            Command::SetReadBufSize => {
                let size = arg.size()?;
                self.member.rx.lock().init(size);
                self.rx_bufsz.store(size, Ordering::Relaxed);
                Ok(size_of::<usize>())
            }
            Command::GetReadBufSize => arg.store_size(self.rx_bufsz.load(Ordering::Relaxed)),
            Command::ClearReadBuf => {
                self.member.rx.lock().reset();
                Ok(0)
            }
            Command::GetReadDataSize => arg.store_size(self.member.rx.lock().data_size()),
            Command::Driver(code) => {
                let config = self.config();
                let _guard = self.bus.acquire(id, &config, Some(channel))?;
                self.bus.protocol.control(channel, &config, code, arg)
            }
            _ => Err(DevError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec, vec::Vec};

    use spin::Mutex;

    use super::*;
    use crate::{
        bus::mock::{Op, Wire, WireConfig},
        dev::{Callback, Descriptor, OpenFlags},
    };

    const DEFAULT: WireConfig = WireConfig::host(100);
    const CFG_A: WireConfig = WireConfig::host(1_000);
    const CFG_B: WireConfig = WireConfig::host(8_000);

    struct Fixture {
        registry: Registry,
        wire: Arc<Wire>,
        bus_dev: Handle<Device>,
        bus: Arc<Bus<Arc<Wire>>>,
    }

    fn fixture() -> Fixture {
        let registry = Registry::new();
        let wire = Arc::new(Wire::default());
        let (bus_dev, bus) = Bus::register(&registry, "/bus", DeviceClass::Spi, wire.clone(), DEFAULT).unwrap();
        bus.register_device(&registry, "a", 1, CFG_A, 0).unwrap();
        bus.register_device(&registry, "b", 2, CFG_B, 16).unwrap();
        Fixture {
            registry,
            wire,
            bus_dev,
            bus,
        }
    }

    #[test]
    fn two_devices_share_the_bus() {
        let f = fixture();
        let a = f.registry.open("/dev/bus/a", OpenFlags::RDWR).unwrap();
        let b = f.registry.open("/dev/bus/b", OpenFlags::RDWR).unwrap();
        assert_eq!(f.wire.take_ops(), [Op::Configure(100, None), Op::Attach(1), Op::Attach(2)]);

        assert_eq!(f.registry.write(a, b"\x01\x02"), Ok(2));
        assert_eq!(f.registry.write(b, b"\x03"), Ok(1));
        assert_eq!(
            f.wire.take_ops(),
            [
                Op::Configure(1_000, Some(1)),
                Op::Write(1, -1, vec![1, 2]),
                Op::Configure(8_000, Some(2)),
                Op::Write(2, -1, vec![3]),
            ]
        );

        // Repeated use by the last owner costs no reconfiguration.
        f.registry.ioctl(b, Command::SetPosition, IoctlArg::Int(0x20)).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(f.registry.read(b, &mut buf), Ok(2));
        assert_eq!(buf, [2, 2]);
        assert_eq!(f.wire.take_ops(), [Op::Read(2, 0x20, 2)]);
        assert!(!f.bus.is_held());

        // Ownership changes back: the first device's configuration is applied again, once.
        assert_eq!(f.registry.write(a, b"\x01\x02"), Ok(2));
        assert_eq!(
            f.wire.take_ops(),
            [Op::Configure(1_000, Some(1)), Op::Write(1, -1, vec![1, 2])]
        );
        assert_eq!(f.registry.write(a, b"\x04"), Ok(1));
        assert_eq!(f.wire.take_ops(), [Op::Write(1, -1, vec![4])]);
    }

    #[test]
    fn bus_power_follows_members() {
        let f = fixture();
        let a = f.registry.open("/bus/a", OpenFlags::RDWR).unwrap();
        let b = f.registry.open("/bus/b", OpenFlags::RDWR).unwrap();
        f.wire.take_ops();

        f.registry.close(a).unwrap();
        assert_eq!(f.wire.take_ops(), [Op::Detach(1)]);
        f.registry.close(b).unwrap();
        assert_eq!(f.wire.take_ops(), [Op::Detach(2), Op::Configure(0, None)]);
        assert_eq!(f.bus.owner(), None);
        assert_eq!(f.bus_dev.ref_count(), 0);
    }

    #[test]
    fn config_change_drops_ownership() {
        let f = fixture();
        let a = f.registry.open("/bus/a", OpenFlags::RDWR).unwrap();
        let b = f.registry.open("/bus/b", OpenFlags::RDWR).unwrap();
        f.registry.write(a, b"x").unwrap();
        let id_a = f.bus.owner();
        f.wire.take_ops();

        let mut current = DEFAULT;
        f.registry.ioctl(a, Command::GetConfig, IoctlArg::ConfigOut(&mut current)).unwrap();
        assert_eq!(current, CFG_A);

        f.registry.ioctl(a, Command::SetConfig, IoctlArg::Config(&CFG_B)).unwrap();
        assert_eq!(f.bus.owner(), None);
        // The hardware already runs CFG_A; the new owner's CFG_B differs.
        f.registry.write(a, b"y").unwrap();
        assert_eq!(f.wire.take_ops(), [Op::Configure(8_000, Some(1)), Op::Write(1, -1, vec![b'y'])]);
        assert_eq!(f.bus.owner(), id_a);

        // A device switched to the follower role grabs the bus at once.
        f.registry
            .ioctl(b, Command::SetConfig, IoctlArg::Config(&WireConfig::follower(8_000)))
            .unwrap();
        assert!(f.bus.is_held());
        assert_eq!(f.registry.write(a, b"z"), Err(DevError::Busy));
        assert_eq!(
            f.registry.ioctl(a, Command::SetConfig, IoctlArg::Config(&7u32)),
            Err(DevError::InvalidArgument)
        );
    }

    #[test]
    fn received_frames_reach_their_device() {
        let f = fixture();
        let b = f.registry.open("/bus/b", OpenFlags::RDWR).unwrap();
        let calls: Arc<Mutex<Vec<(Descriptor, usize)>>> = Arc::default();
        let sink = calls.clone();
        let call: Callback = Arc::new(move |desc, size| sink.lock().push((desc, size)));
        f.registry
            .ioctl(b, Command::SetReadCallback, IoctlArg::Callback(Some(call)))
            .unwrap();

        *f.wire.inbox.lock() = Some((Some(2), vec![0xAB, 0xCD]));
        assert_eq!(f.registry.deliver_event(&f.bus_dev, EventKind::Read, &[]), Ok(2));
        assert_eq!(*calls.lock(), [(b, 2)]);

        // Nobody listens on channel 9.
        *f.wire.inbox.lock() = Some((Some(9), vec![0xEE]));
        assert_eq!(f.registry.deliver_event(&f.bus_dev, EventKind::Read, &[]), Ok(0));

        // Followers read what was received.
        f.registry
            .ioctl(b, Command::SetConfig, IoctlArg::Config(&WireConfig::follower(8_000)))
            .unwrap();
        *f.wire.inbox.lock() = Some((None, vec![0x11]));
        assert_eq!(f.registry.deliver_event(&f.bus_dev, EventKind::Read, &[]), Ok(3));
        let mut size = 0;
        f.registry
            .ioctl(b, Command::GetReadDataSize, IoctlArg::SizeOut(&mut size))
            .unwrap();
        assert_eq!(size, 3);
        let mut buf = [0u8; 4];
        assert_eq!(f.registry.read(b, &mut buf), Ok(3));
        assert_eq!(buf[..3], [0xAB, 0xCD, 0x11]);
    }

    #[test]
    fn bus_level_configuration() {
        let f = fixture();
        let ctl = f.registry.open("/bus", OpenFlags::empty()).unwrap();
        f.wire.take_ops();
        f.registry
            .ioctl(ctl, Command::SetConfig, IoctlArg::Config(&CFG_B))
            .unwrap();
        assert_eq!(f.wire.take_ops(), [Op::Configure(8_000, None)]);
        assert_eq!(f.registry.write(ctl, b"x"), Err(DevError::NotSupported));

        let b = f.registry.open("/bus/b", OpenFlags::RDWR).unwrap();
        f.wire.take_ops();
        f.registry.write(b, b"x").unwrap();
        assert_eq!(f.wire.take_ops(), [Op::Write(2, -1, vec![b'x'])]);
    }
}
