//! CAN buses and devices.
//!
//! A device listens to one message id. Opening it enables the matching receive filter, and
//! every frame the bus receives is routed to the device whose id matches, whoever owns the bus.
//! A write sends one frame of at most eight bytes to the id encoded in the descriptor position
//! (see [frame_position]).
use alloc::sync::Arc;

use crate::{
    bus::{Bus, BusConfig, BusProtocol, FRAME_MAX, Received, Role, Target},
    dev::{Device, DeviceClass, EventKind, Handle, Position, Registry},
    error::{DevError, DevResult},
};

const ID_MASK: u32 = (1 << 29) - 1;
const IDE_BIT: u32 = 1 << 29;
const RTR_BIT: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanMode {
    #[default]
    Normal,
    Loopback,
    Silent,
    SilentLoopback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanConfig {
    pub baud_rate: u32,
    pub mode: CanMode,
}

impl CanConfig {
    pub const DEFAULT: CanConfig = CanConfig {
        baud_rate: 500_000,
        mode: CanMode::Normal,
    };
}

impl Default for CanConfig {
    fn default() -> Self {
        CanConfig::DEFAULT
    }
}

impl BusConfig for CanConfig {
    fn role(&self) -> Role {
        Role::Host
    }

    fn disabled() -> Self {
        CanConfig {
            baud_rate: 0,
            mode: CanMode::Normal,
        }
    }
}

/// Message identifier: 11 bits standard, 29 bits extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanId {
    pub id: u32,
    pub extended: bool,
}

impl CanId {
    pub const fn standard(id: u32) -> CanId {
        CanId {
            id: id & 0x7FF,
            extended: false,
        }
    }

    pub const fn extended(id: u32) -> CanId {
        CanId {
            id: id & ID_MASK,
            extended: true,
        }
    }
}

/// Descriptor position addressing a frame to `id`. `remote` sends a remote request instead of
/// data.
pub const fn frame_position(id: CanId, remote: bool) -> Position {
    let mut raw = id.id & ID_MASK;
    if id.extended {
        raw |= IDE_BIT;
    }
    if remote {
        raw |= RTR_BIT;
    }
    raw as Position
}

/// Inverse of [frame_position].
fn decode_position(pos: Position) -> DevResult<(CanId, bool)> {
    if pos < 0 {
        return Err(DevError::InvalidArgument);
    }
    let raw = pos as u32;
    let id = CanId {
        id: raw & ID_MASK,
        extended: raw & IDE_BIT != 0,
    };
    Ok((id, raw & RTR_BIT != 0))
}

pub trait CanDriver: Send + Sync {
    fn configure(&self, config: &CanConfig) -> DevResult<()>;
    /// Accept or stop accepting frames carrying `id`.
    fn filter(&self, id: CanId, enable: bool) -> DevResult<()>;
    /// Queue one frame. `data` holds at most eight bytes and is ignored for remote requests.
    fn send(&self, id: CanId, remote: bool, data: &[u8]) -> DevResult<usize>;
    /// Id of the oldest frame waiting in the hardware, if any.
    fn pending(&self) -> DevResult<Option<CanId>>;
    /// Take the oldest frame's payload.
    fn receive(&self, frame: &mut [u8; FRAME_MAX]) -> DevResult<usize>;
}

pub struct Can<D: CanDriver>(pub D);

pub type CanBus<D> = Bus<Can<D>>;

impl<D: CanDriver + 'static> Can<D> {
    pub fn register_bus(registry: &Registry, path: &str, driver: D) -> DevResult<(Handle<Device>, Arc<CanBus<D>>)> {
        Bus::register(registry, path, DeviceClass::Can, Can(driver), CanConfig::DEFAULT)
    }
}

impl<D: CanDriver + 'static> BusProtocol for Can<D> {
    type Config = CanConfig;
    type Channel = CanId;

    const BUFFERED_READ: bool = true;

    fn configure(&self, config: &CanConfig, _channel: Option<CanId>) -> DevResult<()> {
        self.0.configure(config)
    }

    /// Poll frames for `channel` straight from the hardware. Stops at the first frame carrying
    /// another id.
    fn read(&self, channel: CanId, _config: &CanConfig, _pos: Position, buf: &mut [u8]) -> DevResult<usize> {
        let mut count = 0;
        let mut frame = [0u8; FRAME_MAX];
        while count < buf.len() && self.0.pending()? == Some(channel) {
            let len = self.0.receive(&mut frame)?.min(FRAME_MAX);
            let take = len.min(buf.len() - count);
            buf[count..count + take].copy_from_slice(&frame[..take]);
            count += take;
            if len == 0 {
                break;
            }
        }
        Ok(count)
    }

    fn write(&self, _channel: CanId, _config: &CanConfig, pos: Position, buf: &[u8]) -> DevResult<usize> {
        let (id, remote) = decode_position(pos)?;
        let data = &buf[..buf.len().min(FRAME_MAX)];
        self.0.send(id, remote, data)
    }

    fn receive(
        &self,
        event: EventKind,
        _payload: &[u8],
        _owner: Option<CanId>,
        _config: &CanConfig,
        frame: &mut [u8; FRAME_MAX],
    ) -> DevResult<Option<Received<CanId>>> {
        if event != EventKind::Read {
            return Err(DevError::NotSupported);
        }
        let Some(id) = self.0.pending()? else {
            return Ok(None);
        };
        let len = self.0.receive(frame)?;
        Ok(Some(Received {
            target: Target::Channel(id),
            len,
        }))
    }

    fn attach(&self, channel: CanId, _config: &CanConfig) -> DevResult<()> {
        self.0.filter(channel, true)
    }

    fn detach(&self, channel: CanId) -> DevResult<()> {
        self.0.filter(channel, false)
    }
}

#[cfg(test)]
mod tests {
    use alloc::{collections::VecDeque, vec, vec::Vec};

    use spin::Mutex;

    use super::*;
    use crate::dev::{Callback, Command, Descriptor, IoctlArg, OpenFlags};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Configure(u32),
        Filter(u32, bool),
        Send(CanId, bool, Vec<u8>),
    }

    #[derive(Default)]
    struct Controller {
        events: Mutex<Vec<Event>>,
        mailbox: Mutex<VecDeque<(CanId, Vec<u8>)>>,
    }

    impl Controller {
        fn take(&self) -> Vec<Event> {
            core::mem::take(&mut *self.events.lock())
        }

        fn inject(&self, id: CanId, data: &[u8]) {
            self.mailbox.lock().push_back((id, data.to_vec()));
        }
    }

    impl CanDriver for Arc<Controller> {
        fn configure(&self, config: &CanConfig) -> DevResult<()> {
            self.events.lock().push(Event::Configure(config.baud_rate));
            Ok(())
        }

        fn filter(&self, id: CanId, enable: bool) -> DevResult<()> {
            self.events.lock().push(Event::Filter(id.id, enable));
            Ok(())
        }

        fn send(&self, id: CanId, remote: bool, data: &[u8]) -> DevResult<usize> {
            self.events.lock().push(Event::Send(id, remote, data.to_vec()));
            Ok(data.len())
        }

        fn pending(&self) -> DevResult<Option<CanId>> {
            Ok(self.mailbox.lock().front().map(|(id, _)| *id))
        }

        fn receive(&self, frame: &mut [u8; FRAME_MAX]) -> DevResult<usize> {
            let Some((_, data)) = self.mailbox.lock().pop_front() else {
                return Ok(0);
            };
            frame[..data.len()].copy_from_slice(&data);
            Ok(data.len())
        }
    }

    fn fixture() -> (Registry, Arc<Controller>, Handle<Device>, Arc<CanBus<Arc<Controller>>>) {
        let registry = Registry::new();
        let ctl = Arc::new(Controller::default());
        let (bus_dev, bus) = Can::register_bus(&registry, "/can1", ctl.clone()).unwrap();
        (registry, ctl, bus_dev, bus)
    }

    #[test]
    fn positions_encode_id_and_flags() {
        let pos = frame_position(CanId::extended(0x1234_5678), true);
        assert_eq!(decode_position(pos), Ok((CanId::extended(0x1234_5678), true)));
        assert_eq!(frame_position(CanId::standard(0x123), false), 0x123);
        assert_eq!(decode_position(-1), Err(DevError::InvalidArgument));
    }

    #[test]
    fn frames_are_routed_by_id() {
        let (registry, ctl, bus_dev, bus) = fixture();
        bus.register_device(&registry, "motor", CanId::standard(0x100), CanConfig::DEFAULT, 16)
            .unwrap();
        bus.register_device(&registry, "bms", CanId::standard(0x200), CanConfig::DEFAULT, 16)
            .unwrap();
        let motor = registry.open("/can1/motor", OpenFlags::RDWR).unwrap();
        let bms = registry.open("/can1/bms", OpenFlags::RDWR).unwrap();
        assert_eq!(
            ctl.take(),
            [Event::Configure(500_000), Event::Filter(0x100, true), Event::Filter(0x200, true)]
        );

        let calls: Arc<Mutex<Vec<(Descriptor, usize)>>> = Arc::default();
        let sink = calls.clone();
        let call: Callback = Arc::new(move |desc, size| sink.lock().push((desc, size)));
        registry
            .ioctl(bms, Command::SetReadCallback, IoctlArg::Callback(Some(call)))
            .unwrap();

        // Motor talks on the bus, yet the frame for 0x200 goes to bms.
        let to_bms = frame_position(CanId::standard(0x200), false);
        registry.ioctl(motor, Command::SetPosition, IoctlArg::Int(to_bms)).unwrap();
        registry.write(motor, &[0xAA]).unwrap();
        ctl.inject(CanId::standard(0x200), &[1, 2, 3]);
        assert_eq!(registry.deliver_event(&bus_dev, EventKind::Read, &[]), Ok(3));
        ctl.inject(CanId::standard(0x300), &[9]);
        assert_eq!(registry.deliver_event(&bus_dev, EventKind::Read, &[]), Ok(0));
        assert_eq!(*calls.lock(), [(bms, 3)]);

        let mut buf = [0u8; 8];
        assert_eq!(registry.read(motor, &mut buf), Ok(0));
        assert_eq!(registry.read(bms, &mut buf), Ok(3));
        assert_eq!(buf[..3], [1, 2, 3]);

        registry.close(bms).unwrap();
        assert_eq!(ctl.take().last(), Some(&Event::Filter(0x200, false)));
    }

    #[test]
    fn write_sends_one_frame() {
        let (registry, ctl, _, bus) = fixture();
        bus.register_device(&registry, "node", CanId::extended(0x18FF_0001), CanConfig::DEFAULT, 0)
            .unwrap();
        let desc = registry.open("/can1/node", OpenFlags::RDWR).unwrap();
        ctl.take();

        assert_eq!(registry.write(desc, &[1]), Err(DevError::InvalidArgument));
        let target = CanId::extended(0x18FF_0002);
        registry
            .ioctl(desc, Command::SetPosition, IoctlArg::Int(frame_position(target, false)))
            .unwrap();
        assert_eq!(registry.write(desc, &[0; 12]), Ok(8));
        registry
            .ioctl(desc, Command::SetPosition, IoctlArg::Int(frame_position(target, true)))
            .unwrap();
        registry.write(desc, &[]).unwrap();
        assert_eq!(
            ctl.take(),
            [Event::Send(target, false, vec![0; 8]), Event::Send(target, true, vec![])]
        );
    }

    #[test]
    fn unbuffered_read_polls_matching_frames() {
        let (registry, ctl, _, bus) = fixture();
        let id = CanId::standard(0x42);
        bus.register_device(&registry, "sensor", id, CanConfig::DEFAULT, 0).unwrap();
        let desc = registry.open("/can1/sensor", OpenFlags::READ).unwrap();

        ctl.inject(id, &[1, 2]);
        ctl.inject(id, &[3]);
        ctl.inject(CanId::standard(0x43), &[4]);
        let mut buf = [0u8; 8];
        assert_eq!(registry.read(desc, &mut buf), Ok(3));
        assert_eq!(buf[..3], [1, 2, 3]);
        assert_eq!(ctl.mailbox.lock().len(), 1);
    }
}
