//! Shared-bus ownership.
//!
//! Several devices hang off one physical bus, each with its own configuration (speed, mode,
//! role) and channel selector (chip-select line, address, message id). Before touching the
//! hardware a device takes the bus:
//!
//! - a bus held by another device fails the take with [DevError::Busy], nothing waits;
//! - when ownership changes hands the hardware is reconfigured, but only if the new owner's
//!   configuration differs from the one last applied;
//! - after the transfer a host-role owner drops the hold but stays recorded as owner, so its
//!   next take is free. A follower-role owner keeps the bus until its configuration changes.
//!
//! The protocol-specific parts (how to reconfigure, how to frame a transfer, how to decode a
//! receive interrupt) come from a [BusProtocol]. SPI, I2C and CAN are implementations of it.
mod device;

use alloc::{sync::Arc, vec::Vec};
use core::{
    fmt::Debug,
    sync::atomic::{AtomicUsize, Ordering},
};

use spin::Once;
use utils::ring::RingBuffer;

pub use device::{BusDevice, BusOps};

use crate::{
    dev::{Device, EventKind, HandleRef, IoctlArg, Position},
    error::{DevError, DevResult},
    sync::IrqSpinLock,
};

/// Largest frame a receive interrupt can produce.
pub const FRAME_MAX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Drives the clock and starts transfers.
    #[default]
    Host,
    /// Answers a remote host. Holds the bus for as long as it keeps this role.
    Follower,
}

pub trait BusConfig: Clone + PartialEq + Debug + Send + Sync + 'static {
    fn role(&self) -> Role;

    fn is_follower(&self) -> bool {
        self.role() == Role::Follower
    }

    /// Configuration applied when the bus is shut down.
    fn disabled() -> Self;
}

/// Token identifying one device attached to a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(usize);

/// Where a received frame should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<C> {
    /// The current owner of the bus.
    Owner,
    /// The attached device with this channel.
    Channel(C),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received<C> {
    pub target: Target<C>,
    /// Bytes written to the frame buffer.
    pub len: usize,
}

/// Hardware side of a bus.
pub trait BusProtocol: Send + Sync + 'static {
    type Config: BusConfig;
    type Channel: Copy + PartialEq + Debug + Send + Sync + 'static;

    /// Member reads are served from the receive FIFO rather than the hardware.
    const BUFFERED_READ: bool = false;

    /// Apply `config`. `channel` is the device the bus is configured for, if any.
    fn configure(&self, config: &Self::Config, channel: Option<Self::Channel>) -> DevResult<()>;

    fn read(&self, channel: Self::Channel, config: &Self::Config, pos: Position, buf: &mut [u8]) -> DevResult<usize>;

    fn write(&self, channel: Self::Channel, config: &Self::Config, pos: Position, buf: &[u8]) -> DevResult<usize>;

    /// Protocol-specific control command, run with the bus taken.
    fn control(
        &self,
        _channel: Self::Channel,
        _config: &Self::Config,
        _code: u32,
        _arg: IoctlArg<'_>,
    ) -> DevResult<usize> {
        Err(DevError::NotSupported)
    }

    /// Decode a receive interrupt into `frame`. `owner` is the channel of the current owner and
    /// `config` the applied configuration. `Ok(None)` drops the event.
    fn receive(
        &self,
        _event: EventKind,
        _payload: &[u8],
        _owner: Option<Self::Channel>,
        _config: &Self::Config,
        _frame: &mut [u8; FRAME_MAX],
    ) -> DevResult<Option<Received<Self::Channel>>> {
        Ok(None)
    }

    /// Prepare the channel of a device being opened: chip-select idle level, receive filter.
    fn attach(&self, _channel: Self::Channel, _config: &Self::Config) -> DevResult<()> {
        Ok(())
    }

    fn detach(&self, _channel: Self::Channel) -> DevResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct BusState<C> {
    /// Last configuration applied to the hardware.
    config: C,
    /// Applied on open and by bus-level reconfiguration.
    default: C,
    owner: Option<OwnerId>,
    hold: bool,
}

/// An open device attached to the bus.
struct Member<C> {
    id: OwnerId,
    channel: C,
    device: IrqSpinLock<Option<HandleRef<Device>>>,
    rx: IrqSpinLock<RingBuffer>,
}

pub struct Bus<P: BusProtocol> {
    protocol: P,
    state: IrqSpinLock<BusState<P::Config>>,
    members: IrqSpinLock<Vec<Arc<Member<P::Channel>>>>,
    device: Once<HandleRef<Device>>,
    next_id: AtomicUsize,
}

impl<P: BusProtocol> Bus<P> {
    pub fn new(protocol: P, default: P::Config) -> Bus<P> {
        Bus {
            protocol,
            state: IrqSpinLock::new(BusState {
                config: P::Config::disabled(),
                default,
                owner: None,
                hold: false,
            }),
            members: IrqSpinLock::new(Vec::new()),
            device: Once::new(),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// Configuration last applied to the hardware.
    pub fn config(&self) -> P::Config {
        self.state.lock().config.clone()
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.state.lock().owner
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().hold
    }

    /// Issue a new owner token.
    pub fn attach(&self) -> OwnerId {
        OwnerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Claim the bus for `id`, reconfiguring the hardware if ownership changes hands and
    /// `config` differs from the applied one. A failed reconfiguration changes nothing.
    ///
    /// The hardware is configured with the state lock released, after the claim is recorded.
    pub fn take(&self, id: OwnerId, config: &P::Config, channel: Option<P::Channel>) -> DevResult<()> {
        let previous = {
            let mut state = self.state.lock();
            if state.owner == Some(id) {
                state.hold = true;
                return Ok(());
            }
            if state.hold {
                return Err(DevError::Busy);
            }
            if state.config == *config {
                state.owner = Some(id);
                state.hold = true;
                return Ok(());
            }
            let previous = state.owner.replace(id);
            state.hold = true;
            previous
        };

        if let Err(err) = self.protocol.configure(config, channel) {
            let mut state = self.state.lock();
            state.owner = previous;
            state.hold = false;
            return Err(err);
        }
        log::trace!("Bus reconfigured for {:?}: {:?}", id, config);
        self.state.lock().config = config.clone();
        Ok(())
    }

    /// Drop the hold of `id`. A follower-role owner keeps holding.
    pub fn release(&self, id: OwnerId) -> DevResult<()> {
        let mut state = self.state.lock();
        if state.owner != Some(id) {
            return Err(DevError::InvalidArgument);
        }
        if !state.config.is_follower() {
            state.hold = false;
        }
        Ok(())
    }

    /// [Bus::take] that releases on drop.
    pub fn acquire(&self, id: OwnerId, config: &P::Config, channel: Option<P::Channel>) -> DevResult<BusGuard<'_, P>> {
        self.take(id, config, channel)?;
        Ok(BusGuard { bus: self, id })
    }

    /// Forget `id` as owner, whatever its hold state.
    pub fn disown(&self, id: OwnerId) {
        let mut state = self.state.lock();
        if state.owner == Some(id) {
            state.owner = None;
            state.hold = false;
        }
    }

    /// Apply the default configuration. Called when the bus device is first opened.
    fn power_up(&self) -> DevResult<()> {
        let default = self.state.lock().default.clone();
        self.protocol.configure(&default, None)?;
        let mut state = self.state.lock();
        state.config = default;
        state.owner = None;
        state.hold = false;
        Ok(())
    }

    fn power_down(&self) -> DevResult<()> {
        {
            let mut state = self.state.lock();
            state.owner = None;
            state.hold = false;
        }
        let disabled = P::Config::disabled();
        self.protocol.configure(&disabled, None)?;
        self.state.lock().config = disabled;
        Ok(())
    }

    /// Replace the default configuration and apply it. Fails [DevError::Busy] while a device
    /// holds the bus.
    ///
    /// The bus stays held without an owner while the hardware is configured.
    fn reconfigure(&self, config: &P::Config) -> DevResult<()> {
        let previous = {
            let mut state = self.state.lock();
            if state.hold {
                return Err(DevError::Busy);
            }
            state.hold = true;
            state.owner.take()
        };
        let result = self.protocol.configure(config, None);
        let mut state = self.state.lock();
        state.hold = false;
        if let Err(err) = result {
            state.owner = previous;
            return Err(err);
        }
        state.config = config.clone();
        state.default = config.clone();
        Ok(())
    }

    fn join(&self, member: Arc<Member<P::Channel>>) {
        self.members.lock().push(member);
    }

    fn leave(&self, id: OwnerId) {
        self.members.lock().retain(|member| member.id != id);
    }

    fn owner_member(&self) -> Option<Arc<Member<P::Channel>>> {
        let owner = self.owner()?;
        self.members
            .lock()
            .iter()
            .find(|member| member.id == owner)
            .cloned()
    }

    fn member_by_channel(&self, channel: P::Channel) -> Option<Arc<Member<P::Channel>>> {
        self.members
            .lock()
            .iter()
            .find(|member| member.channel == channel)
            .cloned()
    }
}

/// Bus claim released on drop.
pub struct BusGuard<'a, P: BusProtocol> {
    bus: &'a Bus<P>,
    id: OwnerId,
}

impl<P: BusProtocol> Drop for BusGuard<'_, P> {
    fn drop(&mut self) {
        let _ = self.bus.release(self.id);
    }
}


#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;

    use alloc::sync::Weak;

    use spin::Mutex;

    use super::{
        mock::{Wire, WireConfig},
        *,
    };

    const SLOW: WireConfig = WireConfig::host(100);
    const FAST: WireConfig = WireConfig::host(400);

    /// Notes, for every configure call, the bus state it could see.
    #[derive(Default)]
    struct Watcher {
        bus: Once<Weak<Bus<Arc<Watcher>>>>,
        seen: Mutex<Vec<(bool, Option<OwnerId>, bool)>>,
    }

    impl BusProtocol for Arc<Watcher> {
        type Config = WireConfig;
        type Channel = u8;

        fn configure(&self, _config: &WireConfig, _channel: Option<u8>) -> DevResult<()> {
            let Some(bus) = self.bus.get().and_then(Weak::upgrade) else {
                return Ok(());
            };
            let locked = bus.state.is_locked();
            // Reading the state would spin forever if the caller still held it.
            let (owner, hold) = if locked { (None, false) } else { (bus.owner(), bus.is_held()) };
            self.seen.lock().push((locked, owner, hold));
            Ok(())
        }

        fn read(&self, _channel: u8, _config: &WireConfig, _pos: Position, _buf: &mut [u8]) -> DevResult<usize> {
            Ok(0)
        }

        fn write(&self, _channel: u8, _config: &WireConfig, _pos: Position, buf: &[u8]) -> DevResult<usize> {
            Ok(buf.len())
        }
    }

    fn bus() -> (Arc<Wire>, Bus<Arc<Wire>>) {
        let wire = Arc::new(Wire::default());
        let bus = Bus::new(wire.clone(), SLOW);
        (wire, bus)
    }

    #[test]
    fn reconfigures_only_on_owner_and_config_change() {
        let (wire, bus) = bus();
        let a = bus.attach();
        let b = bus.attach();

        bus.take(a, &SLOW, None).unwrap();
        bus.release(a).unwrap();
        assert_eq!(wire.configures(), 1);

        // Same owner again: free.
        bus.take(a, &SLOW, None).unwrap();
        bus.release(a).unwrap();
        assert_eq!(wire.configures(), 1);

        // New owner with the applied configuration: no hardware access either.
        bus.take(b, &SLOW, None).unwrap();
        bus.release(b).unwrap();
        assert_eq!(wire.configures(), 1);
        assert_eq!(bus.owner(), Some(b));

        bus.take(a, &FAST, None).unwrap();
        bus.release(a).unwrap();
        assert_eq!(wire.configures(), 2);
        assert_eq!(bus.config(), FAST);
    }

    #[test]
    fn hardware_is_configured_outside_the_state_lock() {
        let watcher = Arc::new(Watcher::default());
        let bus = Arc::new(Bus::new(watcher.clone(), SLOW));
        watcher.bus.call_once(|| Arc::downgrade(&bus));
        let a = bus.attach();

        bus.power_up().unwrap();
        bus.take(a, &FAST, None).unwrap();
        bus.release(a).unwrap();
        bus.reconfigure(&SLOW).unwrap();
        bus.power_down().unwrap();

        assert_eq!(
            *watcher.seen.lock(),
            [
                (false, None, false),
                // The claim is visible while the hardware is set up for it.
                (false, Some(a), true),
                (false, None, true),
                (false, None, false),
            ]
        );
        assert_eq!(bus.owner(), None);
        assert_eq!(bus.config(), WireConfig::disabled());
    }

    #[test]
    fn held_bus_rejects_others() {
        let (_wire, bus) = bus();
        let a = bus.attach();
        let b = bus.attach();

        bus.take(a, &SLOW, None).unwrap();
        assert_eq!(bus.take(b, &SLOW, None), Err(DevError::Busy));
        assert_eq!(bus.release(b), Err(DevError::InvalidArgument));
        // Re-taking by the holder is allowed.
        bus.take(a, &SLOW, None).unwrap();
        bus.release(a).unwrap();
        assert!(!bus.is_held());
        assert_eq!(bus.owner(), Some(a));
        bus.take(b, &SLOW, None).unwrap();
    }

    #[test]
    fn failed_reconfiguration_changes_nothing() {
        let (wire, bus) = bus();
        let a = bus.attach();
        let b = bus.attach();
        bus.take(a, &SLOW, None).unwrap();
        bus.release(a).unwrap();

        wire.fail_configure.store(true, Ordering::Relaxed);
        assert_eq!(bus.take(b, &FAST, None), Err(DevError::Io));
        assert_eq!(bus.owner(), Some(a));
        assert_eq!(bus.config(), SLOW);
        assert!(!bus.is_held());
    }

    #[test]
    fn follower_keeps_the_bus() {
        let (_wire, bus) = bus();
        let follower = bus.attach();
        let host = bus.attach();

        bus.take(follower, &WireConfig::follower(100), None).unwrap();
        bus.release(follower).unwrap();
        assert!(bus.is_held());
        assert_eq!(bus.take(host, &SLOW, None), Err(DevError::Busy));

        bus.disown(follower);
        bus.take(host, &SLOW, None).unwrap();
    }

    #[test]
    fn guard_releases_on_every_path() {
        let (_wire, bus) = bus();
        let a = bus.attach();
        let b = bus.attach();

        let transfer = |fail: bool| -> DevResult<()> {
            let _guard = bus.acquire(a, &SLOW, None)?;
            if fail {
                return Err(DevError::Timeout);
            }
            Ok(())
        };
        assert_eq!(transfer(true), Err(DevError::Timeout));
        assert!(!bus.is_held());
        transfer(false).unwrap();
        assert!(!bus.is_held());

        let guard = bus.acquire(a, &SLOW, None).unwrap();
        assert!(matches!(bus.acquire(b, &SLOW, None), Err(DevError::Busy)));
        drop(guard);
        assert!(bus.acquire(b, &SLOW, None).is_ok());
    }
}
