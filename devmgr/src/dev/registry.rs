//! Device tree, path resolution and the descriptor-based I/O surface.
//!
//! Paths are `/`-separated device names resolved from the root node `dev`. A leading `/` and a
//! leading `dev/` are both optional, so `"/dev/spi1/flash"`, `"/spi1/flash"` and `"spi1/flash"`
//! name the same device. Lookups skip empty segments, registration rejects them.
//!
//! Opening a device opens its whole ancestor chain: a bus member cannot be used while its bus is
//! down. Each level counts the descriptors open in its subtree and the hardware is brought up on
//! the first open and shut down on the last close.
use alloc::{boxed::Box, string::String, vec::Vec};

use crate::{
    dev::{
        Capability, Device, DeviceClass, DeviceOps, LockFlags, OpenFlags, Transfer,
        desc::{Descriptor, DescriptorTable, Direction},
        device::ROOT_NAME,
        handle::Handle,
        ioctl::{Callback, Command, IoctlArg},
        lock::ChainLock,
    },
    error::{DevError, DevResult},
    sync::CriticalSection,
};

pub struct Registry {
    root: Handle<Device>,
    pub(crate) descs: DescriptorTable,
}

/// Result of [Registry::access].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Opened(Descriptor),
    Query(Capability),
}

/// Drop the optional leading `/` and `dev/` from a path.
fn strip_root(path: &str) -> &str {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.strip_prefix(ROOT_NAME) {
        Some("") => "",
        Some(rest) => rest.strip_prefix('/').unwrap_or(path),
        None => path,
    }
}

/// Split a path into device names below the root.
fn split_path(path: &str) -> Vec<&str> {
    strip_root(path).split('/').filter(|name| !name.is_empty()).collect()
}

/// Split a path given for registration. Every segment must be a valid name.
fn split_new_path(path: &str) -> DevResult<Vec<&str>> {
    let path = strip_root(path);
    if path.is_empty() {
        return Err(DevError::InvalidArgument);
    }
    let segments: Vec<&str> = path.split('/').collect();
    for name in segments.iter() {
        check_name(name)?;
    }
    Ok(segments)
}

fn check_name(name: &str) -> DevResult<()> {
    if name.is_empty() || name.len() > config::NAME_MAX {
        return Err(DevError::InvalidArgument);
    }
    Ok(())
}

impl Registry {
    /// Create an empty tree with the configured number of descriptor slots.
    pub fn new() -> Registry {
        Registry::with_capacity(config::DESC_MAX)
    }

    pub fn with_capacity(descriptors: usize) -> Registry {
        Registry {
            root: Device::new_root(),
            descs: DescriptorTable::new(descriptors),
        }
    }

    pub fn root(&self) -> &Handle<Device> {
        &self.root
    }

    pub fn descriptor_capacity(&self) -> usize {
        self.descs.capacity()
    }

    /// Number of descriptors currently open.
    pub fn open_descriptors(&self) -> usize {
        self.descs.in_use()
    }

    // region: tree

    /// Attach a device under the node named by all but the last segment of `path`.
    ///
    /// The parent must already exist: [DevError::NotFound] otherwise. A sibling with the same
    /// name gives [DevError::AlreadyExists]. An empty path, an empty segment or any name longer
    /// than `NAME_MAX` gives [DevError::InvalidArgument].
    pub fn register<O: DeviceOps + 'static>(
        &self,
        path: &str,
        class: DeviceClass,
        caps: Capability,
        ops: O,
    ) -> DevResult<Handle<Device>> {
        let segments = split_new_path(path)?;
        let (name, parents) = segments.split_last().ok_or(DevError::InvalidArgument)?;
        let parent = self.walk(parents)?;

        let dev = {
            let _section = CriticalSection::enter();
            let mut children = parent.children_mut();
            if children.iter().any(|child| child.name() == *name) {
                return Err(DevError::AlreadyExists);
            }
            let dev = Device::new_child(&parent, name, class, caps, Box::new(ops));
            children.push(dev.clone());
            dev
        };
        debug_ex!("Registered {:?} device '{}'.", class, self.path_of(&dev));
        Ok(dev)
    }

    pub fn find(&self, path: &str) -> DevResult<Handle<Device>> {
        self.walk(&split_path(path))
    }

    fn walk(&self, names: &[&str]) -> DevResult<Handle<Device>> {
        let mut node = self.root.clone();
        for name in names {
            node = node.child(name).ok_or(DevError::NotFound)?;
        }
        Ok(node)
    }

    /// Capabilities of the device at `path`, without opening it.
    pub fn query(&self, path: &str) -> DevResult<Capability> {
        Ok(self.find(path)?.capability())
    }

    /// Full path of `dev`, e.g. `/dev/spi1/flash`.
    pub fn path_of(&self, dev: &Device) -> String {
        let mut path = String::from("/");
        path.push_str(ROOT_NAME);
        for node in dev.lineage().iter().rev() {
            path.push('/');
            path.push_str(node.name());
        }
        path
    }

    /// Visit every registered device depth-first, parents before children. The root is not
    /// visited; its children have depth 0.
    pub fn for_each(&self, mut visit: impl FnMut(usize, &Handle<Device>)) {
        fn walk(node: &Handle<Device>, depth: usize, visit: &mut dyn FnMut(usize, &Handle<Device>)) {
            for child in node.children() {
                visit(depth, &child);
                walk(&child, depth + 1, visit);
            }
        }
        walk(&self.root, 0, &mut visit);
    }

    // endregion

    // region: open and close

    /// Open the device at `path`, or with [OpenFlags::QUERY] only report its capabilities.
    ///
    /// A query takes no descriptor slot and does not touch the hardware.
    pub fn access(&self, path: &str, flags: OpenFlags) -> DevResult<Access> {
        if flags.contains(OpenFlags::QUERY) {
            return self.query(path).map(Access::Query);
        }
        self.open(path, flags).map(Access::Opened)
    }

    /// Open the device at `path` and return a new descriptor.
    ///
    /// [OpenFlags::QUERY] is refused with [DevError::InvalidArgument]: a query has no
    /// descriptor to return. Use [Registry::access] or [Registry::query].
    pub fn open(&self, path: &str, flags: OpenFlags) -> DevResult<Descriptor> {
        if flags.contains(OpenFlags::QUERY) {
            return Err(DevError::InvalidArgument);
        }
        let dev = self.find(path)?;
        if dev.is_root() {
            return Err(DevError::InvalidArgument);
        }
        if !dev.capability().contains(flags.required()) {
            return Err(DevError::NotSupported);
        }
        let desc = self.descs.allocate(dev.clone(), flags)?;
        if let Err(err) = Self::open_chain(&dev) {
            let _ = self.descs.free(desc);
            return Err(err);
        }
        debug_ex!("Opened '{}' as descriptor {}.", self.path_of(&dev), desc.index());
        Ok(desc)
    }

    /// Release a descriptor.
    ///
    /// The slot is freed and its callbacks are dropped even when the hardware fails to shut
    /// down; that failure is still returned.
    pub fn close(&self, desc: Descriptor) -> DevResult<()> {
        let slot = self.descs.free(desc)?;
        {
            let mut state = slot.device.state.lock();
            state.rd_waiters.retain(|waiter| *waiter != desc);
            state.wr_waiters.retain(|waiter| *waiter != desc);
        }
        debug_ex!("Closing descriptor {}.", desc.index());
        Self::close_chain(&slot.device)
    }

    /// Count one more open on every level from the top ancestor down to `dev`.
    fn open_chain(dev: &Device) -> DevResult<()> {
        let chain = dev.lineage();
        for (taken, node) in chain.iter().rev().enumerate() {
            if let Err(err) = Self::retain(node) {
                // Undo the levels above, innermost first.
                for level in chain[chain.len() - taken..].iter() {
                    let _ = Self::release(level);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Count one less open on every level from `dev` up to the top ancestor.
    fn close_chain(dev: &Device) -> DevResult<()> {
        let mut result = Ok(());
        for node in dev.lineage().iter() {
            if let Err(err) = Self::release(node) {
                log::warn!("Closing device '{}' failed: {}", node.name(), err);
                result = result.and(Err(err));
            }
        }
        result
    }

    fn retain(node: &Device) -> DevResult<()> {
        let first = {
            let mut state = node.state.lock();
            if state.ref_count > 0 && node.capability().contains(Capability::EXCLUSIVE) {
                return Err(DevError::Busy);
            }
            state.ref_count += 1;
            state.ref_count == 1
        };
        if first {
            if let Err(err) = node.ops().open(node) {
                node.state.lock().ref_count -= 1;
                return Err(err);
            }
        }
        Ok(())
    }

    fn release(node: &Device) -> DevResult<()> {
        let last = {
            let mut state = node.state.lock();
            state.ref_count = state.ref_count.saturating_sub(1);
            if state.ref_count == 0 {
                state.lock = LockFlags::empty();
            }
            state.ref_count == 0
        };
        if last {
            node.ops().close(node)?;
        }
        Ok(())
    }

    // endregion

    // region: io

    pub fn device(&self, desc: Descriptor) -> DevResult<Handle<Device>> {
        Ok(self.descs.get(desc)?.device)
    }

    /// Name of the device behind `desc`.
    pub fn name(&self, desc: Descriptor) -> DevResult<String> {
        Ok(String::from(self.device(desc)?.name()))
    }

    /// Read from the descriptor's current position.
    ///
    /// Fails with [DevError::Busy] instead of waiting while another read is running anywhere on
    /// the device's chain.
    pub fn read(&self, desc: Descriptor, buf: &mut [u8]) -> DevResult<usize> {
        let slot = self.descs.get(desc)?;
        if !slot.flags.contains(OpenFlags::READ) {
            return Err(DevError::NotSupported);
        }
        let _claim = ChainLock::acquire(slot.device.lineage(), LockFlags::READ, LockFlags::READ)?;
        slot.device
            .ops()
            .read(&slot.device, slot.position, buf, slot.flags.transfer())
    }

    /// Write at the descriptor's current position.
    ///
    /// On a non-blocking descriptor the device stays marked as having a write in flight once a
    /// non-empty write was accepted, until its interrupt handler reports completion. No other
    /// write to it is admitted meanwhile.
    pub fn write(&self, desc: Descriptor, buf: &[u8]) -> DevResult<usize> {
        let slot = self.descs.get(desc)?;
        if !slot.flags.contains(OpenFlags::WRITE) {
            return Err(DevError::NotSupported);
        }
        let dev = &slot.device;
        let _claim = ChainLock::acquire(dev.lineage(), LockFlags::WRITE | LockFlags::NONBLOCK, LockFlags::WRITE)?;
        let mode = slot.flags.transfer();
        if mode == Transfer::Sync {
            return dev.ops().write(dev, slot.position, buf, mode);
        }

        // Marked before the transfer starts: completion may be reported before it returns.
        dev.state.lock().lock.insert(LockFlags::NONBLOCK);
        let result = dev.ops().write(dev, slot.position, buf, mode);
        if !matches!(result, Ok(size) if size > 0) {
            dev.state.lock().lock.remove(LockFlags::NONBLOCK);
        }
        result
    }

    /// Run a control command.
    ///
    /// Position and callback commands act on the descriptor itself. Everything else goes to the
    /// driver and needs exclusive use of the device chain.
    pub fn ioctl(&self, desc: Descriptor, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        if cmd.is_registry_command() {
            return self.descriptor_ioctl(desc, cmd, arg);
        }
        let slot = self.descs.get(desc)?;
        let _claim = ChainLock::acquire(
            slot.device.lineage(),
            LockFlags::RDWR | LockFlags::NONBLOCK,
            LockFlags::RDWR,
        )?;
        slot.device.ops().ioctl(&slot.device, slot.position, cmd, arg)
    }

    fn descriptor_ioctl(&self, desc: Descriptor, cmd: Command, arg: IoctlArg<'_>) -> DevResult<usize> {
        match cmd {
            Command::SetPosition => {
                let position = arg.int()?;
                self.descs.with_slot(desc, |slot| slot.position = position)?;
                Ok(size_of::<i32>())
            }
            Command::GetPosition => arg.store_int(self.descs.get(desc)?.position),
            Command::SetReadCallback => self.set_callback(desc, Direction::Read, arg),
            Command::SetWriteCallback => self.set_callback(desc, Direction::Write, arg),
            Command::GetReadCallback => self.get_callback(desc, Direction::Read, arg),
            Command::GetWriteCallback => self.get_callback(desc, Direction::Write, arg),
            _ => Err(DevError::NotSupported),
        }
    }

    fn set_callback(&self, desc: Descriptor, direction: Direction, arg: IoctlArg<'_>) -> DevResult<usize> {
        let IoctlArg::Callback(call) = arg else {
            return Err(DevError::InvalidArgument);
        };
        let installed = call.is_some();
        let dev = self.descs.with_slot(desc, |slot| {
            *slot.callback_mut(direction) = call;
            slot.device.clone()
        })?;

        let mut state = dev.state.lock();
        let waiters = match direction {
            Direction::Read => &mut state.rd_waiters,
            Direction::Write => &mut state.wr_waiters,
        };
        waiters.retain(|waiter| *waiter != desc);
        if installed {
            waiters.push(desc);
        }
        Ok(size_of::<Callback>())
    }

    fn get_callback(&self, desc: Descriptor, direction: Direction, arg: IoctlArg<'_>) -> DevResult<usize> {
        let IoctlArg::CallbackOut(out) = arg else {
            return Err(DevError::InvalidArgument);
        };
        *out = self
            .descs
            .with_slot(desc, |slot| slot.callback(direction).cloned())?;
        Ok(size_of::<Callback>())
    }

    // endregion
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
