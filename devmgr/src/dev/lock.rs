//! Non-blocking arbitration over a device and its ancestors.
//!
//! A transfer on a device touches every node between it and the root, so it must claim them
//! all. Claims never wait: a conflict anywhere on the chain fails the whole attempt with
//! [DevError::Busy] and leaves every node as it was.
use alloc::vec::Vec;

use crate::{
    dev::{Device, LockFlags, handle::Handle},
    error::{DevError, DevResult},
    sync::CriticalSection,
};

/// Claim held on a device chain. Released on drop.
pub(crate) struct ChainLock {
    chain: Vec<Handle<Device>>,
    held: LockFlags,
}

impl ChainLock {
    /// Fail if any node in `chain` has a bit of `conflict` set, otherwise set `held` on all of
    /// them.
    pub fn acquire(chain: Vec<Handle<Device>>, conflict: LockFlags, held: LockFlags) -> DevResult<ChainLock> {
        let _section = CriticalSection::enter();
        if chain
            .iter()
            .any(|dev| dev.state.lock().lock.intersects(conflict))
        {
            return Err(DevError::Busy);
        }
        for dev in chain.iter() {
            dev.state.lock().lock.insert(held);
        }
        Ok(ChainLock { chain, held })
    }
}

impl Drop for ChainLock {
    fn drop(&mut self) {
        let _section = CriticalSection::enter();
        for dev in self.chain.iter() {
            dev.state.lock().lock.remove(self.held);
        }
    }
}
