//! Registry of active device watches
use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use crate::bluetooth::broker::WatchHandle;
use crate::models::DeviceAddress;

enum Slot {
    /// Address claimed, subscription still being created
    Pending,
    Active(WatchHandle),
}

#[derive(Default)]
struct Watches {
    slots: HashMap<DeviceAddress, Slot>,
    closed: bool,
}

/// Removes a `Pending` slot unless disarmed once the watch is stored
struct PendingClaim<'a> {
    registry: &'a DeviceWatchRegistry,
    address: DeviceAddress,
    armed: bool,
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut watches = self.registry.lock();
        if matches!(watches.slots.get(&self.address), Some(Slot::Pending)) {
            watches.slots.remove(&self.address);
        }
    }
}

/// Owns every watch handle, keyed by device address.
///
/// Claiming an address happens under a lock before the (asynchronous)
/// subscription is created, so concurrent registrations for the same device
/// produce a single subscription.
#[derive(Default)]
pub struct DeviceWatchRegistry {
    inner: Mutex<Watches>,
}

impl DeviceWatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Watches> {
        // A poisoned map is still structurally valid
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to `address` unless it is already watched
    ///
    /// Returns `Ok(true)` when a new subscription was created and retained,
    /// `Ok(false)` when the address was already registered or the registry
    /// has been released. Subscription errors are returned unchanged and leave
    /// the address unregistered.
    pub async fn try_register<F, Fut, E>(&self, address: DeviceAddress, subscribe: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<WatchHandle, E>>,
    {
        {
            let mut watches = self.lock();
            if watches.closed {
                debug!("[{}] Registry released, not watching", address);
                return Ok(false);
            }
            if watches.slots.contains_key(&address) {
                warn!("[{}] Device already in monitored list. Skipping.", address);
                return Ok(false);
            }
            watches.slots.insert(address, Slot::Pending);
        }
        // Frees the claim if subscribing fails or this future is dropped
        let mut claim = PendingClaim {
            registry: self,
            address,
            armed: true,
        };

        let result = subscribe().await;

        let mut watches = self.lock();
        match result {
            Ok(handle) if watches.closed => {
                drop(watches);
                debug!("[{}] Registry released while subscribing", address);
                handle.release();
                Ok(false)
            }
            Ok(handle) => {
                claim.armed = false;
                watches.slots.insert(address, Slot::Active(handle));
                Ok(true)
            }
            Err(e) => {
                drop(watches);
                Err(e)
            }
        }
    }

    /// Release the watch for one device. Returns whether one was active.
    pub fn deregister(&self, address: &DeviceAddress) -> bool {
        let removed = {
            let mut watches = self.lock();
            match watches.slots.get(address) {
                Some(Slot::Active(_)) => watches.slots.remove(address),
                _ => None,
            }
        };

        match removed {
            Some(Slot::Active(handle)) => {
                handle.release();
                debug!("[{}] Watch released", address);
                true
            }
            _ => false,
        }
    }

    /// Release every watch and refuse further registrations
    ///
    /// Returns how many watches were released by this call; later calls
    /// return 0.
    pub fn release_all(&self) -> usize {
        let handles: Vec<WatchHandle> = {
            let mut watches = self.lock();
            watches.closed = true;
            watches
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Active(handle) => Some(handle),
                    Slot::Pending => None,
                })
                .collect()
        };

        let released = handles.len();
        for handle in handles {
            handle.release();
        }
        released
    }

    /// Number of active watches
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        matches!(self.lock().slots.get(address), Some(Slot::Active(_)))
    }
}
