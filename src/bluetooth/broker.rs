//! Device broker capability consumed by the monitor
//!
//! The broker is whatever owns the radio: it enumerates known devices, runs
//! discovery and delivers per-device property changes. The monitor only talks
//! to it through [`DeviceBroker`] so a scripted broker can stand in for BlueZ.

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::models::DeviceAddress;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    #[error("Device {0} is no longer available")]
    DeviceGone(DeviceAddress),
}

/// A single changed property from a device's property-change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyChange {
    /// Received signal strength in dBm
    Rssi(i16),
    /// Vendor payloads keyed by 16-bit company/record identifier
    ManufacturerData(HashMap<u16, Vec<u8>>),
    /// Any other property, identified by name only
    Other(String),
}

/// Static properties of a known device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProperties {
    pub address: DeviceAddress,
    pub name: Option<String>,
}

/// Receives every batch of property changes observed for one device.
pub type PropertyCallback = Arc<dyn Fn(Vec<PropertyChange>) + Send + Sync>;

/// An active subscription to one device's property changes.
///
/// The subscription is released exactly once: by [`WatchHandle::release`] or,
/// failing that, when the handle is dropped.
pub struct WatchHandle {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        WatchHandle {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn release(mut self) {
        self.unsubscribe_once();
    }

    fn unsubscribe_once(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.unsubscribe_once();
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Capability for discovering devices and subscribing to their advertisements.
pub trait DeviceBroker: Send + Sync + 'static {
    /// Opaque handle identifying one device to the broker
    type Device: Clone + Send + Sync + 'static;

    /// All devices the broker currently knows about.
    fn enumerate_devices(&self) -> BoxFuture<'_, Result<Vec<Self::Device>, BrokerError>>;

    fn get_properties<'a>(
        &'a self,
        device: &'a Self::Device,
    ) -> BoxFuture<'a, Result<DeviceProperties, BrokerError>>;

    /// Subscribe `callback` to the device's property changes until the
    /// returned handle is released.
    fn watch_property_changes<'a>(
        &'a self,
        device: &'a Self::Device,
        callback: PropertyCallback,
    ) -> BoxFuture<'a, Result<WatchHandle, BrokerError>>;

    /// Start scanning. The returned stream yields every device found while
    /// discovery is running and ends once [`DeviceBroker::stop_discovery`] runs.
    fn start_discovery(
        &self,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Self::Device>, BrokerError>>;

    /// Stop scanning. Calling this when discovery is not running is a no-op.
    fn stop_discovery(&self) -> BoxFuture<'_, Result<(), BrokerError>>;
}
