//! BlueZ device broker over D-Bus
use bluer::{Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty, Session};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bluetooth::broker::{
    BrokerError, DeviceBroker, DeviceProperties, PropertyCallback, PropertyChange, WatchHandle,
};
use crate::models::DeviceAddress;

impl From<bluer::Error> for BrokerError {
    fn from(e: bluer::Error) -> Self {
        BrokerError::Bluetooth(e.to_string())
    }
}

pub struct BluezBroker {
    // Keeps the D-Bus connection alive for the adapter
    _session: Session,
    adapter: Adapter,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluezBroker {
    /// Open a session on the named adapter, or the default one
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, BrokerError> {
        // Initialize Bluetooth session
        let session = Session::new().await.map_err(|e| {
            error!("Failed to create Bluetooth session: {}", e);
            BrokerError::from(e)
        })?;

        let adapter = match adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|e| {
            error!("Failed to get Bluetooth adapter: {}", e);
            BrokerError::from(e)
        })?;

        // Ensure Bluetooth adapter is powered on
        adapter.set_powered(true).await.map_err(|e| {
            error!("Failed to power on adapter {}: {}", adapter.name(), e);
            BrokerError::from(e)
        })?;

        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(BluezBroker {
            _session: session,
            adapter,
            discovery: Mutex::new(None),
        })
    }

    fn take_discovery(&self) -> Option<JoinHandle<()>> {
        self.discovery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Map one BlueZ property update onto the decoder's input
fn property_change(property: DeviceProperty) -> PropertyChange {
    match property {
        DeviceProperty::Rssi(rssi) => PropertyChange::Rssi(rssi),
        DeviceProperty::ManufacturerData(records) => PropertyChange::ManufacturerData(records),
        other => PropertyChange::Other(property_name(&other)),
    }
}

fn property_name(property: &DeviceProperty) -> String {
    let debug = format!("{:?}", property);
    match debug.split_once('(') {
        Some((name, _)) => name.to_string(),
        None => debug,
    }
}

impl DeviceBroker for BluezBroker {
    type Device = Device;

    fn enumerate_devices(&self) -> BoxFuture<'_, Result<Vec<Device>, BrokerError>> {
        async move {
            let addresses = self.adapter.device_addresses().await?;
            let mut devices = Vec::with_capacity(addresses.len());
            for addr in addresses {
                match self.adapter.device(addr) {
                    Ok(device) => devices.push(device),
                    Err(e) => debug!("[{}] Device vanished during enumeration: {}", addr, e),
                }
            }
            Ok(devices)
        }
        .boxed()
    }

    fn get_properties<'a>(
        &'a self,
        device: &'a Device,
    ) -> BoxFuture<'a, Result<DeviceProperties, BrokerError>> {
        async move {
            let address = DeviceAddress::from(device.address());
            let name = device.name().await.map_err(|e| {
                debug!("[{}] Failed to read device name: {}", address, e);
                BrokerError::DeviceGone(address)
            })?;
            Ok(DeviceProperties { address, name })
        }
        .boxed()
    }

    fn watch_property_changes<'a>(
        &'a self,
        device: &'a Device,
        callback: PropertyCallback,
    ) -> BoxFuture<'a, Result<WatchHandle, BrokerError>> {
        async move {
            let address = DeviceAddress::from(device.address());
            let mut events = device.events().await?;

            let pump = tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    #[allow(irrefutable_let_patterns)]
                    if let DeviceEvent::PropertyChanged(property) = event {
                        callback(vec![property_change(property)]);
                    }
                }
                debug!("[{}] Property change stream ended", address);
            });

            Ok(WatchHandle::new(move || pump.abort()))
        }
        .boxed()
    }

    fn start_discovery(&self) -> BoxFuture<'_, Result<BoxStream<'static, Device>, BrokerError>> {
        async move {
            // Configure discovery filter for Low Energy devices only
            let filter = bluer::DiscoveryFilter {
                transport: bluer::DiscoveryTransport::Le,
                duplicate_data: true,
                ..Default::default()
            };
            if let Err(e) = self.adapter.set_discovery_filter(filter).await {
                warn!("Failed to set discovery filter: {}", e);
            }

            let mut adapter_events = self.adapter.discover_devices().await?;
            let adapter = self.adapter.clone();
            let (tx, mut rx) = mpsc::unbounded_channel();

            // Discovery runs for as long as this task holds the event stream
            let pump = tokio::spawn(async move {
                while let Some(event) = adapter_events.next().await {
                    match event {
                        AdapterEvent::DeviceAdded(addr) => match adapter.device(addr) {
                            Ok(device) => {
                                if tx.send(device).is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!("[{}] Discovered device unavailable: {}", addr, e),
                        },
                        other => debug!("Discovery event: {:?}", other),
                    }
                }
            });

            if let Some(previous) = self
                .discovery
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .replace(pump)
            {
                previous.abort();
            }

            Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
        }
        .boxed()
    }

    fn stop_discovery(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        async move {
            match self.take_discovery() {
                Some(pump) => {
                    pump.abort();
                    debug!("Discovery stopped on {}", self.adapter.name());
                }
                None => debug!("Discovery not running"),
            }
            Ok(())
        }
        .boxed()
    }
}
