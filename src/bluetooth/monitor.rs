//! Device discovery and watch lifecycle
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::bluetooth::broker::{BrokerError, DeviceBroker, PropertyCallback, PropertyChange};
use crate::bluetooth::decoder::decode_properties;
use crate::bluetooth::registry::DeviceWatchRegistry;
use crate::config::AllowList;
use crate::models::DeviceAddress;
use crate::pipeline::IngestionSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Enumerating,
    Discovering,
    Stopping,
    Stopped,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Idle => "idle",
            MonitorState::Enumerating => "enumerating",
            MonitorState::Discovering => "discovering",
            MonitorState::Stopping => "stopping",
            MonitorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Failures that stop the monitor. Everything else is logged and absorbed.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to enumerate devices: {0}")]
    Enumeration(#[source] BrokerError),
    #[error("Failed to start discovery: {0}")]
    Discovery(#[source] BrokerError),
    #[error("Monitor cannot start while {0}")]
    NotIdle(MonitorState),
}

/// Everything needed to put one device under watch. Shared with the tasks
/// that register discovered devices.
struct Watcher<B> {
    broker: Arc<B>,
    allow_list: Arc<AllowList>,
    registry: Arc<DeviceWatchRegistry>,
    queue: IngestionSender,
}

impl<B> Clone for Watcher<B> {
    fn clone(&self) -> Self {
        Watcher {
            broker: self.broker.clone(),
            allow_list: self.allow_list.clone(),
            registry: self.registry.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<B: DeviceBroker> Watcher<B> {
    /// Watch `device` if it is allow-listed and not yet watched
    ///
    /// Returns whether a new watch was created. Failures only affect this
    /// device and are logged.
    async fn watch(&self, device: B::Device) -> bool {
        let properties = match self.broker.get_properties(&device).await {
            Ok(properties) => properties,
            Err(e) => {
                warn!("Failed to read device properties, skipping: {}", e);
                return false;
            }
        };

        let address = properties.address;
        if !self.allow_list.contains(&address) {
            debug!("[{}] Not in allow-list, ignoring", address);
            return false;
        }

        let broker = &self.broker;
        let device = &device;
        let callback = self.property_callback(address);
        match self
            .registry
            .try_register(address, move || broker.watch_property_changes(device, callback))
            .await
        {
            Ok(true) => {
                info!(
                    "[{}] Monitoring {} ({} device(s) watched)",
                    address,
                    properties.name.as_deref().unwrap_or("unnamed device"),
                    self.registry.len()
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!("[{}] Failed to watch property changes: {}", address, e);
                false
            }
        }
    }

    /// Decode each batch of changes and hand the readings to the queue
    fn property_callback(&self, address: DeviceAddress) -> PropertyCallback {
        let queue = self.queue.clone();
        Arc::new(move |changes: Vec<PropertyChange>| {
            for reading in decode_properties(OffsetDateTime::now_utc(), address, &changes) {
                if let Err(e) = queue.enqueue(reading) {
                    warn!("[{}] {}", address, e);
                }
            }
        })
    }
}

/// Finds allow-listed sensors and keeps one property watch per sensor.
///
/// Known devices are watched first, then live discovery picks up sensors
/// that come into range later. Every decoded reading is appended to the
/// ingestion queue.
pub struct DeviceMonitor<B> {
    watcher: Watcher<B>,
    state: Mutex<MonitorState>,
}

impl<B: DeviceBroker> DeviceMonitor<B> {
    pub fn new(
        broker: Arc<B>,
        allow_list: AllowList,
        registry: Arc<DeviceWatchRegistry>,
        queue: IngestionSender,
    ) -> Self {
        DeviceMonitor {
            watcher: Watcher {
                broker,
                allow_list: Arc::new(allow_list),
                registry,
                queue,
            },
            state: Mutex::new(MonitorState::Idle),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.lock_state()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: MonitorState) {
        let mut state = self.lock_state();
        debug!("Device monitor {} -> {}", *state, next);
        *state = next;
    }

    /// Move from `from` to `to`; false if the state changed underneath
    fn transition(&self, from: MonitorState, to: MonitorState) -> bool {
        let mut state = self.lock_state();
        if *state != from {
            return false;
        }
        debug!("Device monitor {} -> {}", from, to);
        *state = to;
        true
    }

    /// Watch devices until `shutdown` fires, then stop
    ///
    /// Enumeration and discovery-start failures are fatal: the monitor shuts
    /// itself down and returns the error.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), MonitorError> {
        {
            let mut state = self.lock_state();
            if *state != MonitorState::Idle {
                return Err(MonitorError::NotIdle(*state));
            }
            *state = MonitorState::Enumerating;
        }

        info!("Enumerating known devices");
        let devices = match self.watcher.broker.enumerate_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                self.shutdown().await;
                return Err(MonitorError::Enumeration(e));
            }
        };

        let mut watched = 0;
        for device in devices {
            if self.watcher.watch(device).await {
                watched += 1;
            }
        }
        info!("Watching {} known device(s)", watched);

        let mut discovered = match self.watcher.broker.start_discovery().await {
            Ok(stream) => stream,
            Err(e) => {
                self.shutdown().await;
                return Err(MonitorError::Discovery(e));
            }
        };
        if !self.transition(MonitorState::Enumerating, MonitorState::Discovering) {
            // shutdown() ran while enumerating and could not stop this scan
            if let Err(e) = self.watcher.broker.stop_discovery().await {
                warn!("Failed to stop discovery: {}", e);
            }
            return Ok(());
        }
        info!("Discovery started");

        let mut discovering = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = discovered.next(), if discovering => match next {
                    Some(device) => {
                        let watcher = self.watcher.clone();
                        tokio::spawn(async move {
                            watcher.watch(device).await;
                        });
                    }
                    None => {
                        warn!("Discovery stream ended, existing watches stay active");
                        discovering = false;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop discovery, release every watch and close the queue
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if matches!(*state, MonitorState::Stopping | MonitorState::Stopped) {
                debug!("Device monitor already {}", *state);
                return;
            }
            *state = MonitorState::Stopping;
        }
        info!("Stopping device monitor");

        if let Err(e) = self.watcher.broker.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }

        let released = self.watcher.registry.release_all();
        self.watcher.queue.close();

        self.set_state(MonitorState::Stopped);
        info!(
            "Device monitor stopped, released {} watch(es), {} reading(s) left to forward",
            released,
            self.watcher.queue.depth()
        );
    }
}
