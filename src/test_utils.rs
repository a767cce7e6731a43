//! Scripted stand-ins for the radio and the sink, shared by unit tests
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bluetooth::broker::{
    BrokerError, DeviceBroker, DeviceProperties, PropertyCallback, PropertyChange, WatchHandle,
};
use crate::models::{DeviceAddress, Reading};
use crate::sink::{ReadingSink, SinkError};

pub const TEST_ADDRESS: DeviceAddress = DeviceAddress([0xA4, 0xC1, 0x38, 0x0D, 0x3E, 0x7F]);

pub fn signal_reading(address: DeviceAddress, rssi: i16) -> Reading {
    Reading::signal(OffsetDateTime::now_utc(), address, rssi)
}

/// The reading decoded from the payload `00-01-8C-28-3C-00` (0x018C28 = 101416)
pub fn climate_reading(address: DeviceAddress) -> Reading {
    Reading::climate(OffsetDateTime::now_utc(), address, 10.1416, 41.6, 60)
}

thread_local! {
    static CAPTURED: RefCell<Option<Vec<(Level, String)>>> = const { RefCell::new(None) };
}

/// Records log lines for the threads that asked for them
struct ThreadLogger;

impl Log for ThreadLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        CAPTURED.with(|captured| {
            if let Some(lines) = captured.borrow_mut().as_mut() {
                lines.push((record.level(), record.args().to_string()));
            }
        });
    }

    fn flush(&self) {}
}

static LOGGER: ThreadLogger = ThreadLogger;

/// Run `f` and return what it logged on the current thread
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, Vec<(Level, String)>) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });

    CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
    let output = f();
    let lines = CAPTURED.with(|captured| captured.borrow_mut().take().unwrap_or_default());
    (output, lines)
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Sink that replays scripted results and records every attempt
pub struct FakeSink {
    script: Mutex<VecDeque<Result<(), SinkError>>>,
    always_fail: bool,
    latency: Option<Duration>,
    delivered: Mutex<Vec<Reading>>,
    attempts: Mutex<Vec<Instant>>,
}

impl FakeSink {
    /// Results are consumed in order; once exhausted every attempt succeeds.
    pub fn scripted(results: Vec<Result<(), SinkError>>) -> Self {
        FakeSink {
            script: Mutex::new(results.into()),
            always_fail: false,
            latency: None,
            delivered: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Every attempt fails with a transient error
    pub fn failing() -> Self {
        FakeSink {
            always_fail: true,
            ..Self::scripted(Vec::new())
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn delivered(&self) -> Vec<Reading> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

impl ReadingSink for FakeSink {
    fn name(&self) -> &'static str {
        "fake sink"
    }

    fn send<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            self.attempts.lock().unwrap().push(Instant::now());
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            let result = if self.always_fail {
                Err(SinkError::Transient("sink down".to_string()))
            } else {
                self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
            };

            if result.is_ok() {
                self.delivered.lock().unwrap().push(reading.clone());
            }
            result
        }
        .boxed()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeDevice {
    pub address: DeviceAddress,
    pub name: Option<String>,
}

impl FakeDevice {
    pub fn new(address: DeviceAddress) -> Self {
        FakeDevice {
            address,
            name: Some(format!("GVH5075_{:02X}{:02X}", address.0[4], address.0[5])),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    devices: Vec<FakeDevice>,
    callbacks: HashMap<DeviceAddress, PropertyCallback>,
    discovery: Option<mpsc::UnboundedSender<FakeDevice>>,
    unreadable: HashSet<DeviceAddress>,
    fail_enumeration: bool,
    fail_discovery: bool,
    fail_stop: bool,
}

/// Broker driven entirely by the test
///
/// Tests inject discoveries with [`FakeBroker::discover`] and property
/// changes with [`FakeBroker::emit`], and inspect the subscription counters.
#[derive(Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    subscribes: AtomicUsize,
    releases: Arc<AtomicUsize>,
    discovery_starts: AtomicUsize,
    discovery_stops: AtomicUsize,
}

impl FakeBroker {
    pub fn with_devices(devices: Vec<FakeDevice>) -> Self {
        let broker = FakeBroker::default();
        broker.state.lock().unwrap().devices = devices;
        broker
    }

    pub fn fail_enumeration(self) -> Self {
        self.state.lock().unwrap().fail_enumeration = true;
        self
    }

    pub fn fail_discovery(self) -> Self {
        self.state.lock().unwrap().fail_discovery = true;
        self
    }

    pub fn fail_stop(self) -> Self {
        self.state.lock().unwrap().fail_stop = true;
        self
    }

    /// `get_properties` fails for this device
    pub fn unreadable(self, address: DeviceAddress) -> Self {
        self.state.lock().unwrap().unreadable.insert(address);
        self
    }

    /// Announce a device on the discovery stream. False when not discovering.
    pub fn discover(&self, device: FakeDevice) -> bool {
        match &self.state.lock().unwrap().discovery {
            Some(tx) => tx.send(device).is_ok(),
            None => false,
        }
    }

    /// Deliver property changes to the device's subscriber, if any
    pub fn emit(&self, address: DeviceAddress, changes: Vec<PropertyChange>) -> bool {
        let callback = self.state.lock().unwrap().callbacks.get(&address).cloned();
        match callback {
            Some(callback) => {
                callback(changes);
                true
            }
            None => false,
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.state.lock().unwrap().discovery.is_some()
    }

    pub fn is_watched(&self, address: DeviceAddress) -> bool {
        self.state.lock().unwrap().callbacks.contains_key(&address)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn discovery_starts(&self) -> usize {
        self.discovery_starts.load(Ordering::SeqCst)
    }

    pub fn discovery_stops(&self) -> usize {
        self.discovery_stops.load(Ordering::SeqCst)
    }
}

impl DeviceBroker for FakeBroker {
    type Device = FakeDevice;

    fn enumerate_devices(&self) -> BoxFuture<'_, Result<Vec<FakeDevice>, BrokerError>> {
        async move {
            let state = self.state.lock().unwrap();
            if state.fail_enumeration {
                return Err(BrokerError::Bluetooth("org.bluez.Error.NotReady".to_string()));
            }
            Ok(state.devices.clone())
        }
        .boxed()
    }

    fn get_properties<'a>(
        &'a self,
        device: &'a FakeDevice,
    ) -> BoxFuture<'a, Result<DeviceProperties, BrokerError>> {
        async move {
            if self.state.lock().unwrap().unreadable.contains(&device.address) {
                return Err(BrokerError::DeviceGone(device.address));
            }
            Ok(DeviceProperties {
                address: device.address,
                name: device.name.clone(),
            })
        }
        .boxed()
    }

    fn watch_property_changes<'a>(
        &'a self,
        device: &'a FakeDevice,
        callback: PropertyCallback,
    ) -> BoxFuture<'a, Result<WatchHandle, BrokerError>> {
        async move {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.state
                .lock()
                .unwrap()
                .callbacks
                .insert(device.address, callback);

            let state = self.state.clone();
            let releases = self.releases.clone();
            let address = device.address;
            Ok(WatchHandle::new(move || {
                releases.fetch_add(1, Ordering::SeqCst);
                state.lock().unwrap().callbacks.remove(&address);
            }))
        }
        .boxed()
    }

    fn start_discovery(
        &self,
    ) -> BoxFuture<'_, Result<BoxStream<'static, FakeDevice>, BrokerError>> {
        async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_discovery {
                return Err(BrokerError::Bluetooth("org.bluez.Error.InProgress".to_string()));
            }
            self.discovery_starts.fetch_add(1, Ordering::SeqCst);

            let (tx, mut rx) = mpsc::unbounded_channel();
            state.discovery = Some(tx);
            Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
        }
        .boxed()
    }

    fn stop_discovery(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        async move {
            self.discovery_stops.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().unwrap();
            state.discovery = None;
            if state.fail_stop {
                return Err(BrokerError::Bluetooth("org.bluez.Error.Failed".to_string()));
            }
            Ok(())
        }
        .boxed()
    }
}
