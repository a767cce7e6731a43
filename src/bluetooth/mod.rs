pub mod bluez;
pub mod broker;
pub mod decoder;
pub mod monitor;
pub mod registry;

pub use bluez::BluezBroker;
pub use monitor::DeviceMonitor;
pub use registry::DeviceWatchRegistry;
