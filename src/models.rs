//! Shared value types flowing through the ingestion pipeline
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;

/// Bluetooth hardware address of a sensor.
///
/// Stored as raw bytes so that `a4:c1:38:00:11:22` and `A4-C1-38-00-11-22`
/// compare equal. Always displayed in canonical upper-case colon form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub [u8; 6]);

#[derive(Error, Debug, PartialEq)]
pub enum ParseAddressError {
    #[error("invalid address '{0}': expected 6 hex octets")]
    InvalidLength(String),
    #[error("invalid address '{0}': '{1}' is not a hex octet")]
    InvalidOctet(String, String),
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ParseAddressError::InvalidLength(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(ParseAddressError::InvalidOctet(s.to_string(), part.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| ParseAddressError::InvalidOctet(s.to_string(), part.to_string()))?;
        }

        Ok(DeviceAddress(bytes))
    }
}

impl From<bluer::Address> for DeviceAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

impl From<DeviceAddress> for bluer::Address {
    fn from(addr: DeviceAddress) -> Self {
        bluer::Address(addr.0)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One decoded sensor observation.
///
/// A reading always carries at least one measurement; the only way to build
/// one is through [`Reading::signal`] or [`Reading::climate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    address: DeviceAddress,
    #[serde(rename = "receivedSignalStrength")]
    rssi: Option<i32>,
    temperature_celsius: Option<f32>,
    #[serde(rename = "humidity")]
    humidity_percent: Option<f32>,
    #[serde(rename = "battery")]
    battery_percent: Option<i32>,
}

impl Reading {
    /// Signal strength sample, no climate fields.
    pub fn signal(timestamp: OffsetDateTime, address: DeviceAddress, rssi: i16) -> Self {
        Reading {
            timestamp,
            address,
            rssi: Some(i32::from(rssi)),
            temperature_celsius: None,
            humidity_percent: None,
            battery_percent: None,
        }
    }

    /// Temperature, humidity and battery decoded from a vendor payload.
    pub fn climate(
        timestamp: OffsetDateTime,
        address: DeviceAddress,
        temperature_celsius: f32,
        humidity_percent: f32,
        battery_percent: u8,
    ) -> Self {
        Reading {
            timestamp,
            address,
            rssi: None,
            temperature_celsius: Some(temperature_celsius),
            humidity_percent: Some(humidity_percent),
            battery_percent: Some(i32::from(battery_percent)),
        }
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn rssi(&self) -> Option<i32> {
        self.rssi
    }

    pub fn temperature_celsius(&self) -> Option<f32> {
        self.temperature_celsius
    }

    pub fn humidity_percent(&self) -> Option<f32> {
        self.humidity_percent
    }

    pub fn battery_percent(&self) -> Option<i32> {
        self.battery_percent
    }
}
