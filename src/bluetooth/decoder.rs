//! Govee advertisement decoding
use log::{debug, warn};
use std::collections::HashMap;
use thiserror::Error;
use time::OffsetDateTime;

use crate::bluetooth::broker::PropertyChange;
use crate::models::{DeviceAddress, Reading};

// Govee protocol constants
pub const GOVEE_RECORD_ID: u16 = 0xEC88; // Thermo-hygrometer record tag
pub const GOVEE_PAYLOAD_LEN: usize = 6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Govee payload has {0} bytes, expected 6")]
    InvalidLength(usize),
}

/// Decode a Govee thermo-hygrometer payload
///
/// The 6-byte payload has the following structure:
/// - Byte 0: Reserved (zero)
/// - Bytes 1-3: Combined temperature and humidity (unsigned 24-bit, big-endian)
/// - Byte 4: Battery level in percent
/// - Byte 5: Reserved (zero)
///
/// Temperature is `combined / 10000` °C and humidity is `(combined % 1000) / 10` %.
pub fn decode_govee_payload(
    timestamp: OffsetDateTime,
    address: DeviceAddress,
    data: &[u8],
) -> Result<Reading, DecodeError> {
    if data.len() != GOVEE_PAYLOAD_LEN {
        return Err(DecodeError::InvalidLength(data.len()));
    }

    let combined = u32::from(data[1]) << 16 | u32::from(data[2]) << 8 | u32::from(data[3]);
    let temperature = combined as f32 / 10000.0;
    let humidity = (combined % 1000) as f32 / 10.0;
    let battery = data[4];

    Ok(Reading::climate(
        timestamp, address, temperature, humidity, battery,
    ))
}

/// Turn one batch of property changes into readings
///
/// Never fails: anything that cannot be decoded is logged and skipped.
pub fn decode_properties(
    timestamp: OffsetDateTime,
    address: DeviceAddress,
    changes: &[PropertyChange],
) -> Vec<Reading> {
    let mut readings = Vec::new();

    for change in changes {
        match change {
            PropertyChange::Rssi(rssi) => {
                debug!("[{}] RSSI: {}", address, rssi);
                readings.push(Reading::signal(timestamp, address, *rssi));
            }
            PropertyChange::ManufacturerData(records) => {
                readings.extend(decode_manufacturer_data(timestamp, address, records));
            }
            PropertyChange::Other(name) => {
                debug!("[{}] No handler for property {}", address, name);
            }
        }
    }

    readings
}

fn decode_manufacturer_data(
    timestamp: OffsetDateTime,
    address: DeviceAddress,
    records: &HashMap<u16, Vec<u8>>,
) -> Vec<Reading> {
    let mut readings = Vec::new();

    for (&record_id, data) in records {
        if record_id != GOVEE_RECORD_ID {
            debug!(
                "[{}] Ignoring manufacturer record 0x{:04X}: {}",
                address,
                record_id,
                hex(data)
            );
            continue;
        }

        match decode_govee_payload(timestamp, address, data) {
            Ok(reading) => {
                debug!(
                    "[{}] temp={:.2}°C, humidity={:.1}%, battery={}%",
                    address,
                    reading.temperature_celsius().unwrap_or_default(),
                    reading.humidity_percent().unwrap_or_default(),
                    reading.battery_percent().unwrap_or_default()
                );
                readings.push(reading);
            }
            Err(e) => warn!("[{}] {}: {}", address, e, hex(data)),
        }
    }

    readings
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("-")
}
