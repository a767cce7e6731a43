//! Database operations for storing sensor readings
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{info, warn};
use std::error::Error as _;
use tokio_postgres::Client;

use crate::database::connection::DatabaseTarget;
use crate::models::Reading;
use crate::sink::{ReadingSink, SinkError};

const INSERT_READING: &str = "INSERT INTO govee (timestamp, address, rssi, temp_c, humidity, battery) \
     VALUES ($1, $2::text::macaddr8, $3, $4, $5, $6)";

/// Store one reading in the govee table
///
/// Absent measurements are written as SQL NULL.
pub async fn insert_reading(
    client: &Client,
    reading: &Reading,
) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            INSERT_READING,
            &[
                &reading.timestamp(),
                &reading.address().to_string(),
                &reading.rssi(),
                &reading.temperature_celsius(),
                &reading.humidity_percent(),
                &reading.battery_percent(),
            ],
        )
        .await
}

/// Sink writing each reading to PostgreSQL over a fresh connection
pub struct PgSink {
    target: DatabaseTarget,
}

impl PgSink {
    pub fn new(database_url: &str) -> Result<Self, String> {
        let target = DatabaseTarget::parse(database_url)?;
        if target.uses_tls() {
            info!("Database connections use TLS");
        } else {
            warn!("Database connections are not encrypted");
        }
        Ok(PgSink { target })
    }

    async fn store(&self, reading: &Reading) -> Result<(), SinkError> {
        // Any failure to get a connection is worth retrying
        let client = self
            .target
            .connect()
            .await
            .map_err(|e| SinkError::Transient(format!("Failed to open database connection: {}", e)))?;

        insert_reading(&client, reading)
            .await
            .map(|_| ())
            .map_err(|e| classify_statement_error(&e))
    }
}

impl ReadingSink for PgSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn send<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        self.store(reading).boxed()
    }
}

/// Decide whether a failed statement may succeed on a later attempt
fn classify_statement_error(e: &tokio_postgres::Error) -> SinkError {
    if e.is_closed() {
        return SinkError::Transient(e.to_string());
    }

    match e.code() {
        Some(state) if is_transient_sqlstate(state.code()) => SinkError::Transient(e.to_string()),
        Some(_) => SinkError::Permanent(e.to_string()),
        None if has_io_source(e) => SinkError::Transient(e.to_string()),
        None => SinkError::Permanent(e.to_string()),
    }
}

/// Connection exceptions, insufficient resources and operator intervention
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("53") || code.starts_with("57P")
}

fn has_io_source(e: &tokio_postgres::Error) -> bool {
    let mut source = e.source();
    while let Some(cause) = source {
        if cause.is::<std::io::Error>() {
            return true;
        }
        source = cause.source();
    }
    false
}
