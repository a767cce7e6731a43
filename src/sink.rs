//! Destination for decoded readings
use futures_util::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

use crate::models::Reading;

/// Failure to deliver one reading, classified by whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// The sink could not be reached; the same reading should be retried
    #[error("sink unavailable: {0}")]
    Transient(String),
    /// The sink refused the reading; retrying would fail the same way
    #[error("sink rejected reading: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// A place readings are forwarded to, one at a time.
pub trait ReadingSink: Send + Sync {
    /// Short name used in log messages
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>>;
}

impl<S: ReadingSink + ?Sized> ReadingSink for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn send<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        (**self).send(reading)
    }
}

impl<S: ReadingSink + ?Sized> ReadingSink for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn send<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        (**self).send(reading)
    }
}
