mod api_client;
mod bluetooth;
mod config;
mod database;
mod models;
mod pipeline;
mod sink;
#[cfg(test)]
mod test_utils;
mod utils;

use log::{error, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use api_client::ApiSink;
use bluetooth::{BluezBroker, DeviceMonitor, DeviceWatchRegistry};
use config::{SensorConfig, SinkTarget};
use database::PgSink;
use pipeline::{ingestion_queue, ForwardingWriter};
use sink::ReadingSink;
use utils::format_datetime;

fn create_sink(target: &SinkTarget) -> Result<Box<dyn ReadingSink>, String> {
    match target {
        SinkTarget::Database(url) => Ok(Box::new(PgSink::new(url)?)),
        SinkTarget::Api(base_url) => {
            let sink = ApiSink::new(base_url)?;
            info!("Posting readings to {}", sink.endpoint());
            Ok(Box::new(sink))
        }
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        result = ctrl_c => {
                            if let Err(e) = result {
                                error!("Failed to listen for Ctrl+C: {}", e);
                            }
                        }
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    error!("Failed to listen for SIGTERM: {}", e);
                    if let Err(e) = ctrl_c.await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                    }
                }
            }
        }

        #[cfg(not(unix))]
        if let Err(e) = ctrl_c.await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }

        info!("Shutdown requested. Exiting gracefully.");
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SensorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let sink = match create_sink(&config.sink) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to set up {}: {}", config.sink.describe(), e);
            return Err(e.into());
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let (sender, receiver) = ingestion_queue();
    let writer = tokio::spawn(
        ForwardingWriter::new(sink, receiver, config.retry_interval, shutdown.clone()).run(),
    );

    let monitor_result = match BluezBroker::new(config.adapter.as_deref()).await {
        Ok(broker) => {
            let monitor = DeviceMonitor::new(
                Arc::new(broker),
                config.allow_list,
                Arc::new(DeviceWatchRegistry::new()),
                sender,
            );
            monitor.run(shutdown.clone()).await.map_err(|e| e.to_string())
        }
        Err(e) => {
            sender.close();
            Err(e.to_string())
        }
    };

    if let Err(e) = &monitor_result {
        error!("Fatal error: {}", e);
        shutdown.cancel();
    }

    let report = writer.await?;
    if !report.undelivered.is_empty() {
        warn!(
            "{} reading(s) were not delivered before shutdown",
            report.undelivered.len()
        );
        for reading in &report.undelivered {
            warn!(
                "  undelivered: {} captured at {}",
                reading.address(),
                format_datetime(&reading.timestamp())
            );
        }
    }

    match monitor_result {
        Ok(()) => {
            info!("Program completed successfully");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
