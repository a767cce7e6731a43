//! Sink posting readings to the sensor collection API
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

use crate::models::Reading;
use crate::sink::{ReadingSink, SinkError};

/// Collection endpoint, relative to the configured base URL
pub const COLLECTION_PATH: &str = "api/govee";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ApiSink {
    client: Client,
    endpoint: Url,
}

impl ApiSink {
    pub fn new(base_url: &Url) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| format!("HTTP client error: {}", e))?;

        Ok(ApiSink {
            client,
            endpoint: collection_endpoint(base_url)?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// POST the reading as a single-element JSON array
    async fn post(&self, reading: &Reading) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&[reading])
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if is_transient_status(status) {
            Err(SinkError::Transient(format!("collection API returned {}", status)))
        } else {
            Err(SinkError::Permanent(format!("collection API returned {}", status)))
        }
    }
}

impl ReadingSink for ApiSink {
    fn name(&self) -> &'static str {
        "collection API"
    }

    fn send<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        self.post(reading).boxed()
    }
}

fn collection_endpoint(base_url: &Url) -> Result<Url, String> {
    // Keep any path prefix on the base URL
    let mut base = base_url.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(COLLECTION_PATH)
        .map_err(|e| format!("invalid collection endpoint: {}", e))
}

fn classify_request_error(e: reqwest::Error) -> SinkError {
    if e.is_builder() || (e.is_body() && !e.is_timeout()) {
        SinkError::Permanent(e.to_string())
    } else {
        SinkError::Transient(e.to_string())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{climate_reading, TEST_ADDRESS};
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::task::JoinHandle;

    async fn spawn_collection_api(
        status: AxumStatus,
    ) -> (Url, Arc<Mutex<Vec<Value>>>, JoinHandle<()>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let store = received.clone();
        let router = Router::new().route(
            "/api/govee",
            post(move |Json(body): Json<Value>| {
                let store = store.clone();
                async move {
                    store.lock().unwrap().push(body);
                    status
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let base = Url::parse(&format!("http://{addr}")).unwrap();
        (base, received, handle)
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let root = Url::parse("https://sensors.example.com").unwrap();
        assert_eq!(
            collection_endpoint(&root).unwrap().as_str(),
            "https://sensors.example.com/api/govee"
        );

        let prefixed = Url::parse("https://example.com/sensor-api").unwrap();
        assert_eq!(
            collection_endpoint(&prefixed).unwrap().as_str(),
            "https://example.com/sensor-api/api/govee"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[tokio::test]
    async fn test_posts_single_element_array() {
        let (base, received, handle) = spawn_collection_api(AxumStatus::OK).await;
        let sink = ApiSink::new(&base).unwrap();

        sink.send(&climate_reading(TEST_ADDRESS)).await.unwrap();
        handle.abort();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let body = received[0].as_array().unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body[0]["address"], "A4:C1:38:0D:3E:7F");
        assert_eq!(body[0]["battery"], 60);
        assert!(body[0]["receivedSignalStrength"].is_null());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (base, _, handle) = spawn_collection_api(AxumStatus::SERVICE_UNAVAILABLE).await;
        let sink = ApiSink::new(&base).unwrap();

        let result = sink.send(&climate_reading(TEST_ADDRESS)).await;
        handle.abort();
        assert!(matches!(result, Err(SinkError::Transient(_))));
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let (base, _, handle) = spawn_collection_api(AxumStatus::BAD_REQUEST).await;
        let sink = ApiSink::new(&base).unwrap();

        let result = sink.send(&climate_reading(TEST_ADDRESS)).await;
        handle.abort();
        assert!(matches!(result, Err(SinkError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let base = Url::parse(&format!("http://{addr}")).unwrap();
        let sink = ApiSink::new(&base).unwrap();
        let result = sink.send(&climate_reading(TEST_ADDRESS)).await;
        assert!(matches!(result, Err(SinkError::Transient(_))));
    }
}
