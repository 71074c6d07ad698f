//! End-to-end test harness.
//!
//! Wires all four services in one process against the in-memory store and
//! bus: the admission API listens on an ephemeral port, the scheduler,
//! worker, and notifier consume their broker subscriptions, a scripted NEF
//! client records device writes, and a capture sink server receives the
//! subscriber callbacks. Scenario tests drive the public HTTP API with
//! `reqwest` and observe outcomes through the store, the NEF recorder, and
//! the sink.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use base64::Engine;

use iotno_api::server::AppState;
use iotno_bus::memory::InMemoryBus;
use iotno_bus::{EventHandler, EventSender};
use iotno_core::config::{HttpClientConfig, PowerSavingConfig};
use iotno_core::device::HashingResolver;
use iotno_core::{Device, EventType};
use iotno_nef::{DeviceConfig, NefClient, NefError};
use iotno_notifier::NotificationWorker;
use iotno_scheduler::{Scheduler, SchedulerConfig};
use iotno_store::Store;
use iotno_store::memory::MemoryStore;
use iotno_worker::ActuationWorker;

/// NEF test double: answers reads with the stub's fixed values, records
/// every write, and fails writes for blocklisted devices.
pub struct ScriptedNefClient {
    applied: Mutex<Vec<(String, DeviceConfig)>>,
    captures: Mutex<Vec<String>>,
    fail_writes_for: Mutex<HashSet<String>>,
}

impl Default for ScriptedNefClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedNefClient {
    /// Creates a recorder with no failures scripted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            captures: Mutex::new(Vec::new()),
            fail_writes_for: Mutex::new(HashSet::new()),
        }
    }

    /// Scripts `set_device_config` to fail for the given device.
    pub fn fail_writes_for(&self, device_id: &str) {
        self.fail_writes_for
            .lock()
            .unwrap()
            .insert(device_id.to_string());
    }

    /// Returns every `(device_id, config)` successfully applied, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<(String, DeviceConfig)> {
        self.applied.lock().unwrap().clone()
    }

    /// Returns the device ids whose configuration was read.
    #[must_use]
    pub fn captures(&self) -> Vec<String> {
        self.captures.lock().unwrap().clone()
    }

    fn device_id(device: &Device) -> String {
        device
            .network_access_identifier
            .as_ref()
            .map(|nai| nai.as_str().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NefClient for ScriptedNefClient {
    async fn get_device_config(&self, device: &Device) -> Result<DeviceConfig, NefError> {
        self.captures.lock().unwrap().push(Self::device_id(device));
        Ok(DeviceConfig {
            max_latency: "100".into(),
            max_response_time: "200".into(),
        })
    }

    async fn set_device_config(
        &self,
        device: &Device,
        config: &DeviceConfig,
    ) -> Result<(), NefError> {
        let id = Self::device_id(device);
        if self.fail_writes_for.lock().unwrap().contains(&id) {
            return Err(NefError::UnexpectedStatus {
                status: 500,
                body: "scripted failure".into(),
            });
        }
        self.applied.lock().unwrap().push((id, config.clone()));
        Ok(())
    }
}

/// Capture server standing in for the subscriber's callback endpoint.
pub struct CallbackSink {
    /// URL to use as the subscription sink.
    pub url: String,
    received: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl CallbackSink {
    /// Starts the capture server on an ephemeral port.
    pub async fn start() -> Self {
        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&received);

        let router = Router::new().route(
            "/cb",
            post(move |Json(body): Json<serde_json::Value>| {
                let captured = Arc::clone(&captured);
                async move {
                    captured.lock().unwrap().push(body);
                    StatusCode::ACCEPTED
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/cb"),
            received,
        }
    }

    /// Returns the callbacks received so far.
    #[must_use]
    pub fn received(&self) -> Vec<serde_json::Value> {
        self.received.lock().unwrap().clone()
    }
}

/// All four services wired against shared in-memory backends.
pub struct TestCluster {
    /// Shared document store.
    pub store: Arc<MemoryStore>,
    /// Shared broker.
    pub bus: Arc<InMemoryBus>,
    /// NEF recorder.
    pub nef: Arc<ScriptedNefClient>,
    /// The running scheduler instance.
    pub scheduler: Arc<Scheduler>,
    /// Base URL of the admission API.
    pub api_url: String,
    /// Callback capture server.
    pub sink: CallbackSink,
    /// HTTP client for driving the API.
    pub client: reqwest::Client,
}

impl TestCluster {
    /// Starts a full cluster.
    pub async fn start() -> Self {
        Self::start_with_nef(Arc::new(ScriptedNefClient::new())).await
    }

    /// Starts a full cluster around a pre-scripted NEF client.
    pub async fn start_with_nef(nef: Arc<ScriptedNefClient>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());

        let scheduler = Self::attach_scheduler(&store, &bus);

        let worker = Arc::new(ActuationWorker::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&nef) as Arc<dyn NefClient>,
            Arc::clone(&bus) as Arc<dyn EventSender>,
            PowerSavingConfig {
                max_latency: "1".into(),
                max_response_time: "1".into(),
            },
        ));
        bus.subscribe(
            "worker",
            &[EventType::DeviceActuationRequest],
            worker as Arc<dyn EventHandler>,
        )
        .unwrap();

        let notifier = Arc::new(NotificationWorker::new(
            Arc::clone(&store) as Arc<dyn Store>,
            HttpClientConfig::default(),
        ));
        bus.subscribe(
            "notifier",
            &[EventType::AllDevicesCompleted, EventType::PowerSavingError],
            notifier as Arc<dyn EventHandler>,
        )
        .unwrap();

        let state = AppState {
            store: Arc::clone(&store) as Arc<dyn Store>,
            sender: Arc::clone(&bus) as Arc<dyn EventSender>,
            resolver: Arc::new(HashingResolver::new()),
        };
        let router = iotno_api::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let sink = CallbackSink::start().await;

        Self {
            store,
            bus,
            nef,
            scheduler,
            api_url: format!("http://{addr}"),
            sink,
            client: reqwest::Client::new(),
        }
    }

    /// Creates a scheduler against the cluster's store/bus and subscribes it.
    ///
    /// Used by restart scenarios to stand up a replacement instance after
    /// shutting the previous one down.
    pub fn attach_scheduler(store: &Arc<MemoryStore>, bus: &Arc<InMemoryBus>) -> Arc<Scheduler> {
        let scheduler = Scheduler::new(
            Arc::clone(store) as Arc<dyn Store>,
            Arc::clone(bus) as Arc<dyn EventSender>,
            &SchedulerConfig::default(),
        );
        bus.subscribe(
            "scheduler",
            &[EventType::ScheduleRequested, EventType::AllDevicesCompleted],
            Arc::clone(&scheduler) as Arc<dyn EventHandler>,
        )
        .unwrap();
        scheduler
    }

    /// Builds an unsigned bearer token carrying the given subject.
    #[must_use]
    pub fn bearer_token(sub: &str) -> String {
        let encode = |bytes: &[u8]| base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        let header = encode(b"{\"alg\":\"none\",\"typ\":\"JWT\"}");
        let payload = encode(format!("{{\"sub\":\"{sub}\"}}").as_bytes());
        format!("{header}.{payload}.")
    }

    /// Submits a power-saving request and returns the raw response.
    pub async fn submit(&self, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/features/power-saving", self.api_url))
            .header("Authorization", format!("Bearer {}", Self::bearer_token("tester")))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Queries a transaction's activation status.
    pub async fn query(&self, transaction_id: &str) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/features/power-saving/transactions/{transaction_id}",
                self.api_url
            ))
            .header("Authorization", format!("Bearer {}", Self::bearer_token("tester")))
            .send()
            .await
            .unwrap()
    }

    /// Builds a request body for the given phone numbers.
    #[must_use]
    pub fn request_body(
        &self,
        phone_numbers: &[&str],
        enabled: bool,
        time_period: Option<serde_json::Value>,
    ) -> serde_json::Value {
        let devices: Vec<serde_json::Value> = phone_numbers
            .iter()
            .map(|p| serde_json::json!({"phoneNumber": p}))
            .collect();

        let mut body = serde_json::json!({
            "devices": devices,
            "enabled": enabled,
            "subscriptionRequest": {
                "protocol": "HTTP",
                "sink": self.sink.url,
                "types": [
                    "org.camaraproject.iot-network-optimization-notification.v1.power-saving",
                    "org.camaraproject.iot-network-optimization-notification.v1.power-saving.error"
                ]
            }
        });
        if let Some(period) = time_period {
            body["timePeriod"] = period;
        }
        body
    }
}

/// Polls `condition` until it holds or the timeout elapses.
///
/// # Panics
///
/// Panics when the timeout elapses first.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls an async `condition` until it holds or the timeout elapses.
///
/// # Panics
///
/// Panics when the timeout elapses first.
pub async fn eventually_async<F, Fut>(timeout: Duration, what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
