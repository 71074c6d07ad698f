//! End-to-end scenarios driven through the public HTTP API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use iotno_core::TransactionId;
use iotno_integration_tests::{ScriptedNefClient, TestCluster, eventually, eventually_async};
use iotno_store::Store;
use iotno_store::model::TransactionStatus;

const WAIT: Duration = Duration::from_secs(5);

async fn submitted_transaction_id(response: reqwest::Response) -> TransactionId {
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json().await.unwrap();
    body["transactionId"]
        .as_str()
        .expect("202 body carries transactionId")
        .parse()
        .expect("transactionId is a UUID")
}

#[tokio::test]
async fn s1_happy_path_immediate() {
    let cluster = TestCluster::start().await;

    let body = cluster.request_body(&["+11111"], true, None);
    let transaction_id = submitted_transaction_id(cluster.submit(body).await).await;

    eventually(WAIT, "completion callback", || {
        cluster.sink.received().len() == 1
    })
    .await;

    // One capture, one apply with the configured power-saving profile.
    assert_eq!(cluster.nef.captures().len(), 1);
    let applied = cluster.nef.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].1.max_latency, "1");
    assert_eq!(applied[0].1.max_response_time, "1");

    let callback = &cluster.sink.received()[0];
    assert_eq!(
        callback["type"],
        "org.camaraproject.iot-network-optimization-notification.v1.power-saving"
    );
    assert_eq!(
        callback["data"]["transactionId"],
        transaction_id.to_string()
    );
    assert_eq!(callback["data"]["activationStatus"][0]["status"], "success");

    eventually_async(WAIT, "transaction completed", || async {
        cluster
            .store
            .get_transaction(transaction_id)
            .await
            .unwrap()
            .is_some_and(|t| t.status == TransactionStatus::Completed)
    })
    .await;
}

#[tokio::test]
async fn s2_scheduled_window_applies_then_restores() {
    let cluster = TestCluster::start().await;

    let start_at = Utc::now() + chrono::Duration::milliseconds(300);
    let end_at = Utc::now() + chrono::Duration::milliseconds(800);
    let body = cluster.request_body(
        &["+12222"],
        true,
        Some(serde_json::json!({
            "startDate": start_at.to_rfc3339(),
            "endDate": end_at.to_rfc3339(),
        })),
    );
    let transaction_id = submitted_transaction_id(cluster.submit(body).await).await;

    // Nothing fires before the window opens.
    assert!(cluster.nef.applied().is_empty());

    eventually(WAIT, "both phase callbacks", || {
        cluster.sink.received().len() == 2
    })
    .await;

    // Apply at start, restore of the captured original at end.
    let applied = cluster.nef.applied();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].1.max_latency, "1");
    assert_eq!(applied[1].1.max_latency, "100");
    assert_eq!(applied[1].1.max_response_time, "200");

    for callback in cluster.sink.received() {
        assert_eq!(callback["data"]["activationStatus"][0]["status"], "success");
    }

    eventually_async(WAIT, "transaction completed", || async {
        cluster
            .store
            .get_transaction(transaction_id)
            .await
            .unwrap()
            .is_some_and(|t| t.status == TransactionStatus::Completed)
    })
    .await;
}

#[tokio::test]
async fn s3_conflicting_submit_is_rejected() {
    let cluster = TestCluster::start().await;

    // Keep the first transaction in flight so the window stays open.
    let far_start = Utc::now() + chrono::Duration::seconds(60);
    let body = cluster.request_body(
        &["+22222"],
        true,
        Some(serde_json::json!({"startDate": far_start.to_rfc3339()})),
    );
    let first_id = submitted_transaction_id(cluster.submit(body.clone()).await).await;

    // The row is materialized asynchronously by the scheduler.
    eventually_async(WAIT, "first transaction materialized", || async {
        cluster
            .store
            .get_transaction(first_id)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let second = cluster.submit(body).await;
    assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
    let error: serde_json::Value = second.json().await.unwrap();
    assert_eq!(error["code"], "CONFLICT");
    assert!(
        error["message"]
            .as_str()
            .unwrap()
            .contains(&first_id.to_string())
    );
}

#[tokio::test]
async fn s4_restore_without_capture_is_rejected() {
    let cluster = TestCluster::start().await;

    let response = cluster
        .submit(cluster.request_body(&["+33333"], false, None))
        .await;

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(error["code"], "INVALID_ARGUMENT");
    // The message names the unresolved device by its canonical identifier.
    assert!(
        error["message"]
            .as_str()
            .unwrap()
            .contains("@generated.nai")
    );
}

#[tokio::test]
async fn s5_partial_failure_reports_per_device_outcomes() {
    let nef = Arc::new(ScriptedNefClient::new());
    let cluster = TestCluster::start_with_nef(Arc::clone(&nef)).await;

    // Resolve the same surrogate the admission will derive, then script the
    // write failure for the middle device.
    let resolver = iotno_core::device::HashingResolver::new();
    let middle = iotno_core::NaiResolver::resolve(
        &resolver,
        &iotno_core::Device::from_phone_number("+55502"),
    )
    .unwrap();
    nef.fail_writes_for(middle.as_str());

    let body = cluster.request_body(&["+55501", "+55502", "+55503"], true, None);
    let transaction_id = submitted_transaction_id(cluster.submit(body).await).await;

    eventually(WAIT, "single completion callback", || {
        cluster.sink.received().len() == 1
    })
    .await;

    let query = cluster.query(&transaction_id.to_string()).await;
    assert_eq!(query.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = query.json().await.unwrap();
    let statuses: Vec<&str> = body["activationStatus"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["success", "failed", "success"]);

    // Device-level failures do not fail the transaction.
    eventually_async(WAIT, "transaction completed", || async {
        cluster
            .store
            .get_transaction(transaction_id)
            .await
            .unwrap()
            .is_some_and(|t| t.status == TransactionStatus::Completed)
    })
    .await;
}

#[tokio::test]
async fn s6_scheduler_restart_rehydrates_timers() {
    let cluster = TestCluster::start().await;

    let start_at = Utc::now() + chrono::Duration::milliseconds(500);
    let end_at = Utc::now() + chrono::Duration::milliseconds(1000);
    let body = cluster.request_body(
        &["+66666"],
        true,
        Some(serde_json::json!({
            "startDate": start_at.to_rfc3339(),
            "endDate": end_at.to_rfc3339(),
        })),
    );
    let transaction_id = submitted_transaction_id(cluster.submit(body).await).await;

    // Wait for the pending row, then kill the scheduler before the window
    // opens.
    eventually_async(WAIT, "transaction materialized", || async {
        cluster
            .store
            .get_transaction(transaction_id)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    cluster.scheduler.shutdown();

    // A replacement instance re-arms everything from the store.
    let replacement = TestCluster::attach_scheduler(&cluster.store, &cluster.bus);
    replacement.rehydrate().await.unwrap();

    eventually(WAIT, "both phase callbacks after restart", || {
        cluster.sink.received().len() == 2
    })
    .await;

    let applied = cluster.nef.applied();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].1.max_latency, "1");
    assert_eq!(applied[1].1.max_latency, "100");

    eventually_async(WAIT, "transaction completed", || async {
        cluster
            .store
            .get_transaction(transaction_id)
            .await
            .unwrap()
            .is_some_and(|t| t.status == TransactionStatus::Completed)
    })
    .await;
}

#[tokio::test]
async fn enable_then_disable_restores_the_captured_original() {
    let cluster = TestCluster::start().await;

    let transaction_id = submitted_transaction_id(
        cluster
            .submit(cluster.request_body(&["+77777"], true, None))
            .await,
    )
    .await;

    eventually_async(WAIT, "enable transaction completed", || async {
        cluster
            .store
            .get_transaction(transaction_id)
            .await
            .unwrap()
            .is_some_and(|t| t.status == TransactionStatus::Completed)
    })
    .await;

    // With the first transaction terminal, the same device may be restored.
    let response = cluster
        .submit(cluster.request_body(&["+77777"], false, None))
        .await;
    let restore_id = submitted_transaction_id(response).await;

    eventually_async(WAIT, "restore transaction completed", || async {
        cluster
            .store
            .get_transaction(restore_id)
            .await
            .unwrap()
            .is_some_and(|t| t.status == TransactionStatus::Completed)
    })
    .await;

    // The restore wrote back exactly what the capture observed.
    let applied = cluster.nef.applied();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[1].1.max_latency, "100");
    assert_eq!(applied[1].1.max_response_time, "200");
}

#[tokio::test]
async fn duplicate_devices_in_one_request_are_rejected() {
    let cluster = TestCluster::start().await;

    let response = cluster
        .submit(cluster.request_body(&["+88888", "+88888"], true, None))
        .await;

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(error["code"], "INVALID_ARGUMENT");
    assert!(error["message"].as_str().unwrap().contains("duplicate"));
}

#[tokio::test]
async fn past_window_is_rejected_but_past_start_is_accepted() {
    let cluster = TestCluster::start().await;

    // Both bounds in the past: rejected.
    let response = cluster
        .submit(cluster.request_body(
            &["+99901"],
            true,
            Some(serde_json::json!({
                "startDate": (Utc::now() - chrono::Duration::hours(2)).to_rfc3339(),
                "endDate": (Utc::now() - chrono::Duration::hours(1)).to_rfc3339(),
            })),
        ))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Start in the past with a live end: accepted, fires immediately.
    let response = cluster
        .submit(cluster.request_body(
            &["+99902"],
            true,
            Some(serde_json::json!({
                "startDate": (Utc::now() - chrono::Duration::hours(1)).to_rfc3339(),
                "endDate": (Utc::now() + chrono::Duration::milliseconds(600)).to_rfc3339(),
            })),
        ))
        .await;
    let transaction_id = submitted_transaction_id(response).await;

    eventually_async(WAIT, "immediate-start window completed", || async {
        cluster
            .store
            .get_transaction(transaction_id)
            .await
            .unwrap()
            .is_some_and(|t| t.status == TransactionStatus::Completed)
    })
    .await;
}

#[tokio::test]
async fn requests_without_bearer_token_are_rejected() {
    let cluster = TestCluster::start().await;

    let response = cluster
        .client
        .post(format!("{}/features/power-saving", cluster.api_url))
        .json(&cluster.request_body(&["+10101"], true, None))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Probes bypass authentication.
    let health = cluster
        .client
        .get(format!("{}/healthz", cluster.api_url))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn query_of_open_window_projects_in_progress() {
    let cluster = TestCluster::start().await;

    let end_at = Utc::now() + chrono::Duration::seconds(60);
    let body = cluster.request_body(
        &["+20202"],
        true,
        Some(serde_json::json!({
            "startDate": Utc::now().to_rfc3339(),
            "endDate": end_at.to_rfc3339(),
        })),
    );
    let transaction_id = submitted_transaction_id(cluster.submit(body).await).await;

    // Wait for the start phase to finish; the end is still scheduled.
    eventually(WAIT, "start callback", || cluster.sink.received().len() == 1).await;

    let query = cluster.query(&transaction_id.to_string()).await;
    let body: serde_json::Value = query.json().await.unwrap();
    assert_eq!(body["activationStatus"][0]["status"], "in-progress");
}
