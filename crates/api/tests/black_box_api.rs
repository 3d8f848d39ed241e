use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use taskforge_api::app::services::build_services;
use taskforge_api::middleware::PRINCIPAL_HEADER;
use taskforge_core::{DeadLetterId, PrincipalId};
use taskforge_infra::config::{BrokerKind, QueueSpec, TaskforgeConfig};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(config: TaskforgeConfig) -> Self {
        let services = Arc::new(build_services(config).await.expect("failed to build services"));
        services.start().await.expect("failed to start services");

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = taskforge_api::app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    /// In-memory broker with fast-polling workers on `emails`.
    async fn with_workers() -> Self {
        Self::spawn(TaskforgeConfig {
            queues: vec![QueueSpec {
                name: "emails".to_string(),
                concurrency: 1,
            }],
            poll_interval: Duration::from_millis(10),
            ..TaskforgeConfig::default()
        })
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn principal() -> String {
    PrincipalId::new().to_string()
}

async fn job_eventually(
    client: &reqwest::Client,
    srv: &TestServer,
    who: &str,
    id: &str,
    state: &str,
) -> serde_json::Value {
    // Workers run in the background; poll briefly until the job settles.
    for _ in 0..200 {
        let res = client
            .get(srv.url(&format!("/queues/emails/jobs/{id}")))
            .header(PRINCIPAL_HEADER, who)
            .send()
            .await
            .unwrap();

        if res.status() == StatusCode::OK {
            let body: serde_json::Value = res.json().await.unwrap();
            if body["state"] == state {
                return body;
            }
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not reach state {state} within timeout");
}

#[tokio::test]
async fn principal_required_for_protected_endpoints() {
    let srv = TestServer::with_workers().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(srv.url("/whoami")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(srv.url("/whoami"))
        .header(PRINCIPAL_HEADER, "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let who = principal();
    let res = client
        .get(srv.url("/whoami"))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["principal_id"].as_str().unwrap(), who);
}

#[tokio::test]
async fn submitted_job_is_processed_by_workers() {
    let srv = TestServer::with_workers().await;
    let client = reqwest::Client::new();
    let who = principal();

    let res = client
        .post(srv.url("/queues/emails/jobs"))
        .header(PRINCIPAL_HEADER, &who)
        .json(&json!({
            "name": "system.echo",
            "payload": { "capability": "system.echo", "input": { "to": "a@example.com" } }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["job_id"].as_str().unwrap().to_string();
    assert!(created["audit_id"].is_string());

    let job = job_eventually(&client, &srv, &who, &id, "completed").await;
    assert_eq!(job["return_value"]["output"], json!({ "to": "a@example.com" }));
    assert_eq!(job["attempts_made"], json!(1));

    let res = client
        .get(srv.url("/queues/emails/metrics"))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let metrics: serde_json::Value = res.json().await.unwrap();
    assert_eq!(metrics["completed"], json!(1));
}

#[tokio::test]
async fn invalid_submission_is_rejected() {
    let srv = TestServer::with_workers().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/queues/emails/jobs"))
        .header(PRINCIPAL_HEADER, principal())
        .json(&json!({ "name": "system.echo", "max_attempts": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .get(srv.url("/queues/emails/jobs?state=done"))
        .header(PRINCIPAL_HEADER, principal())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn exhausted_job_lands_in_dead_letters_and_requeues_once() {
    let srv = TestServer::with_workers().await;
    let client = reqwest::Client::new();
    let who = principal();

    // No handler is registered for this name, so the single attempt fails.
    let res = client
        .post(srv.url("/queues/emails/jobs"))
        .header(PRINCIPAL_HEADER, &who)
        .json(&json!({ "name": "emails.unknown", "max_attempts": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["job_id"].as_str().unwrap().to_string();

    job_eventually(&client, &srv, &who, &id, "dead_lettered").await;

    // The entry is written right after the broker marks the job.
    let mut entries: Vec<serde_json::Value> = Vec::new();
    for _ in 0..100 {
        let res = client
            .get(srv.url(&format!("/dead-letters?queue=emails&principal={who}")))
            .header(PRINCIPAL_HEADER, &who)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        entries = res.json().await.unwrap();
        if !entries.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["job_name"], "emails.unknown");
    let entry_id = entries[0]["id"].as_str().unwrap().to_string();

    let res = client
        .get(srv.url("/dead-letters/stats"))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    let stats: serde_json::Value = res.json().await.unwrap();
    assert_eq!(stats["unresolved"], json!(1));
    assert_eq!(stats["by_queue"]["emails"], json!(1));

    let res = client
        .post(srv.url(&format!("/dead-letters/{entry_id}/requeue")))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let requeued: serde_json::Value = res.json().await.unwrap();
    assert_ne!(requeued["job_id"].as_str().unwrap(), id);

    let res = client
        .post(srv.url(&format!("/dead-letters/{entry_id}/requeue")))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "already_resolved");

    let res = client
        .post(srv.url(&format!("/dead-letters/{}/resolve", DeadLetterId::new())))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn schedules_are_owned_and_validated() {
    let srv = TestServer::with_workers().await;
    let client = reqwest::Client::new();
    let owner = principal();
    let stranger = principal();

    let res = client
        .post(srv.url("/schedules"))
        .header(PRINCIPAL_HEADER, &owner)
        .json(&json!({
            "name": "nightly",
            "pattern": "60 * * * *",
            "queue": "emails",
            "job_name": "system.echo"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_pattern");

    let res = client
        .post(srv.url("/schedules"))
        .header(PRINCIPAL_HEADER, &owner)
        .json(&json!({
            "name": "nightly",
            "pattern": "0 3 * * *",
            "queue": "emails",
            "job_name": "system.echo"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let schedule: serde_json::Value = res.json().await.unwrap();
    let id = schedule["id"].as_str().unwrap().to_string();
    assert_eq!(schedule["is_active"], json!(true));
    assert!(schedule["next_run_at"].is_string());

    let res = client
        .post(srv.url(&format!("/schedules/{id}/toggle")))
        .header(PRINCIPAL_HEADER, &stranger)
        .json(&json!({ "is_active": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .get(srv.url("/schedules"))
        .header(PRINCIPAL_HEADER, &stranger)
        .send()
        .await
        .unwrap();
    let listed: Vec<serde_json::Value> = res.json().await.unwrap();
    assert!(listed.is_empty());

    let res = client
        .post(srv.url(&format!("/schedules/{id}/toggle")))
        .header(PRINCIPAL_HEADER, &owner)
        .json(&json!({ "is_active": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let toggled: serde_json::Value = res.json().await.unwrap();
    assert_eq!(toggled["is_active"], json!(false));

    let res = client
        .delete(srv.url(&format!("/schedules/{id}")))
        .header(PRINCIPAL_HEADER, &owner)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .get(srv.url(&format!("/schedules/{id}")))
        .header(PRINCIPAL_HEADER, &owner)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn brokerless_server_degrades() {
    let srv = TestServer::spawn(TaskforgeConfig {
        broker: BrokerKind::None,
        ..TaskforgeConfig::default()
    })
    .await;
    let client = reqwest::Client::new();
    let who = principal();

    let res = client
        .post(srv.url("/queues/emails/jobs"))
        .header(PRINCIPAL_HEADER, &who)
        .json(&json!({ "name": "system.echo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "broker_unavailable");

    let res = client
        .post(srv.url("/queues/emails/pause"))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let res = client
        .get(srv.url("/queues/emails/jobs"))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let jobs: Vec<serde_json::Value> = res.json().await.unwrap();
    assert!(jobs.is_empty());

    let res = client
        .get(srv.url("/queues/emails/metrics"))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    let metrics: serde_json::Value = res.json().await.unwrap();
    assert_eq!(metrics["waiting"], json!(0));

    let res = client
        .get(srv.url("/workers"))
        .header(PRINCIPAL_HEADER, &who)
        .send()
        .await
        .unwrap();
    let workers: serde_json::Value = res.json().await.unwrap();
    assert_eq!(workers["broker_available"], json!(false));
}
