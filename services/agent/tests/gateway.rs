//! Integration tests for the check-in loop against a mock controller.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostd_agent::actions::{ActionId, ActionKind, CloserSet};
use hostd_agent::client::ControllerClient;
use hostd_agent::config::Config;
use hostd_agent::gateway::{CheckinGateway, GatewayConfig};
use hostd_agent::router::RoutingMap;
use hostd_agent::{
    ActionDispatcher, ActionLog, DiskStore, HttpAcker, Router, RoutingTable, UnenrollHandler,
};
use hostd_id::AgentId;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Routing table that also remembers which action asked for each update.
#[derive(Default)]
struct Routes {
    table: RoutingTable,
    action_ids: Mutex<Vec<String>>,
}

impl Router for Routes {
    fn route(&self, action_id: &ActionId, mapping: RoutingMap) {
        self.action_ids.lock().unwrap().push(action_id.to_string());
        self.table.route(action_id, mapping);
    }
}

struct Harness {
    dir: TempDir,
    routing: Arc<Routes>,
    log: Arc<ActionLog>,
    token: CancellationToken,
    gateway: CheckinGateway,
}

fn harness(server: &MockServer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        agent_id: AgentId::new(),
        controller_url: server.uri(),
        data_dir: dir.path().to_string_lossy().to_string(),
        checkin_interval_secs: 1,
        unauthorized_threshold: 3,
        state_file_mode: 0o600,
    };

    let log = Arc::new(
        ActionLog::open(DiskStore::new(config.action_store_path(), config.state_file_mode))
            .unwrap(),
    );
    let routing = Arc::new(Routes::default());
    let client = Arc::new(ControllerClient::new(&config).unwrap());
    let acker = Arc::new(HttpAcker::new(client.clone()));
    let token = CancellationToken::new();

    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register(
        ActionKind::Unenroll,
        Arc::new(UnenrollHandler::new(
            routing.clone(),
            CloserSet::new([token.clone()]),
            Some(log.clone()),
        )),
    );

    let gateway = CheckinGateway::new(
        client,
        Arc::new(dispatcher),
        acker,
        log.clone(),
        GatewayConfig {
            checkin_interval: Duration::from_millis(10),
            unauthorized_threshold: config.unauthorized_threshold,
        },
    );

    Harness {
        dir,
        routing,
        log,
        token,
        gateway,
    }
}

async fn run_until_closed(h: &Harness) {
    tokio::time::timeout(Duration::from_secs(5), h.gateway.run(h.token.clone()))
        .await
        .expect("check-in loop should end after unenroll");
}

#[tokio::test]
async fn test_controller_unenroll_is_acked_and_ends_loop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"/checkin$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ack_token": "t1",
            "actions": [{"id": "a1", "type": "UNENROLL"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/acks$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server);
    run_until_closed(&h).await;

    let desired = h.routing.table.desired().unwrap();
    assert_eq!(desired.action_id.as_str(), "a1");
    assert!(desired.programs.is_empty());

    // Ack token advanced only after the batch was handled, and persisted.
    let reloaded = ActionLog::open(DiskStore::new(h.log.path(), 0o600)).unwrap();
    assert_eq!(reloaded.ack_token(), "t1");
    assert!(reloaded.actions().is_empty());
}

#[tokio::test]
async fn test_repeated_unauthorized_unenrolls_locally() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"/checkin$"))
        .respond_with(ResponseTemplate::new(401))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/acks$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server);
    run_until_closed(&h).await;

    assert_eq!(h.routing.table.desired().unwrap().program_count(), 0);

    let reloaded = ActionLog::open(DiskStore::new(h.log.path(), 0o600)).unwrap();
    let actions = reloaded.actions();
    assert_eq!(actions.len(), 1);
    assert!(actions[0].is_detected);
    assert!(hostd_agent::gateway::unenrolled(&reloaded));
    assert!(h.dir.path().join("action_store.json").exists());
}

#[tokio::test]
async fn test_failed_ack_keeps_loop_running_and_token_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"/checkin$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ack_token": "t1",
            "actions": [{"id": "a1", "type": "UNENROLL"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/acks$"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let h = harness(&server);
    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        h.gateway.run(h.token.clone()),
    )
    .await;

    assert!(outcome.is_err(), "loop must keep running while unacked");
    assert!(!h.token.is_cancelled());
    assert_eq!(h.log.ack_token(), "");
    // Routing was stopped before the ack was attempted.
    assert_eq!(h.routing.table.desired().unwrap().program_count(), 0);
}

#[tokio::test]
async fn test_failed_detected_unenroll_is_retried_under_one_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"/checkin$"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let h = harness(&server);
    let path = h.log.path().to_path_buf();

    // Occupy the store path so every save fails.
    fs::remove_file(&path).unwrap();
    fs::create_dir(&path).unwrap();
    fs::write(path.join("occupied"), "x").unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(300),
        h.gateway.run(h.token.clone()),
    )
    .await;

    assert!(outcome.is_err(), "loop must keep running while unsaved");
    assert!(!h.token.is_cancelled());
    assert!(h.log.actions().is_empty());

    let ids = h.routing.action_ids.lock().unwrap().clone();
    assert!(ids.len() >= 2, "expected repeated attempts, got {ids:?}");
    assert!(ids.iter().all(|id| *id == ids[0]));

    // Disk recovers: the same action is recorded exactly once.
    fs::remove_dir_all(&path).unwrap();
    run_until_closed(&h).await;

    let reloaded = ActionLog::open(DiskStore::new(&path, 0o600)).unwrap();
    let actions = reloaded.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].id.as_str(), ids[0]);
    assert!(actions[0].is_detected);
}
