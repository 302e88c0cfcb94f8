//! Two-phase commit: participant endpoints over the scripted engine and
//! the coordinator against mock participant sites.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use common::FakeEngine;
use common::json_post;
use common::loopback_catalog;
use common::send;
use distsql_federation::sql::Statement;
use distsql_federation::sql::parser::parse_statement;
use distsql_router::Configuration;
use distsql_router::RouterError;
use distsql_router::client::SiteClient;
use distsql_router::daemon;
use distsql_router::daemon::DaemonState;
use distsql_router::two_pc::Coordinator;
use distsql_router::two_pc::TxLog;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::method;
use wiremock::matchers::path;

struct Participant {
    app: Router,
    engine: Arc<FakeEngine>,
    log_path: std::path::PathBuf,
    _log_dir: tempfile::TempDir,
}

fn participant() -> Participant {
    let catalog = loopback_catalog();
    let site = catalog.site(2).expect("site").clone();
    let engine = FakeEngine::new();
    engine.add_table("user_2", &["id", "status"]);
    let client = SiteClient::new(&Configuration::default()).expect("client");
    let log_dir = tempfile::tempdir().expect("tempdir");
    let log_path = log_dir.path().join("tx-participant.log");
    let tx_log = TxLog::open(&log_path).expect("log");
    let state = Arc::new(DaemonState::new(
        site,
        catalog,
        engine.clone(),
        client,
        tx_log,
    ));
    Participant {
        app: daemon::app(state),
        engine,
        log_path,
        _log_dir: log_dir,
    }
}

fn log_lines(participant: &Participant) -> Vec<String> {
    std::fs::read_to_string(&participant.log_path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn prepare_body(txid: &str) -> serde_json::Value {
    json!({
        "sql": "UPDATE \"user_2\" SET status = 'x' WHERE id = 1",
        "txid": txid,
    })
}

#[tokio::test]
async fn prepare_stages_the_update_in_a_shadow_table() {
    let participant = participant();
    let (status, vote) = send(
        participant.app.clone(),
        json_post("/2pc/prepare", "password", prepare_body("t1s1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vote, "vote-commit");
    let executed = participant.engine.executed();
    assert_eq!(
        executed[0],
        "CREATE TABLE \"t1s1_user_2\" AS SELECT * FROM \"user_2\""
    );
    assert!(
        executed[1].starts_with("UPDATE \"t1s1_user_2\" SET"),
        "{}",
        executed[1]
    );
    // The public table is untouched until the global decision.
    assert!(
        participant
            .engine
            .current_tables()
            .contains(&"user_2".to_string())
    );
    assert_eq!(log_lines(&participant), vec!["t1s1: vote-commit"]);
}

#[tokio::test]
async fn concurrent_prepare_votes_abort() {
    let participant = participant();
    let (_, first) = send(
        participant.app.clone(),
        json_post("/2pc/prepare", "password", prepare_body("t1s1")),
    )
    .await;
    assert_eq!(first, "vote-commit");
    let (status, second) = send(
        participant.app.clone(),
        json_post("/2pc/prepare", "password", prepare_body("t2s1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, "vote-abort");
    assert_eq!(
        log_lines(&participant),
        vec!["t1s1: vote-commit", "t2s1: abort"]
    );
}

#[tokio::test]
async fn failed_prepare_votes_abort_and_releases_the_site() {
    let participant = participant();
    participant.engine.fail_matching("UPDATE");
    let (_, vote) = send(
        participant.app.clone(),
        json_post("/2pc/prepare", "password", prepare_body("t1s1")),
    )
    .await;
    assert_eq!(vote, "vote-abort");

    // The site is free again for the next transaction.
    participant.engine.clear_fail();
    let (_, vote) = send(
        participant.app.clone(),
        json_post("/2pc/prepare", "password", prepare_body("t2s1")),
    )
    .await;
    assert_eq!(vote, "vote-commit");
}

#[tokio::test]
async fn global_commit_swaps_the_shadow_into_place() {
    let participant = participant();
    send(
        participant.app.clone(),
        json_post("/2pc/prepare", "password", prepare_body("t1s1")),
    )
    .await;
    let (status, _) = send(
        participant.app.clone(),
        json_post("/2pc/global-commit", "password", json!({"txid": "t1s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(participant.engine.current_tables(), vec!["user_2"]);
    let executed = participant.engine.executed();
    assert!(executed.contains(&"DROP TABLE \"user_2\"".to_string()));
    assert!(
        executed.contains(&"ALTER TABLE \"t1s1_user_2\" RENAME TO \"user_2\"".to_string())
    );
    assert_eq!(
        log_lines(&participant),
        vec!["t1s1: vote-commit", "t1s1: commit"]
    );
}

#[tokio::test]
async fn global_abort_drops_the_shadow_and_keeps_the_table() {
    let participant = participant();
    send(
        participant.app.clone(),
        json_post("/2pc/prepare", "password", prepare_body("t1s1")),
    )
    .await;
    let (status, _) = send(
        participant.app.clone(),
        json_post("/2pc/global-abort", "password", json!({"txid": "t1s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(participant.engine.current_tables(), vec!["user_2"]);
    assert!(
        !participant
            .engine
            .executed()
            .contains(&"DROP TABLE \"user_2\"".to_string())
    );
}

// ---- coordinator against mock participants ----

struct CoordinatorHarness {
    server: MockServer,
    log_path: std::path::PathBuf,
    _log_dir: tempfile::TempDir,
}

async fn coordinator_harness() -> CoordinatorHarness {
    let server = MockServer::start().await;
    let log_dir = tempfile::tempdir().expect("tempdir");
    let log_path = log_dir.path().join("tx-coordinator.log");
    CoordinatorHarness {
        server,
        log_path,
        _log_dir: log_dir,
    }
}

fn coordinator_log(harness: &CoordinatorHarness) -> Vec<String> {
    std::fs::read_to_string(&harness.log_path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

async fn run_update(harness: &CoordinatorHarness) -> Result<(), RouterError> {
    let catalog = loopback_catalog();
    let configuration = Configuration {
        port: harness.server.address().port(),
        ..Configuration::default()
    };
    let client = SiteClient::new(&configuration).expect("client");
    let log = TxLog::open(&harness.log_path).expect("log");
    let statement = parse_statement(&catalog, "UPDATE \"user\" SET status = 'x' WHERE id = 1")
        .expect("parses");
    let Statement::Update(update) = statement else {
        panic!("expected an update");
    };
    Coordinator::new(&catalog, &client, &log)
        .execute_update(&update, "t9s1")
        .await
}

#[tokio::test]
async fn unanimous_votes_commit_everywhere() {
    let harness = coordinator_harness().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2pc/prepare"))
        .and(body_string_contains("user_1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("vote-commit"))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2pc/prepare"))
        .and(body_string_contains("user_2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("vote-commit"))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2pc/global-commit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(2)
        .mount(&harness.server)
        .await;

    run_update(&harness).await.expect("commits");
    assert_eq!(
        coordinator_log(&harness),
        vec!["t9s1: begin_commit", "t9s1: commit", "t9s1: end_of_transaction"]
    );
}

#[tokio::test]
async fn single_abort_vote_aborts_everywhere() {
    let harness = coordinator_harness().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2pc/prepare"))
        .and(body_string_contains("user_1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("vote-commit"))
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2pc/prepare"))
        .and(body_string_contains("user_2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("vote-abort"))
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2pc/global-abort"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(2)
        .mount(&harness.server)
        .await;

    let error = run_update(&harness).await.expect_err("aborts");
    assert!(
        matches!(error, RouterError::TransactionAbort { .. }),
        "{error}"
    );
    assert_eq!(
        coordinator_log(&harness),
        vec!["t9s1: begin_commit", "t9s1: abort", "t9s1: end_of_transaction"]
    );
}

#[tokio::test]
async fn unreachable_participant_aborts_the_transaction() {
    let harness = coordinator_harness().await;
    // No /ping mock: the first contact fails, the decision is abort.
    Mock::given(method("POST"))
        .and(path("/2pc/global-abort"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&harness.server)
        .await;

    let error = run_update(&harness).await.expect_err("aborts");
    assert!(
        matches!(error, RouterError::TransactionAbort { .. }),
        "{error}"
    );
    assert_eq!(
        coordinator_log(&harness),
        vec!["t9s1: begin_commit", "t9s1: abort", "t9s1: end_of_transaction"]
    );
}
