//! Plan execution against mock site daemons: dispatch order, the final
//! result fetch, LIMIT truncation, and cleanup on success and failure.

mod common;

use common::FakeEngine;
use common::loopback_catalog;
use distsql_federation::plan::ExecutionPlan;
use distsql_federation::plan::OpKind;
use distsql_federation::plan::Operation;
use distsql_federation::sql::ComparisonOp;
use distsql_federation::sql::Condition;
use distsql_router::Configuration;
use distsql_router::RouterError;
use distsql_router::client::SiteClient;
use distsql_router::engine::QueryRows;
use distsql_router::executor::PlanExecutor;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn sample_plan() -> ExecutionPlan {
    ExecutionPlan {
        ops: vec![
            Operation {
                site: 1,
                kind: OpKind::Select {
                    relation: "user_1".to_string(),
                    condition: Condition::comparison("user.id", ComparisonOp::Eq, "1"),
                },
                target: "q7s1_0-user_1".to_string(),
            },
            Operation {
                site: 1,
                kind: OpKind::Fetch {
                    relation: "user_2".to_string(),
                    source_site: 2,
                },
                target: "q7s1_1-user_2".to_string(),
            },
            Operation {
                site: 1,
                kind: OpKind::Join {
                    left: "q7s1_0-user_1".to_string(),
                    right: "q7s1_1-user_2".to_string(),
                    condition: Some(Condition::comparison(
                        "user.id",
                        ComparisonOp::Eq,
                        "user_2.id",
                    )),
                },
                target: "q7s1_2-user_1-user_2".to_string(),
            },
        ],
        final_site: 1,
        final_relation: "q7s1_2-user_1-user_2".to_string(),
    }
}

async fn mount_verbs(server: &MockServer, verbs: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(server)
        .await;
    for verb in verbs {
        Mock::given(method("POST"))
            .and(path(format!("/exec/{verb}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(server)
            .await;
    }
}

async fn mount_happy_path(server: &MockServer) {
    mount_verbs(server, &["select", "fetch", "join"]).await;
}

fn result_rows() -> QueryRows {
    QueryRows {
        columns: vec!["name".to_string(), "last_seen".to_string()],
        rows: vec![
            vec!["ada".to_string(), "2022-01-01 10:00:00".to_string()],
            vec!["brin".to_string(), "2022-01-02 11:00:00".to_string()],
        ],
    }
}

struct Fixture {
    server: MockServer,
    engine: std::sync::Arc<FakeEngine>,
}

impl Fixture {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let engine = FakeEngine::new();
        engine.set_rows("SELECT * FROM \"q7s1-result\"", result_rows());
        Self { server, engine }
    }

    async fn execute(&self, plan: &ExecutionPlan, limit: Option<u64>) -> Result<QueryRows, RouterError> {
        let catalog = loopback_catalog();
        let configuration = Configuration {
            port: self.server.address().port(),
            ..Configuration::default()
        };
        let client = SiteClient::new(&configuration).expect("client");
        let local_site = catalog.site(1).expect("site").clone();
        let executor = PlanExecutor::new(&catalog, &client, &local_site, self.engine.as_ref());
        executor.execute(plan, limit, "q7s1").await
    }
}

#[tokio::test]
async fn executes_ops_in_order_and_fetches_the_result_home() {
    let fixture = Fixture::new().await;
    mount_happy_path(&fixture.server).await;
    // All ops and the originator share site 1: one cleanup call.
    Mock::given(method("POST"))
        .and(path("/cleanup/q7s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&fixture.server)
        .await;

    let rows = fixture.execute(&sample_plan(), None).await.expect("executes");
    assert_eq!(rows, result_rows());

    // The terminal fetch pulls the final intermediate to the originator
    // under the reserved result name.
    let requests = fixture
        .server
        .received_requests()
        .await
        .expect("recording enabled");
    let fetches: Vec<_> = requests
        .iter()
        .filter(|request| request.url.path() == "/exec/fetch")
        .collect();
    let terminal: serde_json::Value =
        serde_json::from_slice(&fetches.last().expect("terminal fetch").body).expect("json");
    assert_eq!(terminal["target_relation_name"], "q7s1-result");
    assert_eq!(terminal["relation_name"], "q7s1_2-user_1-user_2");
}

#[tokio::test]
async fn limit_truncates_client_side() {
    let fixture = Fixture::new().await;
    mount_happy_path(&fixture.server).await;
    Mock::given(method("POST"))
        .and(path("/cleanup/q7s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&fixture.server)
        .await;

    let rows = fixture.execute(&sample_plan(), Some(1)).await.expect("executes");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][0], "ada");
}

#[tokio::test]
async fn failed_op_cleans_up_touched_sites() {
    let fixture = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&fixture.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/exec/select"))
        .respond_with(ResponseTemplate::new(500).set_body_string("no such relation"))
        .mount(&fixture.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cleanup/q7s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&fixture.server)
        .await;

    let error = fixture
        .execute(&sample_plan(), None)
        .await
        .expect_err("first op fails");
    match error {
        RouterError::SiteExec { site, verb, .. } => {
            assert_eq!(site, 1);
            assert_eq!(verb, "select");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn unreachable_site_fails_the_query() {
    let fixture = Fixture::new().await;
    // No /ping mock mounted: the first site contact fails.
    Mock::given(method("POST"))
        .and(path("/cleanup/q7s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&fixture.server)
        .await;

    let error = fixture
        .execute(&sample_plan(), None)
        .await
        .expect_err("ping fails");
    assert!(
        matches!(error, RouterError::SiteUnreachable { .. }),
        "{error}"
    );
}

#[tokio::test]
async fn fetch_bodies_carry_the_source_site() {
    let fixture = Fixture::new().await;
    // The specific matcher goes first: wiremock takes the first match.
    Mock::given(method("POST"))
        .and(path("/exec/fetch"))
        .and(body_partial_json(json!({
            "relation_name": "user_2",
            "site_id": 2,
            "target_relation_name": "q7s1_1-user_2",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&fixture.server)
        .await;
    mount_happy_path(&fixture.server).await;
    Mock::given(method("POST"))
        .and(path("/cleanup/q7s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&fixture.server)
        .await;

    fixture.execute(&sample_plan(), None).await.expect("executes");
}
