//! Shared test fixtures: a scripted in-memory SQL engine and a small
//! two-site catalog whose sites all point at loopback.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use distsql_federation::catalog::Allocation;
use distsql_federation::catalog::Column;
use distsql_federation::catalog::ColumnType;
use distsql_federation::catalog::Fragment;
use distsql_federation::catalog::FragmentType;
use distsql_federation::catalog::Site;
use distsql_federation::catalog::SystemCatalog;
use distsql_federation::catalog::Table;
use distsql_router::RouterError;
use distsql_router::engine::QueryRows;
use distsql_router::engine::SqlEngine;
use parking_lot::Mutex;

/// A stand-in for the local SQL engine: records every statement, tracks
/// table DDL, and serves scripted schemas, dumps, and rows.
#[derive(Default)]
pub struct FakeEngine {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    executed: Vec<String>,
    tables: Vec<String>,
    columns: HashMap<String, Vec<String>>,
    dumps: HashMap<String, String>,
    rows: HashMap<String, QueryRows>,
    fail_on: Option<String>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_table(&self, name: &str, columns: &[&str]) {
        let mut inner = self.inner.lock();
        inner.tables.push(name.to_string());
        inner
            .columns
            .insert(name.to_string(), columns.iter().map(|c| c.to_string()).collect());
    }

    pub fn set_dump(&self, name: &str, script: &str) {
        self.inner.lock().dumps.insert(name.to_string(), script.to_string());
    }

    pub fn set_rows(&self, sql: &str, rows: QueryRows) {
        self.inner.lock().rows.insert(sql.to_string(), rows);
    }

    /// Make any statement containing `needle` fail.
    pub fn fail_matching(&self, needle: &str) {
        self.inner.lock().fail_on = Some(needle.to_string());
    }

    pub fn clear_fail(&self) {
        self.inner.lock().fail_on = None;
    }

    pub fn executed(&self) -> Vec<String> {
        self.inner.lock().executed.clone()
    }

    pub fn current_tables(&self) -> Vec<String> {
        let mut tables = self.inner.lock().tables.clone();
        tables.sort();
        tables
    }
}

fn first_quoted(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let rest = &text[start + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn second_quoted(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let rest = &text[start + 1..];
    let end = rest.find('"')?;
    first_quoted(&rest[end + 1..])
}

#[async_trait]
impl SqlEngine for FakeEngine {
    async fn execute(&self, sql: &str) -> Result<(), RouterError> {
        let mut inner = self.inner.lock();
        if let Some(needle) = inner.fail_on.clone() {
            if sql.contains(&needle) {
                return Err(RouterError::Engine(format!(
                    "scripted failure on `{needle}`"
                )));
            }
        }
        inner.executed.push(sql.to_string());
        for statement in sql.lines().flat_map(|line| line.split(';')) {
            let statement = statement.trim();
            if let Some(rest) = statement.strip_prefix("CREATE TABLE ") {
                if let Some(name) = first_quoted(rest) {
                    if !inner.tables.contains(&name) {
                        inner.tables.push(name);
                    }
                }
            } else if let Some(rest) = statement.strip_prefix("DROP TABLE IF EXISTS ") {
                if let Some(name) = first_quoted(rest) {
                    inner.tables.retain(|table| *table != name);
                }
            } else if let Some(rest) = statement.strip_prefix("DROP TABLE ") {
                if let Some(name) = first_quoted(rest) {
                    inner.tables.retain(|table| *table != name);
                }
            } else if let Some(rest) = statement.strip_prefix("ALTER TABLE ") {
                if let (Some(from), Some(to)) = (first_quoted(rest), second_quoted(rest)) {
                    for table in &mut inner.tables {
                        if *table == from {
                            *table = to.clone();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn query_rows(&self, sql: &str) -> Result<QueryRows, RouterError> {
        self.inner
            .lock()
            .rows
            .get(sql)
            .cloned()
            .ok_or_else(|| RouterError::Engine(format!("no scripted rows for `{sql}`")))
    }

    async fn table_names(&self) -> Result<Vec<String>, RouterError> {
        Ok(self.current_tables())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, RouterError> {
        self.inner
            .lock()
            .columns
            .get(table)
            .cloned()
            .ok_or_else(|| RouterError::Engine(format!("no scripted columns for `{table}`")))
    }

    async fn dump_table(&self, table: &str) -> Result<String, RouterError> {
        self.inner
            .lock()
            .dumps
            .get(table)
            .cloned()
            .ok_or_else(|| RouterError::Engine(format!("no scripted dump for `{table}`")))
    }
}

fn column(id: u32, name: &str, table: u32, pk: bool) -> Column {
    Column {
        id,
        name: name.to_string(),
        table,
        ty: if pk { ColumnType::Int } else { ColumnType::Str },
        pk,
        notnull: true,
        unique: pk,
    }
}

/// Two loopback sites holding `user` as two vertical fragments.
pub fn loopback_catalog() -> SystemCatalog {
    let site = |id: u32, name: &str| Site {
        id,
        name: name.to_string(),
        ip: "127.0.0.1".to_string(),
        user: "user".to_string(),
        password: "password".to_string(),
    };
    SystemCatalog::new(
        vec![site(1, "n1"), site(2, "n2")],
        vec![Table {
            id: 1,
            name: "user".to_string(),
            fragment_type: FragmentType::Vertical,
        }],
        vec![
            column(1, "id", 1, true),
            column(2, "name", 1, false),
            column(3, "status", 1, false),
        ],
        vec![
            Fragment {
                id: 1,
                name: "user_1".to_string(),
                logic: "name".to_string(),
                parent: 1,
                table: 1,
            },
            Fragment {
                id: 2,
                name: "user_2".to_string(),
                logic: "status".to_string(),
                parent: 2,
                table: 1,
            },
        ],
        vec![
            Allocation {
                fragment: 1,
                site: 1,
            },
            Allocation {
                fragment: 2,
                site: 2,
            },
        ],
    )
}

/// Drive an axum app with one request and collect the response.
pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
    use tower::ServiceExt;

    let response = app.oneshot(request).await.expect("infallible");
    let status = response.status();
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .expect("body")
        .to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

pub fn json_post(path: &str, password: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("authorization", password)
        .body(Body::from(body.to_string()))
        .expect("request")
}
