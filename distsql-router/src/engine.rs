//! The seam to the local SQL engine.
//!
//! The daemon and the executor talk to the engine only through
//! [`SqlEngine`], which keeps the runtime testable without a database.
//! [`PostgresEngine`] is the production implementation; every call
//! opens its own scoped connection and releases it on all exit paths.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use itertools::Itertools;
use tokio_postgres::NoTls;
use tokio_postgres::Row;
use tokio_postgres::types::Type;
use tracing::error;

use crate::RouterError;
use distsql_federation::catalog::Site;

/// A result set with its column names, every value rendered to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Run one or more statements, discarding any results.
    async fn execute(&self, sql: &str) -> Result<(), RouterError>;

    /// Run a query and render every value to text.
    async fn query_rows(&self, sql: &str) -> Result<QueryRows, RouterError>;

    /// Names of all user tables in the configured database.
    async fn table_names(&self) -> Result<Vec<String>, RouterError>;

    /// Column names of a table, in definition order.
    async fn table_columns(&self, table: &str) -> Result<Vec<String>, RouterError>;

    /// A `DROP TABLE IF EXISTS` / `CREATE TABLE` / `INSERT` script that
    /// recreates the table and its rows, with every occurrence of the
    /// table name in canonical quoted form so a receiving site can
    /// substitute its own target name.
    async fn dump_table(&self, table: &str) -> Result<String, RouterError>;
}

/// Double-quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub struct PostgresEngine {
    config: tokio_postgres::Config,
}

impl PostgresEngine {
    pub fn new(site: &Site, database: &str) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&site.ip)
            .user(&site.user)
            .password(&site.password)
            .dbname(database);
        Self { config }
    }

    async fn connect(&self) -> Result<tokio_postgres::Client, RouterError> {
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(RouterError::engine)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection task failed");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl SqlEngine for PostgresEngine {
    async fn execute(&self, sql: &str) -> Result<(), RouterError> {
        let client = self.connect().await?;
        client.batch_execute(sql).await.map_err(RouterError::engine)
    }

    async fn query_rows(&self, sql: &str) -> Result<QueryRows, RouterError> {
        let client = self.connect().await?;
        let statement = client.prepare(sql).await.map_err(RouterError::engine)?;
        let columns = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
        let rows = client
            .query(&statement, &[])
            .await
            .map_err(RouterError::engine)?;
        let rows = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|index| render_value(row, index))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryRows { columns, rows })
    }

    async fn table_names(&self) -> Result<Vec<String>, RouterError> {
        let client = self.connect().await?;
        let rows = client
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' ORDER BY table_name",
                &[],
            )
            .await
            .map_err(RouterError::engine)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, RouterError> {
        let client = self.connect().await?;
        let rows = client
            .query(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(RouterError::engine)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn dump_table(&self, table: &str) -> Result<String, RouterError> {
        let client = self.connect().await?;
        let columns = client
            .query(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(RouterError::engine)?;
        if columns.is_empty() {
            return Err(RouterError::Engine(format!("relation `{table}` not found")));
        }

        let quoted = quote_ident(table);
        let mut script = format!("DROP TABLE IF EXISTS {quoted};\n");
        let definitions = columns
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                format!("{} {data_type}", quote_ident(&name))
            })
            .join(", ");
        script.push_str(&format!("CREATE TABLE {quoted} ({definitions});\n"));

        let rows = client
            .query(&format!("SELECT * FROM {quoted}"), &[])
            .await
            .map_err(RouterError::engine)?;
        for row in &rows {
            let values = (0..row.len())
                .map(|index| sql_literal(row, index))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ");
            script.push_str(&format!("INSERT INTO {quoted} VALUES ({values});\n"));
        }
        Ok(script)
    }
}

/// Render one value as display text for result sets.
fn render_value(row: &Row, index: usize) -> Result<String, RouterError> {
    typed_value(row, index, |text| text.to_string(), |text| text.to_string())
}

/// Render one value as a SQL literal for dump scripts.
fn sql_literal(row: &Row, index: usize) -> Result<String, RouterError> {
    typed_value(row, index, quote_literal, |text| text.to_string())
}

fn typed_value(
    row: &Row,
    index: usize,
    text_form: impl Fn(&str) -> String,
    plain_form: impl Fn(&str) -> String,
) -> Result<String, RouterError> {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
        row: &'a Row,
        index: usize,
    ) -> Result<Option<T>, RouterError> {
        row.try_get(index).map_err(RouterError::engine)
    }

    let ty = row.columns()[index].type_();
    let rendered = if *ty == Type::INT2 {
        get::<i16>(row, index)?.map(|v| plain_form(&v.to_string()))
    } else if *ty == Type::INT4 {
        get::<i32>(row, index)?.map(|v| plain_form(&v.to_string()))
    } else if *ty == Type::INT8 {
        get::<i64>(row, index)?.map(|v| plain_form(&v.to_string()))
    } else if *ty == Type::FLOAT4 {
        get::<f32>(row, index)?.map(|v| plain_form(&v.to_string()))
    } else if *ty == Type::FLOAT8 {
        get::<f64>(row, index)?.map(|v| plain_form(&v.to_string()))
    } else if *ty == Type::BOOL {
        get::<bool>(row, index)?.map(|v| plain_form(&v.to_string()))
    } else if *ty == Type::TIMESTAMP {
        get::<NaiveDateTime>(row, index)?
            .map(|v| text_form(&v.format("%Y-%m-%d %H:%M:%S").to_string()))
    } else {
        get::<String>(row, index)?.map(|v| text_form(&v))
    };
    Ok(rendered.unwrap_or_else(|| "NULL".to_string()))
}
