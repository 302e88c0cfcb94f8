//! The interactive front-end of the originating node: SELECT statements
//! run the planning pipeline and print an aligned table; UPDATE
//! statements go through the two-phase-commit coordinator. Errors are
//! printed and the loop continues.

use std::sync::Arc;

use anyhow::Context as _;
use distsql_federation::catalog::Site;
use distsql_federation::catalog::SystemCatalog;
use distsql_federation::plan_select;
use distsql_federation::sql::Statement;
use distsql_federation::sql::parser::parse_statement;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::info;

use crate::Configuration;
use crate::client::SiteClient;
use crate::engine::QueryRows;
use crate::engine::SqlEngine;
use crate::executor;
use crate::executor::PlanExecutor;
use crate::two_pc;
use crate::two_pc::Coordinator;
use crate::two_pc::TxLog;

pub struct Repl {
    pub catalog: SystemCatalog,
    pub configuration: Configuration,
    pub site: Site,
    pub client: SiteClient,
    pub engine: Arc<dyn SqlEngine>,
    pub coordinator_log: TxLog,
}

impl Repl {
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut editor = DefaultEditor::new().context("initializing readline")?;
        let _ = editor.load_history(&self.configuration.history_file);
        loop {
            match editor.readline("distsql> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(line);
                    if let Err(error) = self.dispatch(line).await {
                        eprintln!("error: {error:#}");
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(error) => return Err(error).context("readline"),
            }
        }
        let _ = editor.save_history(&self.configuration.history_file);
        Ok(())
    }

    /// Run one statement end to end.
    pub async fn dispatch(&self, sql: &str) -> anyhow::Result<()> {
        match parse_statement(&self.catalog, sql)? {
            Statement::Select(query) => {
                let qid = executor::new_qid(self.site.id);
                info!(%qid, "planning query");
                let plan = plan_select(&self.catalog, &query, &qid)?;
                let executor = PlanExecutor::new(
                    &self.catalog,
                    &self.client,
                    &self.site,
                    self.engine.as_ref(),
                );
                let result = executor.execute(&plan, query.limit, &qid).await?;
                print!("{}", render_table(&result));
            }
            Statement::Update(update) => {
                let txid = two_pc::new_txid(self.site.id);
                let coordinator =
                    Coordinator::new(&self.catalog, &self.client, &self.coordinator_log);
                coordinator.execute_update(&update, &txid).await?;
                println!("transaction {txid} committed");
            }
        }
        Ok(())
    }
}

/// Rows as a padded text table with a header rule.
pub fn render_table(result: &QueryRows) -> String {
    let mut widths: Vec<usize> = result.columns.iter().map(String::len).collect();
    for row in &result.rows {
        for (index, value) in row.iter().enumerate() {
            if index < widths.len() {
                widths[index] = widths[index].max(value.len());
            } else {
                widths.push(value.len());
            }
        }
    }

    let render_row = |values: &[String]| {
        let cells: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(index, value)| format!("{value:<width$}", width = widths[index]))
            .collect();
        format!("| {} |\n", cells.join(" | "))
    };

    let mut out = String::new();
    out.push_str(&render_row(&result.columns));
    let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    out.push_str(&format!("|-{}-|\n", rule.join("-+-")));
    for row in &result.rows {
        out.push_str(&render_row(row));
    }
    out.push_str(&format!("({} rows)\n", result.rows.len()));
    out
}
