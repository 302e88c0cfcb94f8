//! Lowering of the restricted SELECT/UPDATE dialect into the internal
//! query form.
//!
//! The front-end leans on `sqlparser` for lexing and AST construction
//! and does the dialect restriction and catalog resolution here: every
//! column reference comes out as `table.column` (aggregates as
//! `func(table.column)`), `INNER JOIN ... ON` collapses into WHERE, and
//! `*` expands to the catalog columns of the FROM tables.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use indexmap::IndexMap;
use indexmap::IndexSet;
use itertools::Itertools;
use sqlparser::ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::Comparison;
use super::ComparisonOp;
use super::Condition;
use super::column_parts;
use super::quote_reference;
use crate::catalog::SystemCatalog;
use crate::error::QueryError;

/// A statement accepted by the front-end.
#[derive(Debug, Clone)]
pub enum Statement {
    Select(SelectQuery),
    Update(UpdateStatement),
}

/// A resolved SELECT. Every entry of `columns`, `group_by` and every
/// condition operand that names a column is in `table.column` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    pub columns: Vec<String>,
    pub tables: Vec<String>,
    pub where_clause: Option<Condition>,
    pub group_by: Option<Vec<String>>,
    pub having: Option<Condition>,
    pub limit: Option<u64>,
}

impl Display for SelectQuery {
    /// Canonical serialization: quoted identifiers, conjunct-joined
    /// WHERE. Parsing the rendered text yields an equal `SelectQuery`.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let columns = self.columns.iter().map(|c| quote_reference(c)).join(", ");
        let tables = self.tables.iter().map(|t| format!("\"{t}\"")).join(", ");
        write!(f, "SELECT {columns} FROM {tables}")?;
        if let Some(where_clause) = &self.where_clause {
            let conjuncts = where_clause
                .conjuncts()
                .iter()
                .map(Condition::sql_text)
                .join(" AND ");
            write!(f, " WHERE {conjuncts}")?;
        }
        if let Some(group_by) = &self.group_by {
            write!(
                f,
                " GROUP BY {}",
                group_by.iter().map(|c| quote_reference(c)).join(", ")
            )?;
        }
        if let Some(having) = &self.having {
            let conjuncts = having
                .conjuncts()
                .iter()
                .map(Condition::sql_text)
                .join(" AND ");
            write!(f, " HAVING {conjuncts}")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

/// An UPDATE accepted for two-phase commit. The sqlparser AST is kept so
/// the coordinator and participants can substitute the target table
/// (fragment names, shadow names) and re-serialize.
#[derive(Debug, Clone)]
pub struct UpdateStatement {
    statement: ast::Statement,
    table: String,
}

impl UpdateStatement {
    fn new(statement: ast::Statement) -> Result<Self, QueryError> {
        let ast::Statement::Update { table, .. } = &statement else {
            return Err(QueryError::parse("expected an UPDATE statement"));
        };
        if !table.joins.is_empty() {
            return Err(QueryError::unsupported("UPDATE with joins"));
        }
        let ast::TableFactor::Table { name, .. } = &table.relation else {
            return Err(QueryError::unsupported(
                "UPDATE targets must be plain tables",
            ));
        };
        let table = object_name(name)?;
        Ok(Self { statement, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn sql(&self) -> String {
        self.statement.to_string()
    }

    /// The statement re-serialized against a different target table.
    pub fn with_table(&self, table: &str) -> String {
        let mut statement = self.statement.clone();
        if let ast::Statement::Update { table: target, .. } = &mut statement {
            if let ast::TableFactor::Table { name, .. } = &mut target.relation {
                *name = ast::ObjectName(vec![quoted_ident(table)]);
            }
        }
        statement.to_string()
    }
}

fn quoted_ident(name: &str) -> ast::Ident {
    ast::Ident::with_quote('"', name)
}

/// Parse one statement of the supported subset.
pub fn parse_statement(catalog: &SystemCatalog, sql: &str) -> Result<Statement, QueryError> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)?;
    let statement = statements
        .into_iter()
        .exactly_one()
        .map_err(|_| QueryError::parse("expected exactly one statement"))?;
    match statement {
        ast::Statement::Query(query) => Ok(Statement::Select(lower_select(catalog, *query)?)),
        update @ ast::Statement::Update { .. } => {
            Ok(Statement::Update(UpdateStatement::new(update)?))
        }
        other => Err(QueryError::unsupported(format!(
            "statement kind not supported: {other}"
        ))),
    }
}

/// Parse a statement that must be a SELECT.
pub fn parse_select(catalog: &SystemCatalog, sql: &str) -> Result<SelectQuery, QueryError> {
    match parse_statement(catalog, sql)? {
        Statement::Select(query) => Ok(query),
        Statement::Update(_) => Err(QueryError::parse("expected a SELECT statement")),
    }
}

struct Resolver<'a> {
    catalog: &'a SystemCatalog,
    /// alias (or bare table name) -> real table name
    alias_map: IndexMap<String, String>,
    /// distinct real table names, in FROM order
    tables: Vec<String>,
}

fn lower_select(catalog: &SystemCatalog, query: ast::Query) -> Result<SelectQuery, QueryError> {
    if query.order_by.is_some() {
        return Err(QueryError::unsupported("ORDER BY"));
    }
    if query.offset.is_some() || query.fetch.is_some() {
        return Err(QueryError::unsupported("OFFSET / FETCH"));
    }
    let limit = match query.limit {
        None => None,
        Some(ast::Expr::Value(ast::Value::Number(number, _))) => Some(
            number
                .parse::<u64>()
                .map_err(|_| QueryError::unsupported("LIMIT should be an integer"))?,
        ),
        Some(_) => return Err(QueryError::unsupported("LIMIT should be an integer")),
    };

    let ast::SetExpr::Select(select) = *query.body else {
        return Err(QueryError::unsupported(
            "only plain SELECT statements are supported",
        ));
    };
    let select = *select;
    if select.distinct.is_some() {
        return Err(QueryError::unsupported("SELECT DISTINCT"));
    }

    // FROM list and INNER JOINs; join conditions become WHERE conjuncts.
    let mut resolver = Resolver {
        catalog,
        alias_map: IndexMap::new(),
        tables: Vec::new(),
    };
    let mut raw_conditions = Vec::new();
    for table_with_joins in select.from {
        resolver.collect_table(table_with_joins.relation)?;
        for join in table_with_joins.joins {
            let ast::JoinOperator::Inner(ast::JoinConstraint::On(on)) = join.join_operator else {
                return Err(QueryError::unsupported(
                    "only INNER JOIN ... ON is supported",
                ));
            };
            resolver.collect_table(join.relation)?;
            raw_conditions.push(on);
        }
    }
    if resolver.tables.is_empty() {
        return Err(QueryError::parse("FROM list is empty"));
    }

    let mut columns = IndexSet::new();
    for item in select.projection {
        match item {
            ast::SelectItem::Wildcard(_) => {
                for table_name in &resolver.tables {
                    let table = resolver.require_table(table_name)?;
                    for column in catalog.columns_of(table.id) {
                        columns.insert(format!("{table_name}.{}", column.name));
                    }
                }
            }
            ast::SelectItem::UnnamedExpr(expr) => {
                columns.insert(resolver.lower_reference(&expr)?);
            }
            other => {
                return Err(QueryError::unsupported(format!(
                    "select item not supported: {other}"
                )));
            }
        }
    }

    if let Some(selection) = select.selection {
        raw_conditions.push(selection);
    }
    let mut conditions = Vec::new();
    for raw in raw_conditions {
        conditions.push(resolver.lower_condition(raw)?);
    }
    let where_clause = if conditions.is_empty() {
        None
    } else {
        Some(Condition::And(conditions).normalize())
    };

    let group_by = match select.group_by {
        ast::GroupByExpr::Expressions(expressions, _) if !expressions.is_empty() => Some(
            expressions
                .into_iter()
                .map(|expr| resolver.lower_column(&expr))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        ast::GroupByExpr::Expressions(_, _) => None,
        ast::GroupByExpr::All(_) => return Err(QueryError::unsupported("GROUP BY ALL")),
    };

    let having = match select.having {
        None => None,
        Some(expr) => {
            let lowered = resolver.lower_condition(expr)?.normalize();
            Some(match lowered {
                and @ Condition::And(_) => and,
                other => Condition::And(vec![other]),
            })
        }
    };

    Ok(SelectQuery {
        columns: columns.into_iter().collect(),
        tables: resolver.tables,
        where_clause,
        group_by,
        having,
        limit,
    })
}

fn object_name(name: &ast::ObjectName) -> Result<String, QueryError> {
    let ident = name
        .0
        .iter()
        .exactly_one()
        .map_err(|_| QueryError::unsupported(format!("qualified table name `{name}`")))?;
    Ok(ident.value.clone())
}

impl Resolver<'_> {
    fn collect_table(&mut self, relation: ast::TableFactor) -> Result<(), QueryError> {
        let ast::TableFactor::Table { name, alias, .. } = relation else {
            return Err(QueryError::unsupported(
                "FROM items must be plain table names",
            ));
        };
        let real = object_name(&name)?;
        if self.catalog.table_by_name(&real).is_none() {
            return Err(QueryError::UnknownTable(real));
        }
        let key = match alias {
            Some(alias) => alias.name.value,
            None => real.clone(),
        };
        self.alias_map.insert(key, real.clone());
        if !self.tables.contains(&real) {
            self.tables.push(real);
        }
        Ok(())
    }

    fn require_table(&self, name: &str) -> Result<&crate::catalog::Table, QueryError> {
        self.catalog
            .table_by_name(name)
            .ok_or_else(|| QueryError::UnknownTable(name.to_string()))
    }

    /// Resolve an expression that must be a column reference or an
    /// aggregate of one.
    fn lower_reference(&self, expr: &ast::Expr) -> Result<String, QueryError> {
        match expr {
            ast::Expr::Identifier(ident) => self.resolve_bare(&ident.value),
            ast::Expr::CompoundIdentifier(parts) => {
                let (table, column) = parts
                    .iter()
                    .collect_tuple()
                    .ok_or_else(|| QueryError::unsupported(format!("column reference `{expr}`")))?;
                self.resolve_qualified(&table.value, &column.value)
            }
            ast::Expr::Function(function) => self.lower_aggregate(function),
            other => Err(QueryError::unsupported(format!(
                "expression not supported: {other}"
            ))),
        }
    }

    /// Resolve an expression that must be a plain (non-aggregate) column.
    fn lower_column(&self, expr: &ast::Expr) -> Result<String, QueryError> {
        match expr {
            ast::Expr::Identifier(_) | ast::Expr::CompoundIdentifier(_) => {
                self.lower_reference(expr)
            }
            other => Err(QueryError::unsupported(format!(
                "expected a column reference, found `{other}`"
            ))),
        }
    }

    /// Aggregates are preserved as literal `func(table.column)` strings.
    fn lower_aggregate(&self, function: &ast::Function) -> Result<String, QueryError> {
        let name = object_name(&function.name)?.to_lowercase();
        let ast::FunctionArguments::List(list) = &function.args else {
            return Err(QueryError::unsupported(format!(
                "aggregate `{name}` must take a single column"
            )));
        };
        let argument = list
            .args
            .iter()
            .exactly_one()
            .map_err(|_| {
                QueryError::unsupported(format!("aggregate `{name}` must take a single column"))
            })?;
        let ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(inner)) = argument else {
            return Err(QueryError::unsupported(format!(
                "aggregate `{name}` must take a single column"
            )));
        };
        let column = self.lower_column(inner)?;
        Ok(format!("{name}({column})"))
    }

    fn resolve_qualified(&self, table_or_alias: &str, column: &str) -> Result<String, QueryError> {
        let real = self
            .alias_map
            .get(table_or_alias)
            .ok_or_else(|| QueryError::UnknownTable(table_or_alias.to_string()))?;
        let table = self.require_table(real)?;
        if !self.catalog.has_column(table, column) {
            return Err(QueryError::UnknownColumn(format!("{table_or_alias}.{column}")));
        }
        Ok(format!("{real}.{column}"))
    }

    fn resolve_bare(&self, column: &str) -> Result<String, QueryError> {
        let owners: Vec<_> = self
            .catalog
            .tables_with_column(&self.tables, column)
            .collect();
        match owners.as_slice() {
            [] => Err(QueryError::UnknownColumn(column.to_string())),
            [table] => Ok(format!("{}.{column}", table.name)),
            _ => Err(QueryError::AmbiguousColumn(column.to_string())),
        }
    }

    fn lower_condition(&self, expr: ast::Expr) -> Result<Condition, QueryError> {
        match expr {
            ast::Expr::Nested(inner) => self.lower_condition(*inner),
            ast::Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => Ok(Condition::And(vec![
                    self.lower_condition(*left)?,
                    self.lower_condition(*right)?,
                ])),
                ast::BinaryOperator::Or => Ok(Condition::Or(vec![
                    self.lower_condition(*left)?,
                    self.lower_condition(*right)?,
                ])),
                other => {
                    let op = lower_comparison_op(&other)?;
                    let lhs = self.lower_operand(&left)?;
                    let rhs = self.lower_operand(&right)?;
                    let references_column = [&lhs, &rhs].into_iter().any(|operand| {
                        column_parts(operand)
                            .is_some_and(|(table, _)| self.tables.iter().any(|t| t == table))
                    });
                    if !references_column {
                        return Err(QueryError::unsupported(format!(
                            "comparison `{lhs} {op} {rhs}` references no catalog column"
                        )));
                    }
                    Ok(Condition::Comparison(Comparison { lhs, op, rhs }))
                }
            },
            other => Err(QueryError::unsupported(format!(
                "condition not supported: {other}"
            ))),
        }
    }

    fn lower_operand(&self, expr: &ast::Expr) -> Result<String, QueryError> {
        match expr {
            ast::Expr::Identifier(_) | ast::Expr::CompoundIdentifier(_) | ast::Expr::Function(_) => {
                self.lower_reference(expr)
            }
            ast::Expr::Value(ast::Value::Number(number, _)) => Ok(number.clone()),
            ast::Expr::Value(ast::Value::SingleQuotedString(text)) => Ok(format!("'{text}'")),
            ast::Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr: inner,
            } => match inner.as_ref() {
                ast::Expr::Value(ast::Value::Number(number, _)) => Ok(format!("-{number}")),
                other => Err(QueryError::unsupported(format!(
                    "operand not supported: -{other}"
                ))),
            },
            other => Err(QueryError::unsupported(format!(
                "operand not supported: {other}"
            ))),
        }
    }
}

fn lower_comparison_op(op: &ast::BinaryOperator) -> Result<ComparisonOp, QueryError> {
    match op {
        ast::BinaryOperator::Eq => Ok(ComparisonOp::Eq),
        ast::BinaryOperator::NotEq => Ok(ComparisonOp::NotEq),
        ast::BinaryOperator::Lt => Ok(ComparisonOp::Lt),
        ast::BinaryOperator::LtEq => Ok(ComparisonOp::LtEq),
        ast::BinaryOperator::Gt => Ok(ComparisonOp::Gt),
        ast::BinaryOperator::GtEq => Ok(ComparisonOp::GtEq),
        other => Err(QueryError::unsupported(format!(
            "comparison operator `{other}` is not supported"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::catalog::SystemCatalog;

    fn catalog() -> SystemCatalog {
        SystemCatalog::chat()
    }

    fn select(sql: &str) -> SelectQuery {
        parse_select(&catalog(), sql).expect("parses")
    }

    #[test]
    fn resolves_bare_and_aliased_columns() {
        let query = select(
            "SELECT U.name, M.sent_at, content \
             FROM message M, \"user\" U \
             WHERE M.\"group\" = 1 AND M.author = U.id",
        );
        assert_eq!(
            query.columns,
            vec!["user.name", "message.sent_at", "message.content"]
        );
        assert_eq!(query.tables, vec!["message", "user"]);
        assert_eq!(
            query.where_clause,
            Some(Condition::And(vec![
                Condition::comparison("message.group", ComparisonOp::Eq, "1"),
                Condition::comparison("message.author", ComparisonOp::Eq, "user.id"),
            ]))
        );
    }

    #[test]
    fn expands_wildcard_from_catalog() {
        let query = select("SELECT * FROM \"group\" WHERE created_by = 1");
        assert_eq!(
            query.columns,
            vec!["group.id", "group.name", "group.created_by"]
        );
    }

    #[test]
    fn flattens_inner_join_into_where() {
        let query = select(
            "SELECT G.name FROM \"group\" G INNER JOIN message M ON M.\"group\" = G.id \
             WHERE M.author = 1",
        );
        assert_eq!(query.tables, vec!["group", "message"]);
        assert_eq!(
            query.where_clause,
            Some(Condition::And(vec![
                Condition::comparison("message.group", ComparisonOp::Eq, "group.id"),
                Condition::comparison("message.author", ComparisonOp::Eq, "1"),
            ]))
        );
    }

    #[test]
    fn keeps_cnf_structure() {
        let query = select(
            "SELECT id FROM \"user\" \
             WHERE (status = 'on' OR status = 'away') AND id > 3",
        );
        assert_eq!(
            query.where_clause,
            Some(Condition::And(vec![
                Condition::Or(vec![
                    Condition::comparison("user.status", ComparisonOp::Eq, "'on'"),
                    Condition::comparison("user.status", ComparisonOp::Eq, "'away'"),
                ]),
                Condition::comparison("user.id", ComparisonOp::Gt, "3"),
            ]))
        );
    }

    #[test]
    fn preserves_aggregates_and_grouping() {
        let query = select(
            "SELECT \"group\", avg(sent_at) FROM message \
             GROUP BY \"group\" HAVING count(id) > 2 LIMIT 10",
        );
        assert_eq!(query.columns, vec!["message.group", "avg(message.sent_at)"]);
        assert_eq!(query.group_by, Some(vec!["message.group".to_string()]));
        assert_eq!(
            query.having,
            Some(Condition::And(vec![Condition::comparison(
                "count(message.id)",
                ComparisonOp::Gt,
                "2",
            )]))
        );
        assert_eq!(query.limit, Some(10));
    }

    #[test]
    fn rejects_ambiguous_columns() {
        let error = parse_select(&catalog(), "SELECT name FROM \"user\", \"group\"")
            .expect_err("ambiguous");
        assert_eq!(error, QueryError::AmbiguousColumn("name".to_string()));
    }

    #[test]
    fn rejects_unknown_columns() {
        let error =
            parse_select(&catalog(), "SELECT nickname FROM \"user\"").expect_err("unknown");
        assert_eq!(error, QueryError::UnknownColumn("nickname".to_string()));
    }

    #[test]
    fn rejects_unknown_tables() {
        let error = parse_select(&catalog(), "SELECT id FROM missing").expect_err("unknown");
        assert_eq!(error, QueryError::UnknownTable("missing".to_string()));
    }

    #[test]
    fn rejects_non_integer_limit() {
        let error = parse_select(&catalog(), "SELECT id FROM \"user\" LIMIT 'a'")
            .expect_err("bad limit");
        assert!(matches!(error, QueryError::Unsupported(_)));
    }

    #[test]
    fn rejects_order_by() {
        let error = parse_select(&catalog(), "SELECT id FROM \"user\" ORDER BY id")
            .expect_err("order by");
        assert!(matches!(error, QueryError::Unsupported(_)));
    }

    #[test]
    fn rejects_constant_comparisons() {
        let error =
            parse_select(&catalog(), "SELECT id FROM \"user\" WHERE 1 = 1").expect_err("constant");
        assert!(matches!(error, QueryError::Unsupported(_)));
    }

    #[test]
    fn canonical_serialization_is_idempotent() {
        let sql = "SELECT G.name, M.content FROM \"group\" G, message M \
                   WHERE M.\"group\" = G.id AND M.author = 7 LIMIT 5";
        let query = select(sql);
        let rendered = query.to_string();
        let reparsed = parse_select(&catalog(), &rendered).expect("round-trips");
        assert_eq!(reparsed, query);
        assert_eq!(reparsed.to_string(), rendered);
    }

    #[test]
    fn update_statement_rewrites_target_table() {
        let statement =
            parse_statement(&catalog(), "UPDATE \"user\" SET status = 'x' WHERE id = 1")
                .expect("parses");
        let Statement::Update(update) = statement else {
            panic!("expected an update");
        };
        assert_eq!(update.table(), "user");
        let rewritten = update.with_table("user_2");
        assert!(rewritten.starts_with("UPDATE \"user_2\" SET"), "{rewritten}");
        assert!(rewritten.ends_with("WHERE id = 1"), "{rewritten}");
    }
}
