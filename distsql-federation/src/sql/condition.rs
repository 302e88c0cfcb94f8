//! Predicate trees: a comparison leaf and n-ary AND/OR combinators.
//!
//! Conditions travel across the network in the wire form
//! `{lhs, op, rhs}` for a leaf and `{type: "and"|"or", conditions: [..]}`
//! for a compound, which is what the serde implementation below
//! produces and accepts.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use indexmap::IndexSet;
use serde::Deserialize;
use serde::Serialize;

use super::column_parts;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum ComparisonOp {
    #[strum(serialize = "=")]
    Eq,
    #[strum(to_string = "!=", serialize = "<>")]
    NotEq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    LtEq,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    GtEq,
}

impl Serialize for ComparisonOp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ComparisonOp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Self::from_str(&token)
            .map_err(|_| serde::de::Error::custom(format!("unknown comparison operator `{token}`")))
    }
}

/// A simple comparison between two operands, each either a resolved
/// `table.column` reference (possibly aggregate-wrapped) or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Comparison {
    pub lhs: String,
    pub op: ComparisonOp,
    pub rhs: String,
}

impl Comparison {
    pub fn new(lhs: impl Into<String>, op: ComparisonOp, rhs: impl Into<String>) -> Self {
        Self {
            lhs: lhs.into(),
            op,
            rhs: rhs.into(),
        }
    }
}

impl Display for Comparison {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.lhs, self.op, self.rhs)
    }
}

/// A predicate tree. `And` and `Or` are n-ary and may nest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "WireCondition", into = "WireCondition")]
pub enum Condition {
    Comparison(Comparison),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn comparison(lhs: impl Into<String>, op: ComparisonOp, rhs: impl Into<String>) -> Self {
        Self::Comparison(Comparison::new(lhs, op, rhs))
    }

    /// Collapse same-kind nesting (`And(And(a, b), c)` becomes
    /// `And(a, b, c)`) everywhere in the tree. One pass reaches the
    /// fixed point.
    pub fn normalize(self) -> Self {
        fn flatten(children: Vec<Condition>, and: bool) -> Vec<Condition> {
            let mut out = Vec::with_capacity(children.len());
            for child in children {
                match (and, child.normalize()) {
                    (true, Condition::And(grandchildren)) => out.extend(grandchildren),
                    (false, Condition::Or(grandchildren)) => out.extend(grandchildren),
                    (_, other) => out.push(other),
                }
            }
            out
        }

        match self {
            Self::Comparison(_) => self,
            Self::And(children) => Self::And(flatten(children, true)),
            Self::Or(children) => Self::Or(flatten(children, false)),
        }
    }

    /// The top-level conjuncts: the children of an `And`, or the
    /// condition itself.
    pub fn conjuncts(&self) -> &[Condition] {
        match self {
            Self::And(children) => children,
            _ => std::slice::from_ref(self),
        }
    }

    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.walk(&mut |comparison| out.push(comparison));
        out
    }

    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Comparison)) {
        match self {
            Self::Comparison(comparison) => visit(comparison),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.walk(visit);
                }
            }
        }
    }

    /// The FROM-universe relations this condition references.
    pub fn referenced_relations(&self, tables: &[String]) -> IndexSet<String> {
        let mut relations = IndexSet::new();
        self.walk(&mut |comparison| {
            for operand in [&comparison.lhs, &comparison.rhs] {
                if let Some((table, _)) = column_parts(operand) {
                    if tables.iter().any(|known| known == table) {
                        relations.insert(table.to_string());
                    }
                }
            }
        });
        relations
    }

    /// The columns of `relation` this condition references, as bare
    /// column names.
    pub fn referenced_columns(&self, relation: &str) -> IndexSet<String> {
        let mut columns = IndexSet::new();
        self.walk(&mut |comparison| {
            for operand in [&comparison.lhs, &comparison.rhs] {
                if let Some((table, column)) = column_parts(operand) {
                    if table == relation {
                        columns.insert(column.to_string());
                    }
                }
            }
        });
        columns
    }

    /// Render as SQL text parseable by the front-end, with identifier
    /// parts quoted.
    pub fn sql_text(&self) -> String {
        match self {
            Self::Comparison(comparison) => {
                format!(
                    "{} {} {}",
                    super::quote_reference(&comparison.lhs),
                    comparison.op,
                    super::quote_reference(&comparison.rhs),
                )
            }
            Self::And(children) => Self::join_sql(children, " AND "),
            Self::Or(children) => Self::join_sql(children, " OR "),
        }
    }

    fn join_sql(children: &[Condition], separator: &str) -> String {
        let joined = children
            .iter()
            .map(|child| child.sql_text())
            .collect::<Vec<_>>()
            .join(separator);
        format!("({joined})")
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comparison(comparison) => comparison.fmt(f),
            Self::And(children) => {
                let joined = children
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" && ");
                write!(f, "({joined})")
            }
            Self::Or(children) => {
                let joined = children
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" || ");
                write!(f, "({joined})")
            }
        }
    }
}

/// The condition JSON carried in request bodies.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireCondition {
    Comparison {
        lhs: String,
        op: ComparisonOp,
        rhs: String,
    },
    Compound {
        #[serde(rename = "type")]
        kind: CompoundKind,
        conditions: Vec<WireCondition>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CompoundKind {
    And,
    Or,
}

impl From<Condition> for WireCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Comparison(Comparison { lhs, op, rhs }) => {
                WireCondition::Comparison { lhs, op, rhs }
            }
            Condition::And(children) => WireCondition::Compound {
                kind: CompoundKind::And,
                conditions: children.into_iter().map(Into::into).collect(),
            },
            Condition::Or(children) => WireCondition::Compound {
                kind: CompoundKind::Or,
                conditions: children.into_iter().map(Into::into).collect(),
            },
        }
    }
}

impl From<WireCondition> for Condition {
    fn from(wire: WireCondition) -> Self {
        match wire {
            WireCondition::Comparison { lhs, op, rhs } => {
                Condition::Comparison(Comparison { lhs, op, rhs })
            }
            WireCondition::Compound { kind, conditions } => {
                let children = conditions.into_iter().map(Into::into).collect();
                match kind {
                    CompoundKind::And => Condition::And(children),
                    CompoundKind::Or => Condition::Or(children),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn cmp(lhs: &str, op: ComparisonOp, rhs: &str) -> Condition {
        Condition::comparison(lhs, op, rhs)
    }

    #[test]
    fn normalization_collapses_same_kind_nesting() {
        let a = cmp("t.a", ComparisonOp::Eq, "1");
        let b = cmp("t.b", ComparisonOp::Eq, "2");
        let c = cmp("t.c", ComparisonOp::Eq, "3");
        let d = cmp("t.d", ComparisonOp::Eq, "4");

        let nested = Condition::And(vec![
            a.clone(),
            Condition::And(vec![Condition::And(vec![b.clone(), c.clone()]), d.clone()]),
        ]);
        assert_eq!(
            nested.normalize(),
            Condition::And(vec![a, b, c, d])
        );
    }

    #[test]
    fn normalization_keeps_mixed_kinds() {
        let or = Condition::Or(vec![
            cmp("t.a", ComparisonOp::Eq, "1"),
            cmp("t.b", ComparisonOp::Eq, "2"),
        ]);
        let and = Condition::And(vec![or.clone(), cmp("t.c", ComparisonOp::Gt, "3")]);
        assert_eq!(and.clone().normalize(), and);
    }

    #[test]
    fn wire_format_matches_contract() {
        let condition = Condition::And(vec![
            cmp("user.id", ComparisonOp::Eq, "1"),
            Condition::Or(vec![
                cmp("user.status", ComparisonOp::NotEq, "'gone'"),
                cmp("user.last_seen", ComparisonOp::Gt, "'2022-01-01'"),
            ]),
        ]);

        let encoded = serde_json::to_value(&condition).expect("serializes");
        assert_eq!(
            encoded,
            json!({
                "type": "and",
                "conditions": [
                    {"lhs": "user.id", "op": "=", "rhs": "1"},
                    {
                        "type": "or",
                        "conditions": [
                            {"lhs": "user.status", "op": "!=", "rhs": "'gone'"},
                            {"lhs": "user.last_seen", "op": ">", "rhs": "'2022-01-01'"},
                        ],
                    },
                ],
            })
        );

        let decoded: Condition = serde_json::from_value(encoded).expect("deserializes");
        assert_eq!(decoded, condition);
    }

    #[test]
    fn referenced_relations_ignores_literals() {
        let tables = vec!["user".to_string(), "message".to_string()];
        let condition = Condition::And(vec![
            cmp("message.sent_at", ComparisonOp::Gt, "user.last_seen"),
            cmp("message.group", ComparisonOp::Eq, "3"),
        ]);
        let relations = condition.referenced_relations(&tables);
        assert_eq!(
            relations.into_iter().collect::<Vec<_>>(),
            vec!["message".to_string(), "user".to_string()]
        );
    }

    #[test]
    fn referenced_columns_unwrap_aggregates() {
        let condition = cmp("avg(user.last_seen)", ComparisonOp::Gt, "'2022-01-01'");
        let columns = condition.referenced_columns("user");
        assert_eq!(columns.into_iter().collect::<Vec<_>>(), vec!["last_seen"]);
    }
}
