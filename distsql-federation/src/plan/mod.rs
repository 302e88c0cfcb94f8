//! Site-tagged operations: the linearized form of a localized query
//! tree, executed in order by the runtime.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;

use crate::catalog::SiteId;
use crate::sql::Condition;

mod planner;

pub use planner::ExecutionPlan;
pub use planner::plan_execution;

/// One remote step. `target` is the name of the intermediate relation
/// the step materializes at `site`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub site: SiteId,
    pub kind: OpKind,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Copy `relation` from `source_site` to the operation's site under
    /// the target name.
    Fetch {
        relation: String,
        source_site: SiteId,
    },
    Union {
        left: String,
        right: String,
    },
    /// `None` condition is a Cartesian product.
    Join {
        left: String,
        right: String,
        condition: Option<Condition>,
    },
    Select {
        relation: String,
        condition: Condition,
    },
    Project {
        relation: String,
        columns: Vec<String>,
        group_by: Option<Vec<String>>,
        having: Option<Condition>,
    },
    Rename {
        from: String,
        to: String,
    },
}

impl OpKind {
    pub fn verb(&self) -> &'static str {
        match self {
            OpKind::Fetch { .. } => "fetch",
            OpKind::Union { .. } => "union",
            OpKind::Join { .. } => "join",
            OpKind::Select { .. } => "select",
            OpKind::Project { .. } => "project",
            OpKind::Rename { .. } => "rename",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "site {}: {} ", self.site, self.kind.verb())?;
        match &self.kind {
            OpKind::Fetch {
                relation,
                source_site,
            } => write!(f, "{relation} from site {source_site}")?,
            OpKind::Union { left, right } | OpKind::Join { left, right, .. } => {
                write!(f, "{left} × {right}")?
            }
            OpKind::Select { relation, .. } | OpKind::Project { relation, .. } => {
                write!(f, "{relation}")?
            }
            OpKind::Rename { from, to } => write!(f, "{from} -> {to}")?,
        }
        write!(f, " -> {}", self.target)
    }
}

/// The original fragments whose rows flow into a relation, recovered
/// from its name. Intermediates carry them after the first `-`;
/// fragment names are their own component.
pub fn component_relations(name: &str) -> Vec<String> {
    match name.split_once('-') {
        Some((_, components)) => components
            .split('-')
            .map(str::to_string)
            .sorted()
            .dedup()
            .collect(),
        None => vec![name.to_string()],
    }
}

/// `"<qid>_<step>-<sorted-unique-components>"`.
pub fn build_relation_name(
    qid: &str,
    step: usize,
    components: impl IntoIterator<Item = String>,
) -> String {
    let components = components.into_iter().sorted().dedup().join("-");
    format!("{qid}_{step}-{components}")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fragment_names_are_their_own_component() {
        assert_eq!(component_relations("group_1"), vec!["group_1"]);
    }

    #[test]
    fn intermediates_carry_their_components() {
        assert_eq!(
            component_relations("q3fa2c1s1_4-group_2-group_1"),
            vec!["group_1", "group_2"]
        );
    }

    #[test]
    fn relation_names_sort_and_dedup_components() {
        let name = build_relation_name(
            "q00s1",
            3,
            ["group_2".to_string(), "group_1".to_string(), "group_2".to_string()],
        );
        assert_eq!(name, "q00s1_3-group_1-group_2");
    }
}
