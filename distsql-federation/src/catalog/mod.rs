//! The system catalog: a hand-authored, in-memory description of storage
//! sites, logical tables, their columns, the fragments each table is
//! split into, and which site holds which fragment.
//!
//! The catalog is loaded once and treated as immutable for the lifetime
//! of a query. Lookups are linear scans over small vectors; the accessor
//! methods below are the only query surface the rest of the crate uses.

use std::sync::LazyLock;

use indexmap::IndexSet;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::error::QueryError;

pub type SiteId = u32;
pub type TableId = u32;
pub type ColumnId = u32;
pub type FragmentId = u32;

/// A reachable storage node running a site daemon and a local SQL engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub ip: String,
    pub user: String,
    pub password: String,
}

/// How a logical table is split across sites.
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
pub enum FragmentType {
    /// Not fragmented; a single fragment holds the whole table.
    #[strum(serialize = "-")]
    Unfragmented,
    /// Row-partitioned by an arithmetic predicate over column values.
    #[strum(serialize = "H")]
    Horizontal,
    /// Column-partitioned; every fragment keeps the primary key.
    #[strum(serialize = "V")]
    Vertical,
    /// Row-partitioned following a parent fragment through a foreign key.
    #[strum(serialize = "DH")]
    DerivedHorizontal,
}

/// A logical relation visible to queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub fragment_type: FragmentType,
}

/// The type of a logical column: a primitive, or a reference to another
/// table's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Str,
    Datetime,
    Reference(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub id: ColumnId,
    pub name: String,
    pub table: TableId,
    pub ty: ColumnType,
    pub pk: bool,
    pub notnull: bool,
    pub unique: bool,
}

/// One piece of a logical table, allocated to exactly one site.
///
/// The interpretation of `logic` depends on the owning table's fragment
/// type: an arithmetic row predicate for `H`, a
/// `"<fk_col>|><parent_fragment>"` link for `DH`, the comma-separated
/// non-key column list for `V`, and empty for `-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: FragmentId,
    pub name: String,
    pub logic: String,
    pub parent: FragmentId,
    pub table: TableId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub fragment: FragmentId,
    pub site: SiteId,
}

/// The parsed form of a horizontal fragment's row predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentPredicate {
    /// `col % modulus == remainder`
    Modulo {
        column: String,
        modulus: i64,
        remainder: i64,
    },
    /// `col == value`
    Equals { column: String, value: i64 },
}

impl FragmentPredicate {
    /// Parse predicates of the form `id%4==0` or `id==3`. Anything else
    /// yields `None` and the fragment is treated as unprunable.
    pub fn parse(logic: &str) -> Option<Self> {
        static MODULO: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^\s*(\w+)\s*%\s*(\d+)\s*==\s*(\d+)\s*$").expect("valid regex")
        });
        static EQUALS: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^\s*(\w+)\s*==\s*(\d+)\s*$").expect("valid regex"));

        if let Some(captures) = MODULO.captures(logic) {
            return Some(Self::Modulo {
                column: captures[1].to_string(),
                modulus: captures[2].parse().ok()?,
                remainder: captures[3].parse().ok()?,
            });
        }
        if let Some(captures) = EQUALS.captures(logic) {
            return Some(Self::Equals {
                column: captures[1].to_string(),
                value: captures[2].parse().ok()?,
            });
        }
        None
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Modulo { column, .. } | Self::Equals { column, .. } => column,
        }
    }

    /// Whether a row with `value` in the predicate column belongs to the
    /// fragment.
    pub fn matches(&self, value: i64) -> bool {
        match self {
            Self::Modulo {
                modulus, remainder, ..
            } => value.rem_euclid(*modulus) == *remainder,
            Self::Equals { value: expected, .. } => value == *expected,
        }
    }
}

/// The `"<fk_col>|><parent_fragment>"` link of a derived-horizontal
/// fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedLink {
    pub fk_column: String,
    pub parent_fragment: FragmentId,
}

/// Strip the trailing `_<n>` fragment suffix, recovering the logical
/// table name. Names without the suffix are returned unchanged.
pub fn logical_table_name(fragment_name: &str) -> &str {
    static SUFFIX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"_\d+$").expect("valid regex"));
    match SUFFIX.find(fragment_name) {
        Some(found) => &fragment_name[..found.start()],
        None => fragment_name,
    }
}

/// The full catalog. Constructed once (either the built-in deployment or
/// a hand-assembled one in tests) and then only read.
#[derive(Debug, Clone)]
pub struct SystemCatalog {
    sites: Vec<Site>,
    tables: Vec<Table>,
    columns: Vec<Column>,
    fragments: Vec<Fragment>,
    allocation: Vec<Allocation>,
}

impl SystemCatalog {
    pub fn new(
        sites: Vec<Site>,
        tables: Vec<Table>,
        columns: Vec<Column>,
        fragments: Vec<Fragment>,
        allocation: Vec<Allocation>,
    ) -> Self {
        Self {
            sites,
            tables,
            columns,
            fragments,
            allocation,
        }
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn site(&self, id: SiteId) -> Result<&Site, QueryError> {
        self.sites
            .iter()
            .find(|site| site.id == id)
            .ok_or_else(|| QueryError::catalog(format!("site {id} is not in the catalog")))
    }

    pub fn site_by_name(&self, name: &str) -> Option<&Site> {
        self.sites.iter().find(|site| site.name == name)
    }

    pub fn table(&self, id: TableId) -> Result<&Table, QueryError> {
        self.tables
            .iter()
            .find(|table| table.id == id)
            .ok_or_else(|| QueryError::catalog(format!("table {id} is not in the catalog")))
    }

    pub fn table_by_name(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn columns_of(&self, table: TableId) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(move |column| column.table == table)
    }

    /// The first primary-key column of a table. Composite keys are
    /// allowed in the catalog but fragmentation always keys on the first.
    pub fn primary_key_of(&self, table: TableId) -> Result<&Column, QueryError> {
        self.columns_of(table)
            .find(|column| column.pk)
            .ok_or_else(|| QueryError::catalog(format!("table {table} has no primary key")))
    }

    pub fn has_column(&self, table: &Table, column: &str) -> bool {
        self.columns_of(table.id).any(|c| c.name == column)
    }

    /// All tables of the FROM universe that carry a column of this name.
    pub fn tables_with_column<'a>(
        &'a self,
        table_names: &'a [String],
        column: &'a str,
    ) -> impl Iterator<Item = &'a Table> + 'a {
        table_names
            .iter()
            .filter_map(|name| self.table_by_name(name))
            .filter(move |table| self.has_column(table, column))
    }

    pub fn fragments_of(&self, table: TableId) -> Vec<&Fragment> {
        self.fragments
            .iter()
            .filter(|fragment| fragment.table == table)
            .collect()
    }

    pub fn fragment(&self, id: FragmentId) -> Result<&Fragment, QueryError> {
        self.fragments
            .iter()
            .find(|fragment| fragment.id == id)
            .ok_or_else(|| QueryError::catalog(format!("fragment {id} is not in the catalog")))
    }

    pub fn fragment_by_name(&self, name: &str) -> Option<&Fragment> {
        self.fragments.iter().find(|fragment| fragment.name == name)
    }

    pub fn site_of_fragment(&self, fragment: FragmentId) -> Result<SiteId, QueryError> {
        self.allocation
            .iter()
            .find(|allocation| allocation.fragment == fragment)
            .map(|allocation| allocation.site)
            .ok_or_else(|| {
                QueryError::catalog(format!("fragment {fragment} has no site allocation"))
            })
    }

    /// The non-key columns a vertical fragment stores, from its `logic`.
    pub fn vertical_columns(fragment: &Fragment) -> IndexSet<String> {
        fragment
            .logic
            .split(',')
            .map(|column| column.trim().to_string())
            .filter(|column| !column.is_empty())
            .collect()
    }

    /// The `DH` link of a derived-horizontal fragment. The `parent` id
    /// field is authoritative; the logic string contributes the foreign
    /// key column.
    pub fn derived_link(fragment: &Fragment) -> Result<DerivedLink, QueryError> {
        let (fk_column, _) = fragment.logic.split_once("|><").ok_or_else(|| {
            QueryError::catalog(format!(
                "fragment `{}` has a malformed derived-horizontal logic `{}`",
                fragment.name, fragment.logic
            ))
        })?;
        Ok(DerivedLink {
            fk_column: fk_column.trim().to_string(),
            parent_fragment: fragment.parent,
        })
    }

    /// Check the structural invariants the planner relies on: every
    /// fragment allocated to exactly one known site, fragment names
    /// recover their table name, and vertical fragments covering the
    /// table's non-key columns.
    pub fn validate(&self) -> Result<(), QueryError> {
        for fragment in &self.fragments {
            let owners: Vec<_> = self
                .allocation
                .iter()
                .filter(|allocation| allocation.fragment == fragment.id)
                .collect();
            if owners.len() != 1 {
                return Err(QueryError::catalog(format!(
                    "fragment `{}` has {} allocations, expected exactly 1",
                    fragment.name,
                    owners.len()
                )));
            }
            self.site(owners[0].site)?;

            let table = self
                .tables
                .iter()
                .find(|table| table.id == fragment.table)
                .ok_or_else(|| {
                    QueryError::catalog(format!(
                        "fragment `{}` references unknown table {}",
                        fragment.name, fragment.table
                    ))
                })?;
            let expected = match table.fragment_type {
                FragmentType::Unfragmented => fragment.name == table.name,
                _ => logical_table_name(&fragment.name) == table.name,
            };
            if !expected {
                return Err(QueryError::catalog(format!(
                    "fragment `{}` does not name its table `{}`",
                    fragment.name, table.name
                )));
            }
        }

        for table in &self.tables {
            if table.fragment_type != FragmentType::Vertical {
                continue;
            }
            let pk = self.primary_key_of(table.id)?;
            let mut covered = IndexSet::new();
            for fragment in self.fragments_of(table.id) {
                covered.extend(Self::vertical_columns(fragment));
            }
            for column in self.columns_of(table.id) {
                if column.name != pk.name && !covered.contains(&column.name) {
                    return Err(QueryError::catalog(format!(
                        "column `{}`.`{}` is not covered by any vertical fragment",
                        table.name, column.name
                    )));
                }
            }
        }
        Ok(())
    }
}

mod chat;
