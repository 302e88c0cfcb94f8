//! The built-in deployment: a four-site chat database exercising every
//! fragmentation kind. `user` is split vertically, `group` horizontally
//! by `id % 4`, `message` follows its group fragment through the `group`
//! foreign key, and `group_member` lives whole at one site.

use super::Allocation;
use super::Column;
use super::ColumnType;
use super::Fragment;
use super::FragmentType;
use super::Site;
use super::SystemCatalog;
use super::Table;
use super::TableId;

fn column(id: u32, name: &str, table: TableId, ty: ColumnType, pk: bool, unique: bool) -> Column {
    Column {
        id,
        name: name.to_string(),
        table,
        ty,
        pk,
        notnull: true,
        unique,
    }
}

fn fragment(id: u32, name: &str, logic: &str, parent: u32, table: TableId) -> Fragment {
    Fragment {
        id,
        name: name.to_string(),
        logic: logic.to_string(),
        parent,
        table,
    }
}

impl SystemCatalog {
    /// The hand-authored chat catalog used by the default deployment and
    /// by most tests.
    pub fn chat() -> Self {
        let sites = vec![
            Site {
                id: 1,
                name: "n1".to_string(),
                ip: "172.20.0.2".to_string(),
                user: "user".to_string(),
                password: "password".to_string(),
            },
            Site {
                id: 2,
                name: "n2".to_string(),
                ip: "172.20.0.3".to_string(),
                user: "user".to_string(),
                password: "password".to_string(),
            },
            Site {
                id: 3,
                name: "n3".to_string(),
                ip: "172.20.0.4".to_string(),
                user: "user".to_string(),
                password: "password".to_string(),
            },
            Site {
                id: 4,
                name: "n4".to_string(),
                ip: "172.20.0.5".to_string(),
                user: "user".to_string(),
                password: "password".to_string(),
            },
        ];

        let tables = vec![
            Table {
                id: 1,
                name: "user".to_string(),
                fragment_type: FragmentType::Vertical,
            },
            Table {
                id: 2,
                name: "group".to_string(),
                fragment_type: FragmentType::Horizontal,
            },
            Table {
                id: 3,
                name: "message".to_string(),
                fragment_type: FragmentType::DerivedHorizontal,
            },
            Table {
                id: 4,
                name: "group_member".to_string(),
                fragment_type: FragmentType::Unfragmented,
            },
        ];

        let columns = vec![
            column(1, "id", 1, ColumnType::Int, true, true),
            column(2, "name", 1, ColumnType::Str, false, false),
            column(3, "username", 1, ColumnType::Str, false, true),
            column(4, "phone", 1, ColumnType::Str, false, true),
            column(5, "email", 1, ColumnType::Str, false, true),
            column(6, "status", 1, ColumnType::Str, false, false),
            column(7, "last_seen", 1, ColumnType::Datetime, false, false),
            column(8, "id", 2, ColumnType::Int, true, true),
            column(9, "name", 2, ColumnType::Str, false, false),
            column(
                10,
                "created_by",
                2,
                ColumnType::Reference("user".to_string()),
                false,
                false,
            ),
            column(11, "id", 3, ColumnType::Int, true, true),
            column(
                12,
                "group",
                3,
                ColumnType::Reference("group".to_string()),
                false,
                false,
            ),
            column(
                13,
                "author",
                3,
                ColumnType::Reference("user".to_string()),
                false,
                false,
            ),
            column(14, "content", 3, ColumnType::Str, false, false),
            column(15, "sent_at", 3, ColumnType::Datetime, false, false),
            column(
                16,
                "group",
                4,
                ColumnType::Reference("group".to_string()),
                true,
                false,
            ),
            column(
                17,
                "user",
                4,
                ColumnType::Reference("user".to_string()),
                true,
                false,
            ),
        ];

        let fragments = vec![
            fragment(1, "user_1", "username,last_seen", 1, 1),
            fragment(2, "user_2", "name,status", 2, 1),
            fragment(3, "user_3", "phone,email", 3, 1),
            fragment(4, "group_1", "id%4==0", 4, 2),
            fragment(5, "group_2", "id%4==1", 5, 2),
            fragment(6, "group_3", "id%4==2", 6, 2),
            fragment(7, "group_4", "id%4==3", 7, 2),
            fragment(8, "message_1", "group|><group_1", 4, 3),
            fragment(9, "message_2", "group|><group_2", 5, 3),
            fragment(10, "message_3", "group|><group_3", 6, 3),
            fragment(11, "message_4", "group|><group_4", 7, 3),
            fragment(12, "group_member", "", 12, 4),
        ];

        let allocation = vec![
            Allocation { fragment: 1, site: 1 },
            Allocation { fragment: 2, site: 2 },
            Allocation { fragment: 3, site: 3 },
            Allocation { fragment: 4, site: 1 },
            Allocation { fragment: 5, site: 2 },
            Allocation { fragment: 6, site: 3 },
            Allocation { fragment: 7, site: 4 },
            Allocation { fragment: 8, site: 1 },
            Allocation { fragment: 9, site: 2 },
            Allocation { fragment: 10, site: 3 },
            Allocation { fragment: 11, site: 4 },
            Allocation { fragment: 12, site: 4 },
        ];

        Self::new(sites, tables, columns, fragments, allocation)
    }
}
