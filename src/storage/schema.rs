//! Table schema and additive migrations.

/// Schema version this build migrates stores to.
pub const SCHEMA_VERSION: i64 = 1;

pub const SETTINGS: &str = "settings";
pub const USERS: &str = "users";
pub const LOCATIONS: &str = "locations";
pub const SCHEDULED_TASKS: &str = "scheduled-tasks";
pub const ATTACHMENTS: &str = "attachments";
pub const METADATA: &str = "metadata";

/// Every table known at `SCHEMA_VERSION`, in load order.
pub const TABLES: &[&str] = &[SETTINGS, USERS, LOCATIONS, SCHEDULED_TASKS, ATTACHMENTS, METADATA];

/// One additive migration: the tables that first exist at `version`.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub tables: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    tables: TABLES,
}];

pub fn is_known_table(name: &str) -> bool {
    TABLES.contains(&name)
}

/// Migrations to apply, in order, when moving a store from `from` to `to`.
///
/// Every version in `(from, to]` is visited; versions without a migration are
/// stepped over. A store already at `to` gets nothing.
pub fn pending_migrations(from: i64, to: i64) -> Vec<&'static Migration> {
    ((from + 1)..=to)
        .filter_map(|version| MIGRATIONS.iter().find(|m| m.version == version))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_store_gets_every_migration() {
        let pending = pending_migrations(0, SCHEMA_VERSION);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 1);
        assert!(pending[0].tables.contains(&SCHEDULED_TASKS));
    }

    #[test]
    fn test_current_store_gets_nothing() {
        assert!(pending_migrations(SCHEMA_VERSION, SCHEMA_VERSION).is_empty());
        assert!(pending_migrations(SCHEMA_VERSION + 3, SCHEMA_VERSION).is_empty());
    }

    #[test]
    fn test_known_tables() {
        assert!(is_known_table("metadata"));
        assert!(!is_known_table("rooms"));
    }
}
