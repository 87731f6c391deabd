//! SQLite schema creation and migration.
//!
//! Creates all tables needed by the memory graph on first boot.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: facts, entities, fact-entity association, co-occurrences, links.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Memory units (facts)
        CREATE TABLE IF NOT EXISTS memory_units (
            id TEXT PRIMARY KEY,
            bank_id TEXT NOT NULL,
            text TEXT NOT NULL,
            fact_type TEXT NOT NULL,
            embedding BLOB NOT NULL,
            event_date TEXT,
            mentioned_at TEXT NOT NULL,
            anchor_ms INTEGER NOT NULL,
            confidence_score REAL,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed_at TEXT,
            document_id TEXT,
            chunk_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_units_bank ON memory_units(bank_id);
        CREATE INDEX IF NOT EXISTS idx_units_bank_anchor ON memory_units(bank_id, anchor_ms);

        -- Canonical entities
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            bank_id TEXT NOT NULL,
            canonical_name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            mention_count INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_entities_bank_type ON entities(bank_id, entity_type);

        -- Fact <-> entity association
        CREATE TABLE IF NOT EXISTS unit_entities (
            unit_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            bank_id TEXT NOT NULL,
            anchor_ms INTEGER NOT NULL,
            PRIMARY KEY (unit_id, entity_id)
        );
        CREATE INDEX IF NOT EXISTS idx_unit_entities_entity ON unit_entities(entity_id, anchor_ms DESC);

        -- Entity co-occurrence counters (entity_id_1 < entity_id_2)
        CREATE TABLE IF NOT EXISTS entity_cooccurrences (
            bank_id TEXT NOT NULL,
            entity_id_1 TEXT NOT NULL,
            entity_id_2 TEXT NOT NULL,
            cooccurrence_count INTEGER NOT NULL DEFAULT 0,
            last_cooccurred TEXT NOT NULL,
            PRIMARY KEY (entity_id_1, entity_id_2)
        );
        CREATE INDEX IF NOT EXISTS idx_cooccurrence_2 ON entity_cooccurrences(entity_id_2);

        -- Typed links between facts
        CREATE TABLE IF NOT EXISTS memory_links (
            bank_id TEXT NOT NULL,
            from_unit_id TEXT NOT NULL,
            to_unit_id TEXT NOT NULL,
            link_type TEXT NOT NULL,
            weight REAL NOT NULL,
            entity_id TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (from_unit_id, to_unit_id, link_type)
        );
        CREATE INDEX IF NOT EXISTS idx_links_from ON memory_links(bank_id, from_unit_id);
        CREATE INDEX IF NOT EXISTS idx_links_type ON memory_links(bank_id, link_type);

        -- Migration tracking
        CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (1, datetime('now'), 'Initial schema');
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"memory_units".to_string()));
        assert!(tables.contains(&"entities".to_string()));
        assert!(tables.contains(&"unit_entities".to_string()));
        assert!(tables.contains(&"memory_links".to_string()));
        assert!(tables.contains(&"entity_cooccurrences".to_string()));
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);

        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(memory_units)")
            .unwrap()
            .query_map([], |row| row.get(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(columns.contains(&"document_id".to_string()));
        assert!(columns.contains(&"chunk_id".to_string()));

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap(); // Should not error
    }
}
