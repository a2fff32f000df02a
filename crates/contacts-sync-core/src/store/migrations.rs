//! Database migrations

use rusqlite::{Connection, OptionalExtension};

use crate::error::StoreResult;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> StoreResult<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> StoreResult<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Migration to version 1: credentials, sync links and cursors
fn migrate_v1(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS oauth_credentials (
            owner_id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            token_type TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            scopes TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_links (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            local_id TEXT NOT NULL,
            remote_id TEXT,
            last_synced_at INTEGER,
            last_modified_side TEXT NOT NULL,
            status TEXT NOT NULL,
            conflict_payload TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (local_id, owner_id),
            CHECK (status <> 'conflict' OR conflict_payload IS NOT NULL)
        );
        CREATE INDEX IF NOT EXISTS idx_sync_links_owner ON sync_links(owner_id);
        CREATE INDEX IF NOT EXISTS idx_sync_links_remote ON sync_links(owner_id, remote_id);

        CREATE TABLE IF NOT EXISTS sync_cursors (
            owner_id TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: durable pending OAuth states
fn migrate_v2(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS oauth_states (
            state TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_oauth_states_expiry ON oauth_states(expires_at);

        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_reach_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_conflict_rows_require_payload() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        let result = conn.execute(
            "INSERT INTO sync_links (id, owner_id, local_id, last_modified_side, status, created_at, updated_at)
             VALUES ('l1', 'o1', 'c1', 'local', 'conflict', 0, 0)",
            [],
        );
        assert!(result.is_err());
    }
}
