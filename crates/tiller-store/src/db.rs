use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{Result, StoreError};

/// Ordered schema migration ladder.
///
/// Each entry runs in its own transaction and bumps `PRAGMA user_version`,
/// so a partially-applied step is rolled back and retried on next startup.
/// Steps must stay append-only; never edit a shipped migration.
const MIGRATIONS: &[&str] = &[
    // v1 — initial schema
    "CREATE TABLE IF NOT EXISTS sessions (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id         TEXT NOT NULL UNIQUE,
        claude_session_id  TEXT,
        title              TEXT,
        model              TEXT NOT NULL DEFAULT 'sonnet',
        created_at         TEXT NOT NULL,
        last_activity      TEXT NOT NULL,
        input_tokens       INTEGER NOT NULL DEFAULT 0,
        output_tokens      INTEGER NOT NULL DEFAULT 0,
        total_cost_usd     REAL NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_last_activity
        ON sessions(last_activity DESC);

    CREATE TABLE IF NOT EXISTS messages (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id  TEXT NOT NULL
                    REFERENCES sessions(session_id)
                    ON DELETE CASCADE ON UPDATE CASCADE,
        role        TEXT NOT NULL,
        content     TEXT NOT NULL,
        created_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_session
        ON messages(session_id);
    CREATE INDEX IF NOT EXISTS idx_messages_created
        ON messages(created_at);

    CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
        USING fts5(content, content='messages', content_rowid='id');

    CREATE TRIGGER IF NOT EXISTS messages_fts_ai AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
    END;
    CREATE TRIGGER IF NOT EXISTS messages_fts_ad AFTER DELETE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, content)
            VALUES ('delete', old.id, old.content);
    END;
    CREATE TRIGGER IF NOT EXISTS messages_fts_au AFTER UPDATE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, content)
            VALUES ('delete', old.id, old.content);
        INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
    END;

    CREATE TABLE IF NOT EXISTS tool_calls (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id    TEXT NOT NULL
                      REFERENCES sessions(session_id)
                      ON DELETE CASCADE ON UPDATE CASCADE,
        tool_use_id   TEXT NOT NULL UNIQUE,
        tool_name     TEXT NOT NULL,
        input         TEXT NOT NULL DEFAULT '{}',
        output        TEXT,
        status        TEXT NOT NULL DEFAULT 'running'
                      CHECK (status IN ('running', 'success', 'error')),
        created_at    TEXT NOT NULL,
        completed_at  TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_tool_calls_session
        ON tool_calls(session_id);
    CREATE INDEX IF NOT EXISTS idx_tool_calls_tool_use_id
        ON tool_calls(tool_use_id);

    CREATE TABLE IF NOT EXISTS memory (
        id          TEXT PRIMARY KEY,
        title       TEXT NOT NULL,
        content     TEXT NOT NULL,
        enabled     INTEGER NOT NULL DEFAULT 1,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS machines (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        description TEXT,
        host        TEXT NOT NULL,
        port        INTEGER NOT NULL DEFAULT 22,
        username    TEXT NOT NULL,
        auth_type   TEXT NOT NULL CHECK (auth_type IN ('password', 'key')),
        auth_value  TEXT NOT NULL,
        status      TEXT,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_machines_name ON machines(name);

    CREATE TABLE IF NOT EXISTS settings (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );",
    // v2 — tighten messages.role to the known set. SQLite cannot add a CHECK
    // to an existing table, so the table is rebuilt and its triggers
    // recreated; the FTS index survives because row ids are preserved.
    "CREATE TABLE messages_new (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id  TEXT NOT NULL
                    REFERENCES sessions(session_id)
                    ON DELETE CASCADE ON UPDATE CASCADE,
        role        TEXT NOT NULL
                    CHECK (role IN ('user', 'assistant', 'thinking')),
        content     TEXT NOT NULL,
        created_at  TEXT NOT NULL
    );
    INSERT INTO messages_new (id, session_id, role, content, created_at)
        SELECT id, session_id, role, content, created_at FROM messages;
    DROP TABLE messages;
    ALTER TABLE messages_new RENAME TO messages;

    CREATE INDEX idx_messages_session ON messages(session_id);
    CREATE INDEX idx_messages_created ON messages(created_at);

    CREATE TRIGGER messages_fts_ai AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
    END;
    CREATE TRIGGER messages_fts_ad AFTER DELETE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, content)
            VALUES ('delete', old.id, old.content);
    END;
    CREATE TRIGGER messages_fts_au AFTER UPDATE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, content)
            VALUES ('delete', old.id, old.content);
        INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
    END;",
];

/// Open the database file, apply pragmas and the migration ladder.
pub fn open(path: &str) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    configure(&conn)?;
    migrate(&mut conn)?;
    ensure_fts_populated(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema; used by tests.
pub fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrate(&mut conn)?;
    ensure_fts_populated(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    // journal_mode reports the resulting mode, so it must be read as a row.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Run every migration step past the current `user_version`.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let current: usize =
        conn.query_row("SELECT user_version FROM pragma_user_version", [], |row| {
            row.get::<_, i64>(0)
        })? as usize;

    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = idx + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|source| StoreError::Schema { version, source })?;
        tx.pragma_update(None, "user_version", version as i64)
            .map_err(|source| StoreError::Schema { version, source })?;
        tx.commit()
            .map_err(|source| StoreError::Schema { version, source })?;
        info!(version, "applied schema migration");
    }
    Ok(())
}

/// One-shot FTS population for databases written before the index existed
/// (or after an interrupted rebuild). No-op when the index is in lockstep.
fn ensure_fts_populated(conn: &Connection) -> Result<()> {
    let messages: i64 = conn.query_row("SELECT count(*) FROM messages", [], |r| r.get(0))?;
    let indexed: i64 = conn.query_row("SELECT count(*) FROM messages_fts", [], |r| r.get(0))?;

    if messages > 0 && indexed == 0 {
        warn!(messages, "full-text index empty, rebuilding");
        conn.execute(
            "INSERT INTO messages_fts(messages_fts) VALUES ('rebuild')",
            [],
        )?;
    }
    Ok(())
}
