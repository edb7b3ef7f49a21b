use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, instrument};
use uuid::Uuid;

use tiller_core::types::{ModelTier, Usage};

use crate::crypto::Crypto;
use crate::db;
use crate::error::{conflict, not_found, Result, StoreError};
use crate::types::*;

/// Durable, single-writer persistence with full-text search.
///
/// Wraps one SQLite connection in a `Mutex` — the connection-pool cap of 1
/// the schema is designed around. Statements hold the writer only for their
/// own duration; the only multi-statement transaction is `relink_session`.
pub struct Store {
    db: Mutex<Connection>,
    crypto: Crypto,
}

impl Store {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            db: Mutex::new(db::open(path)?),
            crypto: Crypto::derive(path),
        })
    }

    /// Fully-migrated in-memory store; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Mutex::new(db::open_in_memory()?),
            crypto: Crypto::derive(":memory:"),
        })
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Create a session row. Fails with `Conflict` when the id is taken.
    #[instrument(skip(self))]
    pub fn create_session(&self, session_id: &str, model: ModelTier) -> Result<SessionRecord> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT INTO sessions (session_id, model, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?3)",
            rusqlite::params![session_id, model.wire_name(), now],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(conflict("session", session_id));
            }
            Err(e) => return Err(e.into()),
        }
        db.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
            rusqlite::params![session_id],
            row_to_session,
        )
        .map_err(StoreError::from)
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
            rusqlite::params![session_id],
            row_to_session,
        ) {
            Ok(s) => Ok(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(not_found("session", session_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// All sessions, most recently active first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY last_activity DESC"
        ))?;
        let rows = stmt.query_map([], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete a session; messages and tool-calls cascade.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            rusqlite::params![session_id],
        )?;
        if changed == 0 {
            return Err(not_found("session", session_id));
        }
        Ok(())
    }

    pub fn update_session_title(&self, session_id: &str, title: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions SET title = ?1 WHERE session_id = ?2",
            rusqlite::params![title, session_id],
        )?;
        if changed == 0 {
            return Err(not_found("session", session_id));
        }
        Ok(())
    }

    /// Record the upstream's correlation id for a session.
    pub fn set_claude_session_id(&self, session_id: &str, claude_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions SET claude_session_id = ?1 WHERE session_id = ?2",
            rusqlite::params![claude_id, session_id],
        )?;
        if changed == 0 {
            return Err(not_found("session", session_id));
        }
        Ok(())
    }

    /// Add a usage snapshot to the session's cumulative counters.
    pub fn add_usage(&self, session_id: &str, usage: &Usage) -> Result<()> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions
             SET input_tokens   = input_tokens + ?1,
                 output_tokens  = output_tokens + ?2,
                 total_cost_usd = total_cost_usd + ?3,
                 last_activity  = ?4
             WHERE session_id = ?5",
            rusqlite::params![
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.total_cost_usd,
                now,
                session_id
            ],
        )?;
        if changed == 0 {
            return Err(not_found("session", session_id));
        }
        Ok(())
    }

    /// Bump `last_activity` to now.
    pub fn touch_session(&self, session_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE session_id = ?2",
            rusqlite::params![now, session_id],
        )?;
        Ok(())
    }

    /// Atomically rename a session's primary id.
    ///
    /// The upstream may mint a new correlation id on resume; the client-visible
    /// id follows it so reconnecting clients keep one continuous thread. The
    /// `ON UPDATE CASCADE` foreign keys rekey messages and tool-calls inside
    /// the same transaction.
    #[instrument(skip(self))]
    pub fn relink_session(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let taken: i64 = tx.query_row(
            "SELECT count(*) FROM sessions WHERE session_id = ?1",
            rusqlite::params![new_id],
            |r| r.get(0),
        )?;
        if taken > 0 {
            return Err(conflict("session", new_id));
        }

        let changed = tx.execute(
            "UPDATE sessions SET session_id = ?1, claude_session_id = ?1
             WHERE session_id = ?2",
            rusqlite::params![new_id, old_id],
        )?;
        if changed == 0 {
            return Err(not_found("session", old_id));
        }

        tx.commit()?;
        debug!(old_id, new_id, "session relinked");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append a message with a server-assigned timestamp. The FTS replica is
    /// updated by triggers inside the same implicit transaction.
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<MessageRecord> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session_id, role.as_str(), content, now],
        )?;
        let id = db.last_insert_rowid();
        Ok(MessageRecord {
            id,
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Messages for a session, ascending by creation time.
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_id, role, content, created_at
             FROM messages WHERE session_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count_messages(&self, session_id: &str) -> Result<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT count(*) FROM messages WHERE session_id = ?1",
            rusqlite::params![session_id],
            |r| r.get(0),
        )?)
    }

    /// Full-text search across message content.
    ///
    /// The query is wrapped as a phrase so FTS operator metacharacters in
    /// user input (`-`, `*`, `NEAR`, …) are matched literally rather than
    /// interpreted. Returns hits ordered by rank plus the total match count.
    #[instrument(skip(self))]
    pub fn search_messages(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<SearchHit>, usize)> {
        let phrase = format!("\"{}\"", query.replace('"', "\"\""));
        let db = self.db.lock().unwrap();

        let total: i64 = db.query_row(
            "SELECT count(*) FROM messages_fts WHERE messages_fts MATCH ?1",
            rusqlite::params![phrase],
            |r| r.get(0),
        )?;

        let mut stmt = db.prepare(
            "SELECT m.id, m.session_id, m.role, m.content, m.created_at,
                    snippet(messages_fts, 0, '<mark>', '</mark>', '…', 32)
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.rowid
             WHERE messages_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![phrase, limit as i64, offset as i64],
            |row| {
                Ok(SearchHit {
                    message: row_to_message(row)?,
                    snippet: row.get(5)?,
                })
            },
        )?;
        Ok((rows.filter_map(|r| r.ok()).collect(), total as usize))
    }

    // ------------------------------------------------------------------
    // Tool calls
    // ------------------------------------------------------------------

    /// Record the start of a tool invocation. Idempotent: re-observing the
    /// same `tool_use_id` is a no-op.
    pub fn upsert_tool_call(
        &self,
        tool_use_id: &str,
        session_id: &str,
        tool_name: &str,
        input: &serde_json::Value,
    ) -> Result<()> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO tool_calls
             (session_id, tool_use_id, tool_name, input, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
            rusqlite::params![session_id, tool_use_id, tool_name, input.to_string(), now],
        )?;
        Ok(())
    }

    /// Record a tool's terminal result. Fails with `NotFound` when no start
    /// frame was ever observed for this id.
    pub fn finalize_tool_call(
        &self,
        tool_use_id: &str,
        input: &serde_json::Value,
        output: &str,
        status: ToolStatus,
    ) -> Result<()> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE tool_calls
             SET input = ?1, output = ?2, status = ?3, completed_at = ?4
             WHERE tool_use_id = ?5",
            rusqlite::params![input.to_string(), output, status.as_str(), now, tool_use_id],
        )?;
        if changed == 0 {
            return Err(not_found("tool call", tool_use_id));
        }
        Ok(())
    }

    pub fn get_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCallRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_id, tool_use_id, tool_name, input, output,
                    status, created_at, completed_at
             FROM tool_calls WHERE session_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id], row_to_tool_call)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_tool_call(&self, tool_use_id: &str) -> Result<ToolCallRecord> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, session_id, tool_use_id, tool_name, input, output,
                    status, created_at, completed_at
             FROM tool_calls WHERE tool_use_id = ?1",
            rusqlite::params![tool_use_id],
            row_to_tool_call,
        ) {
            Ok(t) => Ok(t),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(not_found("tool call", tool_use_id)),
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn create_memory(&self, title: &str, content: &str) -> Result<MemoryEntry> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO memory (id, title, content, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)",
            rusqlite::params![id, title, content, now],
        )?;
        Ok(MemoryEntry {
            id,
            title: title.to_string(),
            content: content.to_string(),
            enabled: true,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn update_memory(
        &self,
        id: &str,
        title: &str,
        content: &str,
        enabled: bool,
    ) -> Result<()> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE memory SET title = ?1, content = ?2, enabled = ?3, updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![title, content, enabled as i64, now, id],
        )?;
        if changed == 0 {
            return Err(not_found("memory entry", id));
        }
        Ok(())
    }

    pub fn delete_memory(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("DELETE FROM memory WHERE id = ?1", rusqlite::params![id])?;
        if changed == 0 {
            return Err(not_found("memory entry", id));
        }
        Ok(())
    }

    pub fn list_memory(&self) -> Result<Vec<MemoryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, title, content, enabled, created_at, updated_at
             FROM memory ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Entries injected into every outgoing prompt.
    pub fn enabled_memory(&self) -> Result<Vec<MemoryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, title, content, enabled, created_at, updated_at
             FROM memory WHERE enabled = 1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Machines
    // ------------------------------------------------------------------

    /// Register an SSH target. The credential is encrypted before it touches
    /// the database.
    #[allow(clippy::too_many_arguments)]
    pub fn create_machine(
        &self,
        name: &str,
        description: Option<&str>,
        host: &str,
        port: u16,
        username: &str,
        auth_type: AuthType,
        auth_value: &str,
    ) -> Result<Machine> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let sealed = self.crypto.encrypt(auth_value)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO machines
             (id, name, description, host, port, username, auth_type, auth_value,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            rusqlite::params![
                id,
                name,
                description,
                host,
                port,
                username,
                auth_type.as_str(),
                sealed,
                now
            ],
        )?;
        Ok(Machine {
            id,
            name: name.to_string(),
            description: description.map(String::from),
            host: host.to_string(),
            port,
            username: username.to_string(),
            auth_type,
            auth_value: sealed,
            status: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_machine(&self, id: &str) -> Result<Machine> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE id = ?1"),
            rusqlite::params![id],
            row_to_machine,
        ) {
            Ok(m) => Ok(m),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(not_found("machine", id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_machines(&self) -> Result<Vec<Machine>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MACHINE_COLUMNS} FROM machines ORDER BY name ASC"
        ))?;
        let rows = stmt.query_map([], row_to_machine)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_machine(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("DELETE FROM machines WHERE id = ?1", rusqlite::params![id])?;
        if changed == 0 {
            return Err(not_found("machine", id));
        }
        Ok(())
    }

    pub fn update_machine_status(&self, id: &str, status: &str) -> Result<()> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE machines SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status, now, id],
        )?;
        if changed == 0 {
            return Err(not_found("machine", id));
        }
        Ok(())
    }

    /// The decrypted credential for a machine.
    pub fn machine_auth(&self, id: &str) -> Result<String> {
        let machine = self.get_machine(id)?;
        Ok(self.crypto.decrypt(&machine.auth_value)?)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            rusqlite::params![key],
            |r| r.get::<_, String>(0),
        ) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                           updated_at = excluded.updated_at",
            rusqlite::params![key, value, now],
        )?;
        Ok(())
    }
}

const SESSION_COLUMNS: &str = "id, session_id, claude_session_id, title, model, \
     created_at, last_activity, input_tokens, output_tokens, total_cost_usd";

const MACHINE_COLUMNS: &str = "id, name, description, host, port, username, \
     auth_type, auth_value, status, created_at, updated_at";

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let model_str: String = row.get(4)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        claude_session_id: row.get(2)?,
        title: row.get(3)?,
        model: model_str.parse().unwrap_or(ModelTier::Balanced),
        created_at: row.get(5)?,
        last_activity: row.get(6)?,
        input_tokens: row.get(7)?,
        output_tokens: row.get(8)?,
        total_cost_usd: row.get(9)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role_str: String = row.get(2)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role_str.parse().unwrap_or(Role::User),
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_tool_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    let input_str: String = row.get(4)?;
    let status_str: String = row.get(6)?;
    Ok(ToolCallRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        tool_use_id: row.get(2)?,
        tool_name: row.get(3)?,
        input: serde_json::from_str(&input_str)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        output: row.get(5)?,
        status: status_str.parse().unwrap_or(ToolStatus::Running),
        created_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    Ok(MemoryEntry {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_machine(row: &rusqlite::Row<'_>) -> rusqlite::Result<Machine> {
    let auth_str: String = row.get(6)?;
    Ok(Machine {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        host: row.get(3)?,
        port: row.get::<_, i64>(4)? as u16,
        username: row.get(5)?,
        auth_type: auth_str.parse().unwrap_or(AuthType::Password),
        auth_value: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
