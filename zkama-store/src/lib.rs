//! zkama-store
//!
//! SQLite cache of AMA sessions and questions. The chain is the source of
//! truth for membership and votes; this store exists so listings do not need
//! an RPC round-trip. Rows are written provisionally (`is_posted = 0`) to
//! allocate their identifier, and become visible only after the caller
//! confirms the corresponding on-chain transaction succeeded.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use zkama_common::{unix_time_secs, QuestionId, SessionId, SessionStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Input for a provisional session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub name: String,
    pub hosts: String,
    pub description: String,
    pub owner: String,
    /// `0x`-hex Keccak-256 of the access code, or `None` for an open session.
    pub access_code_hash: Option<String>,
}

/// Session row as exposed by the public listing. The access-code hash itself
/// never leaves the store; only its presence does.
#[derive(Debug, Clone, Serialize)]
pub struct PublicSession {
    pub session_id: SessionId,
    pub name: String,
    pub hosts: String,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: u8,
    pub req_access_code: bool,
}

/// Session row as exposed to its owner and by the detail endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OwnedSession {
    pub session_id: SessionId,
    pub name: String,
    pub hosts: String,
    pub description: String,
    pub owner: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: u8,
}

/// Question row as exposed by the listing.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionRow {
    pub question_id: QuestionId,
    pub content: String,
    pub created_at: i64,
    pub votes: i64,
}

/// Handle to the relational cache.
///
/// Cloning is cheap; all clones share one connection. SQLite calls are
/// short and synchronous, the same way the reference backend drives its
/// embedded store directly from request handlers.
#[derive(Clone)]
pub struct AmaStore {
    conn: Arc<Mutex<Connection>>,
}

impl AmaStore {
    /// Open or create the cache database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!("opened session cache at {}", path.as_ref().display());
        Ok(store)
    }

    /// In-memory cache, for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ama_sessions (
                session_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                hosts TEXT NOT NULL,
                description TEXT NOT NULL,
                owner TEXT NOT NULL,
                access_code_hash TEXT,
                status INTEGER NOT NULL DEFAULT 1,
                is_posted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ama_questions (
                question_id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0,
                is_posted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_owner ON ama_sessions(owner);
            CREATE INDEX IF NOT EXISTS idx_questions_session ON ama_questions(session_id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    /// Insert a provisional session row and return its generated id.
    ///
    /// The row stays invisible to every listing until
    /// [`confirm_session_posted`](Self::confirm_session_posted) flips it.
    pub fn create_session(&self, new: &NewSession) -> Result<SessionId, StoreError> {
        let now = unix_time_secs();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ama_sessions (name, hosts, description, owner, access_code_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                new.name,
                new.hosts,
                new.description,
                new.owner,
                new.access_code_hash,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Flip a session's posted flag after its on-chain creation succeeded.
    /// Scoped to the owning address; returns whether a row matched.
    pub fn confirm_session_posted(
        &self,
        session_id: SessionId,
        owner: &str,
    ) -> Result<bool, StoreError> {
        let now = unix_time_secs();
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE ama_sessions SET is_posted = 1, updated_at = ?1
             WHERE session_id = ?2 AND owner = ?3",
            params![now, session_id, owner],
        )?;
        Ok(changed > 0)
    }

    /// Mirror an owner's on-chain status transition into the cache.
    pub fn set_session_status(
        &self,
        session_id: SessionId,
        owner: &str,
        status: SessionStatus,
    ) -> Result<bool, StoreError> {
        let now = unix_time_secs();
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE ama_sessions SET status = ?1, updated_at = ?2
             WHERE session_id = ?3 AND owner = ?4",
            params![status.as_u8(), now, session_id, owner],
        )?;
        Ok(changed > 0)
    }

    /// Single-session detail, regardless of posted flag (the owner polls this
    /// while the creation transaction is still in flight).
    pub fn session(&self, session_id: SessionId) -> Result<Option<OwnedSession>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT session_id, name, hosts, description, owner, created_at, updated_at, status
                 FROM ama_sessions WHERE session_id = ?1",
                params![session_id],
                Self::owned_session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Public listing: posted sessions that have not ended, newest update
    /// first. NotStarted sessions are announced; Active ones are live.
    pub fn list_public_sessions(&self) -> Result<Vec<PublicSession>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, name, hosts, description, created_at, updated_at, status,
                    (access_code_hash IS NOT NULL)
             FROM ama_sessions
             WHERE status IN (?1, ?2) AND is_posted = 1
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(
            params![
                SessionStatus::NotStarted.as_u8(),
                SessionStatus::Active.as_u8()
            ],
            |row| {
                Ok(PublicSession {
                    session_id: row.get(0)?,
                    name: row.get(1)?,
                    hosts: row.get(2)?,
                    description: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                    status: row.get(6)?,
                    req_access_code: row.get(7)?,
                })
            },
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// All posted sessions belonging to `owner`, newest first.
    pub fn list_owner_sessions(&self, owner: &str) -> Result<Vec<OwnedSession>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, name, hosts, description, owner, created_at, updated_at, status
             FROM ama_sessions
             WHERE owner = ?1 AND is_posted = 1
             ORDER BY session_id DESC",
        )?;
        let rows = stmt.query_map(params![owner], Self::owned_session_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Join gate: the session must be running (Active or Paused) and the
    /// supplied code hash must match the stored one, if any. The comparison
    /// happens in SQL so an absent hash means an open session.
    pub fn check_join_access(
        &self,
        session_id: SessionId,
        code_hash: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock();
        let found: Option<SessionId> = match code_hash {
            Some(hash) => conn
                .query_row(
                    "SELECT session_id FROM ama_sessions
                     WHERE session_id = ?1 AND status IN (?2, ?3)
                       AND (access_code_hash IS NULL OR access_code_hash = ?4)",
                    params![
                        session_id,
                        SessionStatus::Active.as_u8(),
                        SessionStatus::Paused.as_u8(),
                        hash
                    ],
                    |row| row.get(0),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT session_id FROM ama_sessions
                     WHERE session_id = ?1 AND status IN (?2, ?3)
                       AND access_code_hash IS NULL",
                    params![
                        session_id,
                        SessionStatus::Active.as_u8(),
                        SessionStatus::Paused.as_u8()
                    ],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(found.is_some())
    }

    /// Insert a provisional question row and return its generated id. The id
    /// is handed back to the caller because it seeds the action nullifier for
    /// the on-chain call.
    pub fn insert_question(
        &self,
        session_id: SessionId,
        content: &str,
    ) -> Result<QuestionId, StoreError> {
        let now = unix_time_secs();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ama_questions (session_id, content, created_at, is_posted)
             VALUES (?1, ?2, ?3, 0)",
            params![session_id, content, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Flip a question's posted flag after `postQuestion` succeeded on-chain.
    pub fn confirm_question_posted(&self, question_id: QuestionId) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE ama_questions SET is_posted = 1 WHERE question_id = ?1",
            params![question_id],
        )?;
        Ok(changed > 0)
    }

    /// Adopt the authoritative vote count from the chain's `QuestionVoted`
    /// event.
    pub fn set_question_votes(
        &self,
        question_id: QuestionId,
        votes: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE ama_questions SET votes = ?1 WHERE question_id = ?2",
            params![votes, question_id],
        )?;
        Ok(changed > 0)
    }

    /// Posted questions for a session, most voted first, oldest first among
    /// ties.
    pub fn list_questions(&self, session_id: SessionId) -> Result<Vec<QuestionRow>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT question_id, content, created_at, votes
             FROM ama_questions
             WHERE session_id = ?1 AND is_posted = 1
             ORDER BY votes DESC, created_at ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(QuestionRow {
                question_id: row.get(0)?,
                content: row.get(1)?,
                created_at: row.get(2)?,
                votes: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Delete provisional rows whose on-chain confirmation never arrived.
    ///
    /// Rows created at or before `cutoff` with `is_posted = 0` are reaped;
    /// returns `(sessions, questions)` deleted. Called from the backend's
    /// reconciliation task.
    pub fn reap_orphans(&self, cutoff: i64) -> Result<(usize, usize), StoreError> {
        let conn = self.lock();
        let sessions = conn.execute(
            "DELETE FROM ama_sessions WHERE is_posted = 0 AND created_at <= ?1",
            params![cutoff],
        )?;
        let questions = conn.execute(
            "DELETE FROM ama_questions WHERE is_posted = 0 AND created_at <= ?1",
            params![cutoff],
        )?;
        Ok((sessions, questions))
    }

    fn owned_session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OwnedSession> {
        Ok(OwnedSession {
            session_id: row.get(0)?,
            name: row.get(1)?,
            hosts: row.get(2)?,
            description: row.get(3)?,
            owner: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            status: row.get(7)?,
        })
    }
}
