//! Session store: the one persistence layer everything shares.
//!
//! Owns the SQLite pool and the durable copies of sessions, messages, agent
//! state and cron jobs. Working tables have `*_archive` mirrors; archiving
//! physically copies a session and its messages over and deletes them from
//! the working set in a single transaction. Search is `LIKE` over
//! `lower()`; cross-session recall ranks by in-process cosine similarity
//! over JSON-array embeddings with a keyword fallback.
//!
//! Counter updates deliberately run in their own short transaction so a
//! deadlock on the session row can never roll back persisted messages.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::aria::context::estimate_tokens;
use crate::aria::error::EngineError;
use crate::aria::types::{
    AgentState, AgentStatus, ChatMessage, CronJob, FocusType, MessageRole, PayloadType, Session,
    SessionMode, SessionStatus, SessionType, ToolCall,
};

/// Hard cap on messages per session.
pub const SESSION_MESSAGE_CAP: usize = 500;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "how", "i", "in",
    "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where",
    "which", "who", "why", "will", "with", "you", "your",
];

/// Filters for [`SessionStore::list_sessions`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub agent_id: Option<String>,
    pub session_type: Option<SessionType>,
    pub status: Option<SessionStatus>,
    /// Substring search over titles and message content.
    pub search: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl SessionFilter {
    pub fn all() -> Self {
        Self {
            limit: 50,
            ..Self::default()
        }
    }
}

/// Aggregate store statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub active_sessions: i64,
    pub ended_sessions: i64,
    pub archived_sessions: i64,
    pub total_messages: i64,
}

/// One cross-session recall hit.
#[derive(Debug, Clone)]
pub struct RecallHit {
    pub session_id: Uuid,
    pub content: String,
    pub similarity: f32,
    pub created_at: DateTime<Utc>,
}

/// One historical job run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobRun {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: String,
    pub error: Option<String>,
}

pub struct SessionStore {
    pool: SqlitePool,
    recall_cutoff: f32,
}

impl SessionStore {
    /// Connect (creating the database file if needed) and bootstrap the
    /// schema idempotently.
    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(EngineError::Database)?
            .create_if_missing(true);
        // Plain in-memory databases exist per connection; pin the pool to a
        // single connection so every query sees the same schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            recall_cutoff: 0.75,
        };
        store.init_schema().await?;
        info!("session store ready at {}", database_url);
        Ok(store)
    }

    pub fn with_recall_cutoff(mut self, cutoff: f32) -> Self {
        self.recall_cutoff = cutoff;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), EngineError> {
        const SESSION_COLUMNS: &str = r#"
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            session_type TEXT NOT NULL,
            title TEXT,
            model TEXT,
            temperature REAL NOT NULL,
            max_tokens INTEGER NOT NULL,
            context_window INTEGER NOT NULL,
            system_prompt TEXT,
            status TEXT NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            total_cost REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            ended_at TEXT,
            metadata TEXT NOT NULL DEFAULT 'null'
        "#;
        const MESSAGE_COLUMNS: &str = r#"
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            thinking TEXT,
            tool_calls TEXT NOT NULL DEFAULT '[]',
            tool_call_id TEXT,
            tool_results TEXT NOT NULL DEFAULT '{}',
            model TEXT,
            tokens_input INTEGER NOT NULL DEFAULT 0,
            tokens_output INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT 'null',
            embedding TEXT,
            created_at TEXT NOT NULL
        "#;

        let ddl = [
            format!("CREATE TABLE IF NOT EXISTS chat_sessions ({})", SESSION_COLUMNS),
            format!("CREATE TABLE IF NOT EXISTS chat_sessions_archive ({})", SESSION_COLUMNS),
            format!("CREATE TABLE IF NOT EXISTS chat_messages ({})", MESSAGE_COLUMNS),
            format!("CREATE TABLE IF NOT EXISTS chat_messages_archive ({})", MESSAGE_COLUMNS),
            r#"CREATE TABLE IF NOT EXISTS agent_state (
                agent_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                focus_type TEXT,
                model TEXT NOT NULL,
                fallback_model TEXT,
                parent_agent_id TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL,
                pheromone_score REAL NOT NULL DEFAULT 0.5,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                current_session_id TEXT,
                current_task TEXT,
                last_active_at TEXT,
                skills TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT 'null'
            )"#
            .to_string(),
            r#"CREATE TABLE IF NOT EXISTS cron_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                schedule TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                payload_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                session_mode TEXT NOT NULL,
                max_duration_seconds INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                last_status TEXT,
                last_duration_ms INTEGER,
                last_error TEXT,
                next_run_at TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#
            .to_string(),
            r#"CREATE TABLE IF NOT EXISTS cron_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT
            )"#
            .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_sessions_agent ON chat_sessions (agent_id)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_sessions_updated ON chat_sessions (updated_at DESC)"
                .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_sessions_title ON chat_sessions (title)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON chat_messages (session_id, created_at)"
                .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_cron_runs_job ON cron_runs (job_id, started_at DESC)"
                .to_string(),
        ];
        for statement in &ddl {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------

    pub async fn create_session(&self, session: &Session) -> Result<(), EngineError> {
        sqlx::query(
            r#"INSERT INTO chat_sessions (
                id, agent_id, session_type, title, model, temperature, max_tokens,
                context_window, system_prompt, status, message_count, total_tokens,
                total_cost, created_at, updated_at, ended_at, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(session.id.to_string())
        .bind(&session.agent_id)
        .bind(session.session_type.as_str())
        .bind(&session.title)
        .bind(&session.model)
        .bind(session.temperature)
        .bind(session.max_tokens as i64)
        .bind(session.context_window as i64)
        .bind(&session.system_prompt)
        .bind(session.status.as_str())
        .bind(session.message_count)
        .bind(session.total_tokens)
        .bind(session.total_cost)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.ended_at)
        .bind(session.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>, EngineError> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    /// Fetch a session or fail with `session-not-found`.
    pub async fn require_session(&self, id: Uuid) -> Result<Session, EngineError> {
        self.get_session(id)
            .await?
            .ok_or(EngineError::SessionNotFound(id))
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, EngineError> {
        let mut sql = String::from("SELECT * FROM chat_sessions WHERE 1=1");
        if filter.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if filter.session_type.is_some() {
            sql.push_str(" AND session_type = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.search.is_some() {
            sql.push_str(
                " AND (lower(coalesce(title, '')) LIKE ? OR id IN \
                 (SELECT session_id FROM chat_messages WHERE lower(content) LIKE ?))",
            );
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(agent_id) = &filter.agent_id {
            query = query.bind(agent_id);
        }
        if let Some(session_type) = &filter.session_type {
            query = query.bind(session_type.as_str());
        }
        if let Some(status) = &filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(search) = &filter.search {
            let needle = format!("%{}%", search.to_lowercase());
            query = query.bind(needle.clone()).bind(needle);
        }
        let limit = if filter.limit <= 0 { 50 } else { filter.limit };
        query = query.bind(limit).bind(filter.offset.max(0));

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(session_from_row).collect()
    }

    pub async fn set_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
    ) -> Result<(), EngineError> {
        let ended_at = match status {
            SessionStatus::Ended => Some(Utc::now()),
            SessionStatus::Active => None,
        };
        let changed = sqlx::query(
            "UPDATE chat_sessions SET status = ?, ended_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if changed.rows_affected() == 0 {
            return Err(EngineError::SessionNotFound(id));
        }
        Ok(())
    }

    pub async fn set_session_title(&self, id: Uuid, title: &str) -> Result<(), EngineError> {
        sqlx::query("UPDATE chat_sessions SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Bump session counters in a dedicated short transaction. Message
    /// persistence must never depend on this succeeding.
    pub async fn update_session_counters(
        &self,
        id: Uuid,
        added_messages: i64,
        added_tokens: i64,
        added_cost: f64,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"UPDATE chat_sessions SET
                message_count = message_count + ?,
                total_tokens = total_tokens + ?,
                total_cost = total_cost + ?,
                updated_at = ?
            WHERE id = ?"#,
        )
        .bind(added_messages)
        .bind(added_tokens)
        .bind(added_cost)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Physically archive a session: copy the session row and all message
    /// rows into the `*_archive` tables, then delete from the working set —
    /// all in one transaction.
    pub async fn archive_session(&self, id: Uuid) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        let copied = sqlx::query(
            "INSERT INTO chat_sessions_archive SELECT * FROM chat_sessions WHERE id = ?",
        )
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        if copied.rows_affected() == 0 {
            return Err(EngineError::SessionNotFound(id));
        }
        sqlx::query(
            "INSERT INTO chat_messages_archive SELECT * FROM chat_messages WHERE session_id = ?",
        )
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("archived session {}", id);
        Ok(())
    }

    pub async fn get_archived_session(
        &self,
        id: Uuid,
    ) -> Result<Option<(Session, Vec<ChatMessage>)>, EngineError> {
        let row = sqlx::query("SELECT * FROM chat_sessions_archive WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let session = session_from_row(&row)?;
        let rows = sqlx::query(
            "SELECT * FROM chat_messages_archive WHERE session_id = ? ORDER BY created_at, id",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((session, messages)))
    }

    /// Archive every session idle for longer than `days`. With `dry_run`
    /// nothing is moved, only the candidate ids are returned.
    pub async fn prune_idle_sessions(
        &self,
        days: i64,
        dry_run: bool,
    ) -> Result<Vec<Uuid>, EngineError> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let rows = sqlx::query("SELECT id FROM chat_sessions WHERE updated_at < ?")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<Uuid> = rows
            .iter()
            .filter_map(|r| Uuid::parse_str(r.get::<String, _>("id").as_str()).ok())
            .collect();
        if !dry_run {
            for id in &ids {
                self.archive_session(*id).await?;
            }
        }
        Ok(ids)
    }

    /// Delete sessions that never received a message and are older than the
    /// given age.
    pub async fn purge_ghost_sessions(&self, older_than: Duration) -> Result<u64, EngineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let deleted = sqlx::query(
            r#"DELETE FROM chat_sessions WHERE created_at < ?
               AND NOT EXISTS (SELECT 1 FROM chat_messages WHERE session_id = chat_sessions.id)"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let count = deleted.rows_affected();
        if count > 0 {
            debug!("purged {} ghost sessions", count);
        }
        Ok(count)
    }

    pub async fn stats(&self) -> Result<StoreStats, EngineError> {
        let active: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions WHERE status = 'active'")
                .fetch_one(&self.pool)
                .await?;
        let ended: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions WHERE status = 'ended'")
                .fetch_one(&self.pool)
                .await?;
        let archived: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions_archive")
            .fetch_one(&self.pool)
            .await?;
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            active_sessions: active,
            ended_sessions: ended,
            archived_sessions: archived,
            total_messages: messages,
        })
    }

    // -----------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------

    pub async fn insert_message(&self, message: &ChatMessage) -> Result<(), EngineError> {
        sqlx::query(
            r#"INSERT INTO chat_messages (
                id, session_id, role, content, thinking, tool_calls, tool_call_id,
                tool_results, model, tokens_input, tokens_output, cost, latency_ms,
                metadata, embedding, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.role.to_string())
        .bind(&message.content)
        .bind(&message.thinking)
        .bind(serde_json::to_string(&message.tool_calls)?)
        .bind(&message.tool_call_id)
        .bind(serde_json::to_string(&message.tool_results)?)
        .bind(&message.model)
        .bind(message.tokens_input)
        .bind(message.tokens_output)
        .bind(message.cost)
        .bind(message.latency_ms)
        .bind(message.metadata.to_string())
        .bind(message.embedding.as_ref().map(|e| serde_json::to_string(e).unwrap_or_default()))
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_messages(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE session_id = ? ORDER BY created_at, id",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn count_messages(&self, session_id: Uuid) -> Result<i64, EngineError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE session_id = ?")
                .bind(session_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// True when an identical user message landed in the session within the
    /// window. Backs the chat engine's dedup guard.
    pub async fn recent_duplicate_exists(
        &self,
        session_id: Uuid,
        content: &str,
        window: Duration,
    ) -> Result<bool, EngineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(5));
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM chat_messages
               WHERE session_id = ? AND role = 'user' AND content = ? AND created_at > ?"#,
        )
        .bind(session_id.to_string())
        .bind(content)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn set_message_embedding(
        &self,
        message_id: Uuid,
        embedding: &[f32],
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE chat_messages SET embedding = ? WHERE id = ?")
            .bind(serde_json::to_string(embedding)?)
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Cross-session recall
    // -----------------------------------------------------------------

    /// Recall related content from the agent's other sessions.
    ///
    /// Ranks by cosine similarity when a query embedding is supplied and the
    /// agent has embedded messages; otherwise falls back to keyword search
    /// (stopwords removed, at most five meaningful keywords). Results are
    /// trimmed to the token budget in rank order.
    pub async fn recall(
        &self,
        agent_id: &str,
        query_embedding: Option<&[f32]>,
        query_text: &str,
        token_budget: usize,
    ) -> Result<Vec<RecallHit>, EngineError> {
        let mut hits = match query_embedding {
            Some(embedding) => self.recall_by_embedding(agent_id, embedding).await?,
            None => Vec::new(),
        };
        if hits.is_empty() {
            hits = self.recall_by_keywords(agent_id, query_text).await?;
        }

        let mut kept = Vec::new();
        let mut used = 0usize;
        for hit in hits {
            let tokens = estimate_tokens(&hit.content);
            if used + tokens > token_budget {
                break;
            }
            used += tokens;
            kept.push(hit);
        }
        Ok(kept)
    }

    async fn recall_by_embedding(
        &self,
        agent_id: &str,
        query: &[f32],
    ) -> Result<Vec<RecallHit>, EngineError> {
        let rows = sqlx::query(
            r#"SELECT m.session_id, m.content, m.embedding, m.created_at
               FROM chat_messages m
               JOIN chat_sessions s ON s.id = m.session_id
               WHERE s.agent_id = ? AND m.embedding IS NOT NULL"#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::new();
        for row in &rows {
            let raw: Option<String> = row.get("embedding");
            let Some(raw) = raw else { continue };
            let Ok(embedding) = serde_json::from_str::<Vec<f32>>(&raw) else {
                continue;
            };
            let similarity = cosine_similarity(query, &embedding);
            if similarity < self.recall_cutoff {
                continue;
            }
            hits.push(RecallHit {
                session_id: parse_uuid(row.get::<String, _>("session_id").as_str())?,
                content: row.get("content"),
                similarity,
                created_at: row.get("created_at"),
            });
        }
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(hits)
    }

    async fn recall_by_keywords(
        &self,
        agent_id: &str,
        query_text: &str,
    ) -> Result<Vec<RecallHit>, EngineError> {
        let keywords = meaningful_keywords(query_text, 5);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let clauses = vec!["lower(m.content) LIKE ?"; keywords.len()].join(" OR ");
        let sql = format!(
            r#"SELECT m.session_id, m.content, m.created_at
               FROM chat_messages m
               JOIN chat_sessions s ON s.id = m.session_id
               WHERE s.agent_id = ? AND ({})
               ORDER BY m.created_at DESC LIMIT 20"#,
            clauses
        );
        let mut query = sqlx::query(&sql).bind(agent_id);
        for keyword in &keywords {
            query = query.bind(format!("%{}%", keyword));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(RecallHit {
                    session_id: parse_uuid(row.get::<String, _>("session_id").as_str())?,
                    content: row.get("content"),
                    similarity: 0.0,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------
    // Exports
    // -----------------------------------------------------------------

    pub async fn export_jsonl(&self, session_id: Uuid) -> Result<String, EngineError> {
        let messages = self.get_messages(session_id).await?;
        let mut out = String::new();
        for message in &messages {
            out.push_str(&serde_json::to_string(message)?);
            out.push('\n');
        }
        Ok(out)
    }

    pub async fn export_markdown(&self, session_id: Uuid) -> Result<String, EngineError> {
        let session = self.require_session(session_id).await?;
        let messages = self.get_messages(session_id).await?;
        let mut out = format!(
            "# {}\n\n",
            session.title.as_deref().unwrap_or("Untitled session")
        );
        for message in &messages {
            out.push_str(&format!(
                "## {} — {}\n\n{}\n\n",
                message.role,
                message.created_at.format("%Y-%m-%d %H:%M:%S"),
                message.content
            ));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Agent state
    // -----------------------------------------------------------------

    pub async fn upsert_agent(&self, agent: &AgentState) -> Result<(), EngineError> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO agent_state (
                agent_id, display_name, agent_type, focus_type, model, fallback_model,
                parent_agent_id, enabled, status, pheromone_score, consecutive_failures,
                current_session_id, current_task, last_active_at, skills, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&agent.agent_id)
        .bind(&agent.display_name)
        .bind(&agent.agent_type)
        .bind(agent.focus_type.map(|f| f.as_str()))
        .bind(&agent.model)
        .bind(&agent.fallback_model)
        .bind(&agent.parent_agent_id)
        .bind(agent.enabled)
        .bind(agent.status.as_str())
        .bind(agent.pheromone_score)
        .bind(agent.consecutive_failures as i64)
        .bind(agent.current_session_id.map(|id| id.to_string()))
        .bind(&agent.current_task)
        .bind(agent.last_active_at)
        .bind(serde_json::to_string(&agent.skills)?)
        .bind(agent.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentState>, EngineError> {
        let row = sqlx::query("SELECT * FROM agent_state WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| agent_from_row(&r)).transpose()
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentState>, EngineError> {
        let rows = sqlx::query("SELECT * FROM agent_state ORDER BY agent_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    pub async fn set_pheromone(&self, agent_id: &str, score: f64) -> Result<(), EngineError> {
        sqlx::query("UPDATE agent_state SET pheromone_score = ? WHERE agent_id = ?")
            .bind(score)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM agent_state WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Cron jobs
    // -----------------------------------------------------------------

    pub async fn upsert_job(&self, job: &CronJob) -> Result<(), EngineError> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO cron_jobs (
                id, name, schedule, agent_id, enabled, payload_type, payload,
                session_mode, max_duration_seconds, retry_count, last_run_at,
                last_status, last_duration_ms, last_error, next_run_at,
                run_count, success_count, fail_count, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(&job.agent_id)
        .bind(job.enabled)
        .bind(job.payload_type.as_str())
        .bind(job.payload.to_string())
        .bind(job.session_mode.as_str())
        .bind(job.max_duration_seconds as i64)
        .bind(job.retry_count as i64)
        .bind(job.last_run_at)
        .bind(&job.last_status)
        .bind(job.last_duration_ms)
        .bind(&job.last_error)
        .bind(job.next_run_at)
        .bind(job.run_count)
        .bind(job.success_count)
        .bind(job.fail_count)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<CronJob>, EngineError> {
        let row = sqlx::query("SELECT * FROM cron_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn list_jobs(&self, enabled_only: bool) -> Result<Vec<CronJob>, EngineError> {
        let sql = if enabled_only {
            "SELECT * FROM cron_jobs WHERE enabled = 1 ORDER BY name"
        } else {
            "SELECT * FROM cron_jobs ORDER BY name"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<bool, EngineError> {
        let deleted = sqlx::query("DELETE FROM cron_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM cron_runs WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    pub async fn record_job_run(&self, run: &JobRun) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO cron_runs (job_id, started_at, duration_ms, status, error) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run.job_id.to_string())
        .bind(run.started_at)
        .bind(run.duration_ms)
        .bind(&run.status)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn job_history(&self, job_id: Uuid, limit: i64) -> Result<Vec<JobRun>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM cron_runs WHERE job_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(job_id.to_string())
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(JobRun {
                    job_id,
                    started_at: row.get("started_at"),
                    duration_ms: row.get("duration_ms"),
                    status: row.get("status"),
                    error: row.get("error"),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping + small helpers
// ---------------------------------------------------------------------------

fn parse_uuid(raw: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(raw).map_err(|e| EngineError::Engine(format!("corrupt uuid {:?}: {}", raw, e)))
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session, EngineError> {
    let session_type: String = row.get("session_type");
    let status: String = row.get("status");
    Ok(Session {
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        agent_id: row.get("agent_id"),
        session_type: session_type.parse().map_err(EngineError::Engine)?,
        title: row.get("title"),
        model: row.get("model"),
        temperature: row.get("temperature"),
        max_tokens: row.get::<i64, _>("max_tokens") as u32,
        context_window: row.get::<i64, _>("context_window") as u32,
        system_prompt: row.get("system_prompt"),
        status: status.parse().map_err(EngineError::Engine)?,
        message_count: row.get("message_count"),
        total_tokens: row.get("total_tokens"),
        total_cost: row.get("total_cost"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        ended_at: row.get("ended_at"),
        metadata: parse_json(row.get::<String, _>("metadata").as_str()),
    })
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage, EngineError> {
    let role: String = row.get("role");
    let tool_calls: String = row.get("tool_calls");
    let tool_results: String = row.get("tool_results");
    let embedding: Option<String> = row.get("embedding");
    Ok(ChatMessage {
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        session_id: parse_uuid(row.get::<String, _>("session_id").as_str())?,
        role: role.parse::<MessageRole>().map_err(EngineError::Engine)?,
        content: row.get("content"),
        thinking: row.get("thinking"),
        tool_calls: serde_json::from_str::<Vec<ToolCall>>(&tool_calls).unwrap_or_default(),
        tool_call_id: row.get("tool_call_id"),
        tool_results: serde_json::from_str::<HashMap<String, serde_json::Value>>(&tool_results)
            .unwrap_or_default(),
        model: row.get("model"),
        tokens_input: row.get("tokens_input"),
        tokens_output: row.get("tokens_output"),
        cost: row.get("cost"),
        latency_ms: row.get("latency_ms"),
        metadata: parse_json(row.get::<String, _>("metadata").as_str()),
        embedding: embedding.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get("created_at"),
    })
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AgentState, EngineError> {
    let status: String = row.get("status");
    let focus: Option<String> = row.get("focus_type");
    let skills: String = row.get("skills");
    let current_session: Option<String> = row.get("current_session_id");
    Ok(AgentState {
        agent_id: row.get("agent_id"),
        display_name: row.get("display_name"),
        agent_type: row.get("agent_type"),
        focus_type: focus.as_deref().and_then(FocusType::parse),
        model: row.get("model"),
        fallback_model: row.get("fallback_model"),
        parent_agent_id: row.get("parent_agent_id"),
        enabled: row.get("enabled"),
        status: status.parse::<AgentStatus>().map_err(EngineError::Engine)?,
        pheromone_score: row.get("pheromone_score"),
        consecutive_failures: row.get::<i64, _>("consecutive_failures") as u32,
        current_session_id: current_session.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        current_task: row.get("current_task"),
        last_active_at: row.get("last_active_at"),
        skills: serde_json::from_str(&skills).unwrap_or_default(),
        metadata: parse_json(row.get::<String, _>("metadata").as_str()),
    })
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CronJob, EngineError> {
    let payload_type: String = row.get("payload_type");
    let session_mode: String = row.get("session_mode");
    let payload: String = row.get("payload");
    Ok(CronJob {
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        name: row.get("name"),
        schedule: row.get("schedule"),
        agent_id: row.get("agent_id"),
        enabled: row.get("enabled"),
        payload_type: payload_type
            .parse::<PayloadType>()
            .map_err(EngineError::Engine)?,
        payload: parse_json(&payload),
        session_mode: session_mode
            .parse::<SessionMode>()
            .map_err(EngineError::Engine)?,
        max_duration_seconds: row.get::<i64, _>("max_duration_seconds") as u32,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        last_run_at: row.get("last_run_at"),
        last_status: row.get("last_status"),
        last_duration_ms: row.get("last_duration_ms"),
        last_error: row.get("last_error"),
        next_run_at: row.get("next_run_at"),
        run_count: row.get("run_count"),
        success_count: row.get("success_count"),
        fail_count: row.get("fail_count"),
        created_at: row.get("created_at"),
    })
}

/// Cosine similarity; vectors of unequal length or zero norm score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Lowercased, stopword-free keywords, longest first, capped at `max`.
fn meaningful_keywords(text: &str, max: usize) -> Vec<String> {
    let mut keywords: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect();
    keywords.sort_by_key(|w| std::cmp::Reverse(w.len()));
    let mut seen = std::collections::HashSet::new();
    keywords.retain(|w| seen.insert(w.clone()));
    keywords.truncate(max);
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]);
        assert!((sim - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn keywords_skip_stopwords_and_short_words() {
        let words = meaningful_keywords("What is the deployment status of it", 5);
        assert!(words.contains(&"deployment".to_string()));
        assert!(words.contains(&"status".to_string()));
        assert!(!words.contains(&"the".to_string()));
        assert!(!words.contains(&"it".to_string()));
        assert!(words.len() <= 5);
    }
}
