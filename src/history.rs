//! Boundary Repositories
//!
//! SQLite-backed state consumed and produced at the edge of the
//! orchestration core: conversation history per chat, the last-command
//! record (for "retry"), short-term agent context (recent tool calls and
//! generated asset URLs), and scheduled tasks.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Maximum messages kept per chat (rolling window)
const MAX_MESSAGES_PER_CHAT: usize = 50;

/// Default TTL in seconds (7 days)
const DEFAULT_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Recent tool calls kept per chat
const MAX_TOOL_CALLS_PER_CHAT: usize = 20;

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String, // "user" or "assistant"
    pub content: String,
    pub media_kind: Option<String>,
    pub timestamp: i64,
}

/// One recent tool invocation, part of the short-term agent context
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool: String,
    pub media_kind: Option<String>,
    pub asset_url: Option<String>,
    pub timestamp: i64,
}

/// A scheduled task row
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub chat_id: i64,
    pub command: String,
    pub schedule: String,
    pub active: bool,
}

/// History store with SQLite backend
pub struct HistoryStore {
    conn: Mutex<Connection>,
    max_messages: usize,
    ttl_seconds: i64,
}

impl HistoryStore {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            max_messages: MAX_MESSAGES_PER_CHAT,
            ttl_seconds: DEFAULT_TTL_SECONDS,
        };
        store.init_schema()?;

        info!("History store opened: {}", path.display());
        Ok(store)
    }

    /// Open with custom limits
    pub fn open_with_config(path: &Path, max_messages: usize, ttl_seconds: i64) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.max_messages = max_messages;
        store.ttl_seconds = ttl_seconds;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                media_kind TEXT,
                timestamp INTEGER NOT NULL DEFAULT (unixepoch())
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_chat_time
                ON conversations(chat_id, timestamp DESC);

            CREATE TABLE IF NOT EXISTS last_commands (
                chat_id INTEGER PRIMARY KEY,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tool_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                tool TEXT NOT NULL,
                media_kind TEXT,
                asset_url TEXT,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tool_calls_chat_time
                ON tool_calls(chat_id, timestamp DESC);

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                command TEXT NOT NULL,
                schedule TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                fact TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_chat
                ON memories(chat_id, timestamp DESC);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conversation history
    // ------------------------------------------------------------------

    /// Add a message to a conversation
    pub fn add_message(
        &self,
        chat_id: i64,
        role: &str,
        content: &str,
        media_kind: Option<&str>,
    ) -> Result<()> {
        // Milliseconds for uniqueness within one exchange
        let timestamp = chrono::Utc::now().timestamp_millis();

        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO conversations (chat_id, role, content, media_kind, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chat_id, role, content, media_kind, timestamp],
            )?;
        }
        self.trim_conversation(chat_id, self.max_messages)?;

        debug!("Added {} message to chat {}", role, chat_id);
        Ok(())
    }

    /// Get conversation history for a chat, chronological
    pub fn get_history(&self, chat_id: i64, limit: usize) -> Result<Vec<HistoryMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT role, content, media_kind, timestamp FROM conversations
             WHERE chat_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;

        let mut messages: Vec<HistoryMessage> = stmt
            .query_map(params![chat_id, limit], |row| {
                Ok(HistoryMessage {
                    role: row.get(0)?,
                    content: row.get(1)?,
                    media_kind: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        messages.reverse();
        Ok(messages)
    }

    /// Format recent history for prompt injection
    pub fn history_as_context(&self, chat_id: i64, limit: usize) -> Result<String> {
        let messages = self.get_history(chat_id, limit)?;
        if messages.is_empty() {
            return Ok(String::new());
        }

        let mut context = String::from("[Previous conversation:]\n");
        for msg in messages {
            let role_label = if msg.role == "user" { "User" } else { "Assistant" };
            let content = truncate_utf8(&msg.content, 500);
            context.push_str(&format!("{}: {}\n", role_label, content));
        }
        Ok(context)
    }

    /// Clear conversation history for a chat
    pub fn clear(&self, chat_id: i64) -> Result<usize> {
        let rows = self.conn.lock().execute(
            "DELETE FROM conversations WHERE chat_id = ?1",
            params![chat_id],
        )?;
        info!("Cleared {} messages from chat {}", rows, chat_id);
        Ok(rows)
    }

    /// Trim a conversation to its most recent messages
    pub fn trim_conversation(&self, chat_id: i64, keep_count: usize) -> Result<usize> {
        let rows = self.conn.lock().execute(
            "DELETE FROM conversations
             WHERE chat_id = ?1 AND id NOT IN (
                 SELECT id FROM conversations
                 WHERE chat_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2
             )",
            params![chat_id, keep_count],
        )?;
        Ok(rows)
    }

    /// Delete conversation messages older than the TTL
    pub fn cleanup_expired(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - (self.ttl_seconds * 1000);
        let rows = self.conn.lock().execute(
            "DELETE FROM conversations WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if rows > 0 {
            info!("Cleaned up {} expired history messages", rows);
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Last command (for "retry")
    // ------------------------------------------------------------------

    pub fn set_last_command(&self, chat_id: i64, content: &str) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.conn.lock().execute(
            "INSERT INTO last_commands (chat_id, content, timestamp)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET content = ?2, timestamp = ?3",
            params![chat_id, content, timestamp],
        )?;
        Ok(())
    }

    pub fn last_command(&self, chat_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let content = conn
            .query_row(
                "SELECT content FROM last_commands WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    // ------------------------------------------------------------------
    // Short-term agent context
    // ------------------------------------------------------------------

    /// Record one tool invocation (and any generated asset URL)
    pub fn record_tool_call(
        &self,
        chat_id: i64,
        tool: &str,
        media_kind: Option<&str>,
        asset_url: Option<&str>,
    ) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO tool_calls (chat_id, tool, media_kind, asset_url, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chat_id, tool, media_kind, asset_url, timestamp],
            )?;
            conn.execute(
                "DELETE FROM tool_calls
                 WHERE chat_id = ?1 AND id NOT IN (
                     SELECT id FROM tool_calls
                     WHERE chat_id = ?1
                     ORDER BY timestamp DESC
                     LIMIT ?2
                 )",
                params![chat_id, MAX_TOOL_CALLS_PER_CHAT as i64],
            )?;
        }
        Ok(())
    }

    /// Recent tool calls for a chat, newest first
    pub fn recent_tool_calls(&self, chat_id: i64, limit: usize) -> Result<Vec<ToolCallRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tool, media_kind, asset_url, timestamp FROM tool_calls
             WHERE chat_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;

        let calls = stmt
            .query_map(params![chat_id, limit], |row| {
                Ok(ToolCallRecord {
                    tool: row.get(0)?,
                    media_kind: row.get(1)?,
                    asset_url: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(calls)
    }

    /// Most recent generated asset URL of a media kind, for chaining
    /// (e.g. animating the image produced a step or a message earlier)
    pub fn latest_asset(&self, chat_id: i64, media_kind: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let url = conn
            .query_row(
                "SELECT asset_url FROM tool_calls
                 WHERE chat_id = ?1 AND media_kind = ?2 AND asset_url IS NOT NULL
                 ORDER BY timestamp DESC
                 LIMIT 1",
                params![chat_id, media_kind],
                |row| row.get(0),
            )
            .optional()?;
        Ok(url)
    }

    // ------------------------------------------------------------------
    // Scheduled tasks
    // ------------------------------------------------------------------

    pub fn add_task(&self, chat_id: i64, command: &str, schedule: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (chat_id, command, schedule, active) VALUES (?1, ?2, ?3, 1)",
            params![chat_id, command, schedule],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Deactivate a task; returns false when no active task matched
    pub fn cancel_task(&self, chat_id: i64, task_id: i64) -> Result<bool> {
        let rows = self.conn.lock().execute(
            "UPDATE tasks SET active = 0 WHERE chat_id = ?1 AND id = ?2 AND active = 1",
            params![chat_id, task_id],
        )?;
        Ok(rows > 0)
    }

    // ------------------------------------------------------------------
    // Per-chat memory facts
    // ------------------------------------------------------------------

    pub fn remember(&self, chat_id: i64, fact: &str) -> Result<i64> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memories (chat_id, fact, timestamp) VALUES (?1, ?2, ?3)",
            params![chat_id, fact, timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Facts matching `query` (substring, case-insensitive); empty query
    /// returns the most recent facts
    pub fn recall(&self, chat_id: i64, query: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let pattern = format!("%{}%", query.trim());
        let mut stmt = conn.prepare(
            "SELECT fact FROM memories
             WHERE chat_id = ?1 AND fact LIKE ?2
             ORDER BY timestamp DESC
             LIMIT ?3",
        )?;

        let facts = stmt
            .query_map(params![chat_id, pattern, limit], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(facts)
    }

    pub fn list_tasks(&self, chat_id: i64) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, command, schedule, active FROM tasks
             WHERE chat_id = ?1 AND active = 1
             ORDER BY id",
        )?;

        let tasks = stmt
            .query_map(params![chat_id], |row| {
                Ok(TaskRecord {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    command: row.get(2)?,
                    schedule: row.get(3)?,
                    active: row.get::<_, i64>(4)? != 0,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }
}

/// Truncate at a UTF-8 boundary near `max` bytes
fn truncate_utf8(content: &str, max: usize) -> String {
    if content.len() <= max {
        return content.to_string();
    }
    let truncate_at = content
        .char_indices()
        .take_while(|(i, _)| *i < max)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}...", &content[..truncate_at])
}
