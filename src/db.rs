// SQLite persistence layer for local processing state.
//
// Airtable is the system of record for contacts and messages; this database
// only tracks what the service itself needs between cycles: which source
// messages were already processed, per-source polling cursors, a local audit
// trail, and learned writing rules.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::SourceChannel;

/// Polling cursor state for one source (or one LinkedIn account).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceState {
    pub cursor: Option<String>,
    pub gmail_history_id: Option<String>,
    pub last_poll_at: Option<String>,
}

/// One active learned writing rule.
#[derive(Debug, Clone)]
pub struct LearnedRule {
    pub id: i64,
    pub rule_text: String,
    pub confidence: f64,
}

/// SQLite-backed persistence for processed-message idempotency, source
/// cursors, local audit, and the learning log.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS processed_messages (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                source              TEXT NOT NULL,
                source_message_id   TEXT NOT NULL,
                status              TEXT NOT NULL DEFAULT 'processed',
                attempts            INTEGER NOT NULL DEFAULT 1,
                last_error          TEXT,
                airtable_message_id TEXT,
                airtable_contact_id TEXT,
                processed_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(source, source_message_id)
            );

            CREATE TABLE IF NOT EXISTS source_state (
                source_key       TEXT PRIMARY KEY,
                cursor           TEXT,
                gmail_history_id TEXT,
                last_poll_at     TEXT
            );

            CREATE TABLE IF NOT EXISTS local_audit (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id    TEXT,
                action      TEXT NOT NULL,
                message_id  TEXT,
                contact_id  TEXT,
                duration_ms INTEGER,
                details     TEXT,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS learning_log (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_text      TEXT NOT NULL,
                confidence     REAL NOT NULL,
                active         INTEGER NOT NULL DEFAULT 1,
                created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                deactivated_at TEXT
            );
            ",
        )
        .context("failed to create database schema")?;

        // Migration: early databases tracked processed ids only; these columns
        // arrived with failure handling and CRM backlinks.
        conn.execute_batch("ALTER TABLE processed_messages ADD COLUMN attempts INTEGER NOT NULL DEFAULT 1;")
            .ok(); // Silently ignore if column already exists
        conn.execute_batch("ALTER TABLE processed_messages ADD COLUMN last_error TEXT;")
            .ok();
        conn.execute_batch("ALTER TABLE local_audit ADD COLUMN duration_ms INTEGER;")
            .ok();

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_local_audit_action ON local_audit(action);",
        )
        .context("failed to create audit index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Processed messages (idempotency)
    // ------------------------------------------------------------------

    /// Returns `true` if the given source message was already processed
    /// successfully. Failed messages are not "processed" and will be retried.
    pub fn is_message_processed(
        &self,
        source: SourceChannel,
        source_message_id: &str,
    ) -> Result<bool> {
        let conn = self.conn();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM processed_messages
                    WHERE source = ?1 AND source_message_id = ?2 AND status = 'processed'
                 )",
                params![source.as_str(), source_message_id],
                |row| row.get(0),
            )
            .context("failed to check processed_messages")?;
        Ok(exists)
    }

    /// Mark a source message as successfully processed, recording the CRM
    /// record ids it produced. Upserts: a message that previously failed
    /// flips to processed, and COALESCE keeps earlier non-null CRM ids when
    /// a later call omits them.
    pub fn mark_message_processed(
        &self,
        source: SourceChannel,
        source_message_id: &str,
        airtable_message_id: Option<&str>,
        airtable_contact_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO processed_messages
                (source, source_message_id, status, attempts, last_error,
                 airtable_message_id, airtable_contact_id)
             VALUES (?1, ?2, 'processed', 1, NULL, ?3, ?4)
             ON CONFLICT(source, source_message_id) DO UPDATE SET
                status              = 'processed',
                last_error          = NULL,
                airtable_message_id = COALESCE(excluded.airtable_message_id, airtable_message_id),
                airtable_contact_id = COALESCE(excluded.airtable_contact_id, airtable_contact_id),
                processed_at        = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![
                source.as_str(),
                source_message_id,
                airtable_message_id,
                airtable_contact_id,
            ],
        )
        .context("failed to mark message processed")?;
        Ok(())
    }

    /// Record a processing failure. Increments the attempt counter so
    /// persistent failures are visible, and stores the latest error.
    pub fn mark_message_failed(
        &self,
        source: SourceChannel,
        source_message_id: &str,
        error: &str,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO processed_messages
                (source, source_message_id, status, attempts, last_error)
             VALUES (?1, ?2, 'failed', 1, ?3)
             ON CONFLICT(source, source_message_id) DO UPDATE SET
                status     = 'failed',
                attempts   = attempts + 1,
                last_error = excluded.last_error",
            params![source.as_str(), source_message_id, error],
        )
        .context("failed to mark message failed")?;
        Ok(())
    }

    /// Number of attempts recorded for a source message, 0 if never seen.
    pub fn message_attempts(
        &self,
        source: SourceChannel,
        source_message_id: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        let attempts: Option<i64> = conn
            .query_row(
                "SELECT attempts FROM processed_messages
                 WHERE source = ?1 AND source_message_id = ?2",
                params![source.as_str(), source_message_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read message attempts")?;
        Ok(attempts.unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Source state (polling cursors)
    // ------------------------------------------------------------------

    /// Load the polling state for a source key (e.g. `"gmail"` or
    /// `"linkedin_{account_id}"`). Returns `None` if never saved.
    pub fn get_source_state(&self, source_key: &str) -> Result<Option<SourceState>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT cursor, gmail_history_id, last_poll_at
             FROM source_state WHERE source_key = ?1",
            params![source_key],
            |row| {
                Ok(SourceState {
                    cursor: row.get(0)?,
                    gmail_history_id: row.get(1)?,
                    last_poll_at: row.get(2)?,
                })
            },
        )
        .optional()
        .context("failed to load source state")
    }

    /// Upsert the polling state for a source key and stamp `last_poll_at`.
    pub fn save_source_state(
        &self,
        source_key: &str,
        cursor: Option<&str>,
        gmail_history_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO source_state (source_key, cursor, gmail_history_id, last_poll_at)
             VALUES (?1, ?2, ?3, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
             ON CONFLICT(source_key) DO UPDATE SET
                cursor           = excluded.cursor,
                gmail_history_id = excluded.gmail_history_id,
                last_poll_at     = excluded.last_poll_at",
            params![source_key, cursor, gmail_history_id],
        )
        .context("failed to save source state")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local audit
    // ------------------------------------------------------------------

    /// Append a row to the local audit trail. `details` is serialized JSON.
    pub fn log_local_audit(
        &self,
        trace_id: Option<&str>,
        action: &str,
        message_id: Option<&str>,
        contact_id: Option<&str>,
        duration_ms: Option<i64>,
        details: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn();
        let details_json = match details {
            Some(value) => {
                Some(serde_json::to_string(value).context("failed to serialize audit details")?)
            }
            None => None,
        };
        conn.execute(
            "INSERT INTO local_audit (trace_id, action, message_id, contact_id, duration_ms, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![trace_id, action, message_id, contact_id, duration_ms, details_json],
        )
        .context("failed to log local audit")?;
        Ok(())
    }

    /// Count local audit rows for an action. Used by cycle stats and tests.
    pub fn count_audit_rows(&self, action: &str) -> Result<i64> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM local_audit WHERE action = ?1",
                params![action],
                |row| row.get(0),
            )
            .context("failed to count audit rows")?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Learning log
    // ------------------------------------------------------------------

    /// Store a newly learned rule as active. Returns its row id.
    pub fn insert_learned_rule(&self, rule_text: &str, confidence: f64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO learning_log (rule_text, confidence) VALUES (?1, ?2)",
            params![rule_text, confidence],
        )
        .context("failed to insert learned rule")?;
        Ok(conn.last_insert_rowid())
    }

    /// All active rules, oldest first. The ordering matters: when the active
    /// set exceeds the cap, the learner deactivates from the front.
    pub fn get_active_learned_rules(&self) -> Result<Vec<LearnedRule>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, rule_text, confidence FROM learning_log
                 WHERE active = 1 ORDER BY id",
            )
            .context("failed to prepare learned rules query")?;

        let rules = stmt
            .query_map([], |row| {
                Ok(LearnedRule {
                    id: row.get(0)?,
                    rule_text: row.get(1)?,
                    confidence: row.get(2)?,
                })
            })
            .context("failed to query learned rules")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map learned rule rows")?;

        Ok(rules)
    }

    /// Deactivate a rule (kept in the log for history, excluded from prompts).
    pub fn deactivate_learned_rule(&self, rule_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE learning_log
             SET active = 0, deactivated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE id = ?1",
            params![rule_id],
        )
        .context("failed to deactivate learned rule")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Helper: create a fresh in-memory database for each test.
    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    // ------------------------------------------------------------------
    // Schema / open
    // ------------------------------------------------------------------

    #[test]
    fn open_creates_tables() {
        let db = test_db();
        let conn = db.conn();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"processed_messages".to_string()));
        assert!(tables.contains(&"source_state".to_string()));
        assert!(tables.contains(&"local_audit".to_string()));
        assert!(tables.contains(&"learning_log".to_string()));
    }

    // ------------------------------------------------------------------
    // Processed messages
    // ------------------------------------------------------------------

    #[test]
    fn unseen_message_is_not_processed() {
        let db = test_db();
        assert!(!db
            .is_message_processed(SourceChannel::Gmail, "m1")
            .unwrap());
    }

    #[test]
    fn mark_processed_then_check() {
        let db = test_db();
        db.mark_message_processed(SourceChannel::Gmail, "m1", Some("recMsg1"), Some("recC1"))
            .unwrap();

        assert!(db.is_message_processed(SourceChannel::Gmail, "m1").unwrap());
        // Same id on a different source is a different message
        assert!(!db
            .is_message_processed(SourceChannel::LinkedIn, "m1")
            .unwrap());
    }

    #[test]
    fn mark_processed_is_idempotent() {
        let db = test_db();
        db.mark_message_processed(SourceChannel::Gmail, "m1", Some("recMsg1"), None)
            .unwrap();
        db.mark_message_processed(SourceChannel::Gmail, "m1", None, Some("recC1"))
            .unwrap();

        let conn = db.conn();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM processed_messages", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);

        // COALESCE keeps the message id from the first call and picks up the
        // contact id from the second.
        let (msg_id, contact_id): (Option<String>, Option<String>) = conn
            .query_row(
                "SELECT airtable_message_id, airtable_contact_id FROM processed_messages
                 WHERE source = 'Gmail' AND source_message_id = 'm1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(msg_id.as_deref(), Some("recMsg1"));
        assert_eq!(contact_id.as_deref(), Some("recC1"));
    }

    #[test]
    fn failed_message_is_retried_and_attempts_accumulate() {
        let db = test_db();
        db.mark_message_failed(SourceChannel::LinkedIn, "m2", "classifier timed out")
            .unwrap();

        // Failed messages are not considered processed
        assert!(!db
            .is_message_processed(SourceChannel::LinkedIn, "m2")
            .unwrap());
        assert_eq!(db.message_attempts(SourceChannel::LinkedIn, "m2").unwrap(), 1);

        db.mark_message_failed(SourceChannel::LinkedIn, "m2", "still down")
            .unwrap();
        assert_eq!(db.message_attempts(SourceChannel::LinkedIn, "m2").unwrap(), 2);

        // A later success flips the row to processed and clears the error
        db.mark_message_processed(SourceChannel::LinkedIn, "m2", Some("recMsg2"), None)
            .unwrap();
        assert!(db
            .is_message_processed(SourceChannel::LinkedIn, "m2")
            .unwrap());

        let conn = db.conn();
        let err: Option<String> = conn
            .query_row(
                "SELECT last_error FROM processed_messages
                 WHERE source = 'LinkedIn' AND source_message_id = 'm2'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(err.is_none());
    }

    #[test]
    fn message_attempts_zero_for_unknown() {
        let db = test_db();
        assert_eq!(db.message_attempts(SourceChannel::Gmail, "nope").unwrap(), 0);
    }

    // ------------------------------------------------------------------
    // Source state
    // ------------------------------------------------------------------

    #[test]
    fn source_state_round_trip() {
        let db = test_db();
        assert!(db.get_source_state("gmail").unwrap().is_none());

        db.save_source_state("gmail", None, Some("hist_100"))
            .unwrap();
        let state = db.get_source_state("gmail").unwrap().unwrap();
        assert_eq!(state.gmail_history_id.as_deref(), Some("hist_100"));
        assert!(state.cursor.is_none());
        assert!(state.last_poll_at.is_some());
    }

    #[test]
    fn source_state_overwrites_on_save() {
        let db = test_db();
        db.save_source_state("linkedin_acc1", Some("cursor_a"), None)
            .unwrap();
        db.save_source_state("linkedin_acc1", Some("cursor_b"), None)
            .unwrap();

        let state = db.get_source_state("linkedin_acc1").unwrap().unwrap();
        assert_eq!(state.cursor.as_deref(), Some("cursor_b"));
    }

    #[test]
    fn source_state_keys_are_independent() {
        let db = test_db();
        db.save_source_state("linkedin_acc1", Some("a"), None).unwrap();
        db.save_source_state("linkedin_acc2", Some("b"), None).unwrap();

        assert_eq!(
            db.get_source_state("linkedin_acc1").unwrap().unwrap().cursor.as_deref(),
            Some("a")
        );
        assert_eq!(
            db.get_source_state("linkedin_acc2").unwrap().unwrap().cursor.as_deref(),
            Some("b")
        );
    }

    // ------------------------------------------------------------------
    // Local audit
    // ------------------------------------------------------------------

    #[test]
    fn local_audit_rows_accumulate() {
        let db = test_db();
        db.log_local_audit(
            Some("msg_ab12cd34"),
            "message_received",
            Some("recMsg1"),
            Some("recC1"),
            Some(412),
            Some(&json!({"source": "Gmail"})),
        )
        .unwrap();
        db.log_local_audit(None, "learning_cycle", None, None, None, None)
            .unwrap();

        assert_eq!(db.count_audit_rows("message_received").unwrap(), 1);
        assert_eq!(db.count_audit_rows("learning_cycle").unwrap(), 1);
        assert_eq!(db.count_audit_rows("sent").unwrap(), 0);

        let conn = db.conn();
        let (trace, details): (Option<String>, Option<String>) = conn
            .query_row(
                "SELECT trace_id, details FROM local_audit WHERE action = 'message_received'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(trace.as_deref(), Some("msg_ab12cd34"));
        assert!(details.unwrap().contains("Gmail"));
    }

    // ------------------------------------------------------------------
    // Learning log
    // ------------------------------------------------------------------

    #[test]
    fn learned_rules_round_trip_oldest_first() {
        let db = test_db();
        let id1 = db.insert_learned_rule("Keep LinkedIn replies under 40 words", 0.9).unwrap();
        let id2 = db.insert_learned_rule("Never open with 'I hope this finds you well'", 0.8).unwrap();
        assert!(id2 > id1);

        let rules = db.get_active_learned_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, id1);
        assert_eq!(rules[0].rule_text, "Keep LinkedIn replies under 40 words");
        assert!((rules[1].confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn deactivated_rules_are_excluded() {
        let db = test_db();
        let id1 = db.insert_learned_rule("rule one", 0.9).unwrap();
        db.insert_learned_rule("rule two", 0.85).unwrap();

        db.deactivate_learned_rule(id1).unwrap();

        let rules = db.get_active_learned_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_text, "rule two");

        // Deactivation is recorded, not deleted
        let conn = db.conn();
        let (active, deactivated_at): (i64, Option<String>) = conn
            .query_row(
                "SELECT active, deactivated_at FROM learning_log WHERE id = ?1",
                params![id1],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(active, 0);
        assert!(deactivated_at.is_some());
    }

    // ------------------------------------------------------------------
    // Migration: additive columns on a pre-existing table
    // ------------------------------------------------------------------

    #[test]
    fn migration_adds_columns_to_legacy_table() {
        let tmp_dir = std::env::temp_dir();
        let db_path = tmp_dir.join(format!("sdr_test_migration_{}.db", std::process::id()));
        let db_path_str = db_path.to_str().unwrap();
        let _ = std::fs::remove_file(&db_path);

        // Create a legacy database without attempts/last_error/duration_ms.
        {
            let conn = Connection::open(db_path_str).unwrap();
            conn.execute_batch(
                "CREATE TABLE processed_messages (
                    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                    source              TEXT NOT NULL,
                    source_message_id   TEXT NOT NULL,
                    status              TEXT NOT NULL DEFAULT 'processed',
                    airtable_message_id TEXT,
                    airtable_contact_id TEXT,
                    processed_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    UNIQUE(source, source_message_id)
                );
                CREATE TABLE local_audit (
                    id         INTEGER PRIMARY KEY AUTOINCREMENT,
                    trace_id   TEXT,
                    action     TEXT NOT NULL,
                    message_id TEXT,
                    contact_id TEXT,
                    details    TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO processed_messages (source, source_message_id)
                 VALUES ('Gmail', 'legacy_1')",
                [],
            )
            .unwrap();
        }

        let db = Database::open(db_path_str).expect("migration should succeed");

        // Legacy row survives and reads with a defaulted attempt count
        assert!(db.is_message_processed(SourceChannel::Gmail, "legacy_1").unwrap());
        assert_eq!(db.message_attempts(SourceChannel::Gmail, "legacy_1").unwrap(), 1);

        // New-style writes work against the migrated table
        db.mark_message_failed(SourceChannel::Gmail, "new_1", "boom").unwrap();
        assert_eq!(db.message_attempts(SourceChannel::Gmail, "new_1").unwrap(), 1);
        db.log_local_audit(None, "sent", None, None, Some(10), None).unwrap();

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(format!("{db_path_str}-wal"));
        let _ = std::fs::remove_file(format!("{db_path_str}-shm"));
    }
}
