//! SQLite database opening and schema management.
//!
//! merel keeps one self-contained database file per account plus one for
//! the delivery queue, so "open" always means a file path and a schema to
//! apply.

use std::path::Path;

use merel_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tracing::debug;

/// Schema for a per-account index database.
pub const ACCOUNT_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS settings (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS mailboxes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        uid_validity INTEGER NOT NULL,
        uid_next INTEGER NOT NULL,
        special_use TEXT,
        keywords TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mailbox_id INTEGER NOT NULL,
        mailbox_destined_id INTEGER,
        mailbox_orig_id INTEGER NOT NULL,
        uid INTEGER NOT NULL,
        received_at TEXT NOT NULL,
        size INTEGER NOT NULL,
        msg_prefix BLOB NOT NULL,
        remote_ip TEXT NOT NULL DEFAULT '',
        remote_ip_masked1 TEXT NOT NULL DEFAULT '',
        remote_ip_masked2 TEXT NOT NULL DEFAULT '',
        remote_ip_masked3 TEXT NOT NULL DEFAULT '',
        mail_from_localpart TEXT NOT NULL DEFAULT '',
        mail_from_domain TEXT NOT NULL DEFAULT '',
        mail_from_validated INTEGER NOT NULL DEFAULT 0,
        mail_from_validation TEXT NOT NULL DEFAULT 'none',
        rcpt_to_localpart TEXT NOT NULL DEFAULT '',
        rcpt_to_domain TEXT NOT NULL DEFAULT '',
        msg_from_localpart TEXT NOT NULL DEFAULT '',
        msg_from_domain TEXT NOT NULL DEFAULT '',
        msg_from_org_domain TEXT NOT NULL DEFAULT '',
        msg_from_validated INTEGER NOT NULL DEFAULT 0,
        msg_from_validation TEXT NOT NULL DEFAULT 'none',
        seen INTEGER NOT NULL DEFAULT 0,
        answered INTEGER NOT NULL DEFAULT 0,
        flagged INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        draft INTEGER NOT NULL DEFAULT 0,
        junk INTEGER NOT NULL DEFAULT 0,
        notjunk INTEGER NOT NULL DEFAULT 0,
        forwarded INTEGER NOT NULL DEFAULT 0,
        phishing INTEGER NOT NULL DEFAULT 0,
        mdnsent INTEGER NOT NULL DEFAULT 0,
        keywords TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_mailbox_uid ON messages (mailbox_id, uid)",
    "CREATE INDEX IF NOT EXISTS idx_messages_msg_from ON messages (msg_from_domain, msg_from_localpart)",
    "CREATE INDEX IF NOT EXISTS idx_messages_msg_from_org ON messages (msg_from_org_domain)",
    "CREATE INDEX IF NOT EXISTS idx_messages_mail_from ON messages (mail_from_domain)",
    "CREATE INDEX IF NOT EXISTS idx_messages_remote_ip ON messages (remote_ip_masked1, remote_ip_masked2, remote_ip_masked3)",
    "CREATE TABLE IF NOT EXISTS recipients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id INTEGER NOT NULL,
        localpart TEXT NOT NULL,
        domain TEXT NOT NULL,
        org_domain TEXT NOT NULL,
        sent_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_recipients_addr ON recipients (domain, localpart)",
];

/// Schema for the junk filter word database.
pub const JUNK_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS words (
        word TEXT PRIMARY KEY,
        ham INTEGER NOT NULL DEFAULT 0,
        spam INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS totals (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        ham INTEGER NOT NULL DEFAULT 0,
        spam INTEGER NOT NULL DEFAULT 0
    )",
    "INSERT OR IGNORE INTO totals (id, ham, spam) VALUES (1, 0, 0)",
];

/// Schema for the delivery queue database.
pub const QUEUE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queued_at TEXT NOT NULL,
        sender_localpart TEXT NOT NULL DEFAULT '',
        sender_domain TEXT NOT NULL DEFAULT '',
        recipient_localpart TEXT NOT NULL,
        recipient_domain TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_attempt TEXT NOT NULL,
        last_attempt TEXT,
        last_error TEXT,
        transport TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL,
        is_dsn INTEGER NOT NULL DEFAULT 0,
        leased INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_queue_next_attempt ON queue (leased, next_attempt)",
];

/// Open (creating if missing) a SQLite database and apply a schema.
pub async fn open_database(path: &Path, schema: &[&str]) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Storage(format!("creating {}: {}", parent.display(), e)))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| Error::Database(format!("opening {}: {}", path.display(), e)))?;

    for statement in schema {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .map_err(|e| Error::Database(format!("applying schema: {}", e)))?;
    }

    debug!(path = %path.display(), "opened database");
    Ok(pool)
}

/// Convert a sqlx error into the library error.
pub fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}
