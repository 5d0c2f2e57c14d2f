//! Outbound delivery queue.
//!
//! A persistent table of queued messages plus a sharded blob store,
//! mirroring the account store's layout. Rows carry scheduling state
//! (next_attempt, attempts, lease) and administrative operations work on
//! filters: kick to retry now, drop to delete, dump to read the blob.

pub mod manager;
pub mod transport;

pub use manager::Scheduler;
pub use transport::{DeliveryAgent, DeliveryResult, SmtpAgent};

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use merel_common::clock::Clock;
use merel_common::types::EmailAddress;
use merel_common::{Error, Result};
use merel_storage::db::{self, QUEUE_SCHEMA};
use merel_storage::file::ShardedFiles;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};

/// A queued outbound message.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: i64,
    pub queued_at: DateTime<Utc>,
    /// Empty for DSNs (null reverse-path).
    pub sender_localpart: String,
    pub sender_domain: String,
    pub recipient_localpart: String,
    pub recipient_domain: String,
    pub attempts: i64,
    pub next_attempt: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Delivery transport name; empty means direct MX delivery.
    pub transport: String,
    pub size: i64,
    pub is_dsn: bool,
    pub leased: bool,
}

impl QueueMessage {
    pub fn sender(&self) -> Option<EmailAddress> {
        if self.sender_localpart.is_empty() {
            None
        } else {
            Some(EmailAddress::new(
                self.sender_localpart.clone(),
                self.sender_domain.clone(),
            ))
        }
    }

    pub fn recipient(&self) -> EmailAddress {
        EmailAddress::new(
            self.recipient_localpart.clone(),
            self.recipient_domain.clone(),
        )
    }
}

/// Filters for the administrative kick/drop operations. Unset fields do
/// not restrict.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub id: Option<i64>,
    pub todomain: Option<String>,
    pub recipient: Option<String>,
}

impl QueueFilter {
    fn clause(&self) -> String {
        let mut clause = String::from("1 = 1");
        if self.id.is_some() {
            clause.push_str(" AND id = ?");
        }
        if self.todomain.is_some() {
            clause.push_str(" AND recipient_domain = ?");
        }
        if self.recipient.is_some() {
            clause.push_str(" AND recipient_localpart || '@' || recipient_domain = ?");
        }
        clause
    }
}

pub struct Queue {
    pool: SqlitePool,
    files: ShardedFiles,
    clock: Arc<dyn Clock>,
}

impl Queue {
    /// Open the queue directory. Leases held by a previous process are
    /// released: a crash mid-attempt must not orphan entries.
    pub async fn open(dir: &Path, clock: Arc<dyn Clock>) -> Result<Queue> {
        let pool = db::open_database(&dir.join("index.db"), QUEUE_SCHEMA).await?;
        let released = sqlx::query("UPDATE queue SET leased = 0 WHERE leased = 1")
            .execute(&pool)
            .await
            .map_err(db::db_err)?
            .rows_affected();
        if released > 0 {
            info!(released, "released stale queue leases");
        }
        Ok(Queue {
            pool,
            files: ShardedFiles::new(dir),
            clock,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.pool
    }

    /// Queue a message for delivery. The blob and the row are both synced
    /// to disk before this returns.
    pub async fn add(
        &self,
        sender: Option<&EmailAddress>,
        recipient: &EmailAddress,
        transport: &str,
        is_dsn: bool,
        data: &[u8],
    ) -> Result<i64> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db::db_err)?;
        let res = sqlx::query(
            "INSERT INTO queue (
                queued_at, sender_localpart, sender_domain,
                recipient_localpart, recipient_domain,
                attempts, next_attempt, transport, size, is_dsn, leased
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, 0)",
        )
        .bind(now)
        .bind(sender.map(|s| s.localpart.to_lowercase()).unwrap_or_default())
        .bind(sender.map(|s| s.domain.clone()).unwrap_or_default())
        .bind(recipient.localpart.to_lowercase())
        .bind(&recipient.domain)
        .bind(now)
        .bind(transport)
        .bind(data.len() as i64)
        .bind(is_dsn)
        .execute(&mut *tx)
        .await
        .map_err(db::db_err)?;
        let id = res.last_insert_rowid();

        self.files.store_bytes(id, data, true).await?;
        if let Err(e) = tx.commit().await {
            if let Err(re) = self.files.remove(id).await {
                warn!(id, error = %re, "removing blob after failed queue commit");
            }
            return Err(db::db_err(e));
        }

        info!(id, recipient = %recipient, is_dsn, "queued message");
        Ok(id)
    }

    /// Snapshot of the queue for administrators.
    pub async fn list(&self) -> Result<Vec<QueueMessage>> {
        sqlx::query_as::<_, QueueMessage>("SELECT * FROM queue ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db::db_err)
    }

    pub async fn get(&self, id: i64) -> Result<QueueMessage> {
        sqlx::query_as::<_, QueueMessage>("SELECT * FROM queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db::db_err)?
            .ok_or_else(|| Error::NotFound(format!("queue message {}", id)))
    }

    /// Schedule matching entries for immediate delivery. A non-empty
    /// `transport` replaces the entries' transport. Returns how many rows
    /// matched. Idempotent: kicking twice equals kicking once.
    pub async fn kick(&self, filter: &QueueFilter, transport: Option<&str>) -> Result<u64> {
        let now = self.clock.now();
        let set_transport = transport.filter(|t| !t.is_empty());
        let sql = if set_transport.is_some() {
            format!(
                "UPDATE queue SET next_attempt = ?, transport = ? WHERE {}",
                filter.clause()
            )
        } else {
            format!("UPDATE queue SET next_attempt = ? WHERE {}", filter.clause())
        };

        let mut query = sqlx::query(&sql).bind(now);
        if let Some(t) = set_transport {
            query = query.bind(t);
        }
        query = bind_filter(query, filter);

        let count = query
            .execute(&self.pool)
            .await
            .map_err(db::db_err)?
            .rows_affected();
        info!(count, "kicked queue messages");
        Ok(count)
    }

    /// Delete matching entries and their blobs. Returns how many were
    /// removed.
    pub async fn drop_messages(&self, filter: &QueueFilter) -> Result<u64> {
        let sql = format!("SELECT id FROM queue WHERE {}", filter.clause());
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        query = bind_filter_as(query, filter);
        let ids: Vec<(i64,)> = query.fetch_all(&self.pool).await.map_err(db::db_err)?;

        let sql = format!("DELETE FROM queue WHERE {}", filter.clause());
        let mut query = sqlx::query(&sql);
        query = bind_filter(query, filter);
        let count = query
            .execute(&self.pool)
            .await
            .map_err(db::db_err)?
            .rows_affected();

        for (id,) in ids {
            if let Err(e) = self.files.remove(id).await {
                warn!(id, error = %e, "removing queue blob");
            }
        }
        info!(count, "dropped queue messages");
        Ok(count)
    }

    /// The raw message blob of a queue entry.
    pub async fn open_message(&self, id: i64) -> Result<Vec<u8>> {
        // Only hand out blobs that still have a row.
        let _ = self.get(id).await?;
        self.files.read(id).await
    }

    /// Remove one delivered entry.
    pub(crate) async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db::db_err)?;
        self.files.remove(id).await?;
        debug!(id, "removed queue message");
        Ok(())
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;
type SqliteQueryAs<'q, T> =
    sqlx::query::QueryAs<'q, sqlx::Sqlite, T, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_filter<'q>(mut query: SqliteQuery<'q>, filter: &'q QueueFilter) -> SqliteQuery<'q> {
    if let Some(id) = filter.id {
        query = query.bind(id);
    }
    if let Some(domain) = &filter.todomain {
        query = query.bind(domain.as_str());
    }
    if let Some(recipient) = &filter.recipient {
        query = query.bind(recipient.as_str());
    }
    query
}

fn bind_filter_as<'q, T>(
    mut query: SqliteQueryAs<'q, T>,
    filter: &'q QueueFilter,
) -> SqliteQueryAs<'q, T> {
    if let Some(id) = filter.id {
        query = query.bind(id);
    }
    if let Some(domain) = &filter.todomain {
        query = query.bind(domain.as_str());
    }
    if let Some(recipient) = &filter.recipient {
        query = query.bind(recipient.as_str());
    }
    query
}
