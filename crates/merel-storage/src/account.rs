//! An open account: metadata database, message files, junk filter and the
//! per-account reader/writer lock.
//!
//! Locking discipline: all reads of the metadata database happen under the
//! read guard, all mutations under the write guard. Public mutating
//! operations acquire the write guard themselves; callers must not hold a
//! guard when invoking them. `read()` is public so the analyzer can keep
//! the account stable while it computes reputation.

use std::path::{Path, PathBuf};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use merel_common::config::AccountConfig;
use merel_common::types::{organizational_domain, EmailAddress, MessageFlags};
use merel_common::{Error, Result};
use rand::RngCore;
use sha2::Digest;
use sqlx::SqlitePool;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::db::{self, ACCOUNT_SCHEMA};
use crate::file::{self, ShardedFiles};
use crate::junk::{self, JunkFilter};
use crate::models::{Mailbox, Message, Recipient};

pub struct Account {
    name: String,
    dir: PathBuf,
    pool: SqlitePool,
    lock: RwLock<()>,
    config: AccountConfig,
    files: ShardedFiles,
}

impl Account {
    /// Open an account directory, creating the database on first use.
    pub async fn open(name: &str, dir: &Path, config: AccountConfig) -> Result<Self> {
        let pool = db::open_database(&dir.join("index.db"), ACCOUNT_SCHEMA).await?;
        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            pool,
            lock: RwLock::new(()),
            config,
            files: ShardedFiles::new(dir.join("msg")),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn db(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn message_files(&self) -> &ShardedFiles {
        &self.files
    }

    /// Acquire the account read guard.
    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Acquire the account write guard.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }

    // Settings are single-row key/value pairs in the account database:
    // next_uid_validity, password_hash.

    async fn setting(&self, name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db::db_err)?;
        Ok(row.map(|r| r.0))
    }

    async fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (name, value) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db::db_err)?;
        Ok(())
    }

    /// The next UIDVALIDITY the account will hand out. Every mailbox must
    /// have uid_validity below this value.
    pub async fn next_uid_validity(&self) -> Result<i64> {
        Ok(self
            .setting("next_uid_validity")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(1))
    }

    async fn take_uid_validity(&self) -> Result<i64> {
        let next = self.next_uid_validity().await?;
        self.set_setting("next_uid_validity", &(next + 1).to_string())
            .await?;
        Ok(next)
    }

    /// Find a mailbox by name. Callers hold at least the read guard.
    pub async fn mailbox_find(&self, name: &str) -> Result<Option<Mailbox>> {
        sqlx::query_as::<_, Mailbox>("SELECT * FROM mailboxes WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db::db_err)
    }

    pub async fn mailbox_by_id(&self, id: i64) -> Result<Option<Mailbox>> {
        sqlx::query_as::<_, Mailbox>("SELECT * FROM mailboxes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db::db_err)
    }

    /// Find-or-create without taking the lock; for use inside operations
    /// that already hold the write guard.
    async fn mailbox_ensure(&self, name: &str) -> Result<Mailbox> {
        if let Some(mb) = self.mailbox_find(name).await? {
            return Ok(mb);
        }
        let uid_validity = self.take_uid_validity().await?;
        let res = sqlx::query(
            "INSERT INTO mailboxes (name, uid_validity, uid_next) VALUES (?, ?, 1)",
        )
        .bind(name)
        .bind(uid_validity)
        .execute(&self.pool)
        .await
        .map_err(db::db_err)?;
        info!(account = %self.name, mailbox = name, "created mailbox");
        Ok(Mailbox {
            id: res.last_insert_rowid(),
            name: name.to_string(),
            uid_validity,
            uid_next: 1,
            special_use: None,
            keywords: "[]".to_string(),
        })
    }

    /// Create a mailbox; errors when the name is taken.
    pub async fn mailbox_create(&self, name: &str) -> Result<Mailbox> {
        let _wl = self.write().await;
        if self.mailbox_find(name).await?.is_some() {
            return Err(Error::Validation(format!("mailbox {} already exists", name)));
        }
        self.mailbox_ensure(name).await
    }

    /// Rename a mailbox and its children. The renamed mailboxes get fresh
    /// UIDVALIDITY values so clients resync.
    pub async fn mailbox_rename(&self, from: &str, to: &str) -> Result<()> {
        let _wl = self.write().await;
        let mb = self
            .mailbox_find(from)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailbox {}", from)))?;
        if self.mailbox_find(to).await?.is_some() {
            return Err(Error::Validation(format!("mailbox {} already exists", to)));
        }

        let uid_validity = self.take_uid_validity().await?;
        sqlx::query("UPDATE mailboxes SET name = ?, uid_validity = ? WHERE id = ?")
            .bind(to)
            .bind(uid_validity)
            .bind(mb.id)
            .execute(&self.pool)
            .await
            .map_err(db::db_err)?;

        let children: Vec<Mailbox> = sqlx::query_as("SELECT * FROM mailboxes WHERE name LIKE ?")
            .bind(format!("{}/%", from))
            .fetch_all(&self.pool)
            .await
            .map_err(db::db_err)?;
        for child in children {
            let new_name = format!("{}{}", to, &child.name[from.len()..]);
            let child_validity = self.take_uid_validity().await?;
            sqlx::query("UPDATE mailboxes SET name = ?, uid_validity = ? WHERE id = ?")
                .bind(&new_name)
                .bind(child_validity)
                .bind(child.id)
                .execute(&self.pool)
                .await
                .map_err(db::db_err)?;
        }

        info!(account = %self.name, from, to, "renamed mailbox");
        Ok(())
    }

    /// Destroy a mailbox, its messages and their files.
    pub async fn mailbox_destroy(&self, name: &str) -> Result<()> {
        let _wl = self.write().await;
        let mb = self
            .mailbox_find(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailbox {}", name)))?;

        let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM messages WHERE mailbox_id = ?")
            .bind(mb.id)
            .fetch_all(&self.pool)
            .await
            .map_err(db::db_err)?;

        sqlx::query("DELETE FROM messages WHERE mailbox_id = ?")
            .bind(mb.id)
            .execute(&self.pool)
            .await
            .map_err(db::db_err)?;
        sqlx::query("DELETE FROM mailboxes WHERE id = ?")
            .bind(mb.id)
            .execute(&self.pool)
            .await
            .map_err(db::db_err)?;
        // UIDVALIDITY advances so a recreated mailbox is distinguishable.
        self.take_uid_validity().await?;

        for (id,) in ids {
            if let Err(e) = self.files.remove(id).await {
                warn!(account = %self.name, id, error = %e, "removing message file");
            }
        }
        info!(account = %self.name, mailbox = name, "destroyed mailbox");
        Ok(())
    }

    /// Deliver a message to the mailbox already referenced by
    /// `msg.mailbox_id`, or to Inbox when unset.
    pub async fn deliver(&self, msg: &mut Message, data_file: &Path, sync: bool) -> Result<()> {
        let _wl = self.write().await;
        self.deliver_locked(msg, data_file, sync).await
    }

    /// Deliver to a named mailbox, creating it if needed.
    pub async fn deliver_mailbox(
        &self,
        mailbox: &str,
        msg: &mut Message,
        data_file: &Path,
        sync: bool,
    ) -> Result<()> {
        let _wl = self.write().await;
        let mb = self.mailbox_ensure(mailbox).await?;
        msg.mailbox_id = mb.id;
        self.deliver_locked(msg, data_file, sync).await
    }

    async fn deliver_locked(&self, msg: &mut Message, data_file: &Path, sync: bool) -> Result<()> {
        let mailbox = if msg.mailbox_id != 0 {
            self.mailbox_by_id(msg.mailbox_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("mailbox id {}", msg.mailbox_id)))?
        } else {
            self.mailbox_ensure("Inbox").await?
        };
        msg.mailbox_id = mailbox.id;
        if msg.mailbox_orig_id == 0 {
            msg.mailbox_orig_id = mailbox.id;
        }
        // Not diverted: no need to remember the intended mailbox.
        if msg.mailbox_destined_id == Some(mailbox.id) {
            msg.mailbox_destined_id = None;
        }

        let file_size = tokio::fs::metadata(data_file)
            .await
            .map_err(|e| Error::Storage(format!("stat {}: {}", data_file.display(), e)))?
            .len() as i64;
        msg.size = msg.msg_prefix.len() as i64 + file_size;

        let mut tx = self.pool.begin().await.map_err(db::db_err)?;

        let uid: (i64,) = sqlx::query_as("SELECT uid_next FROM mailboxes WHERE id = ?")
            .bind(mailbox.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db::db_err)?;
        msg.uid = uid.0;
        sqlx::query("UPDATE mailboxes SET uid_next = uid_next + 1 WHERE id = ?")
            .bind(mailbox.id)
            .execute(&mut *tx)
            .await
            .map_err(db::db_err)?;

        let res = sqlx::query(
            "INSERT INTO messages (
                mailbox_id, mailbox_destined_id, mailbox_orig_id, uid, received_at, size,
                msg_prefix, remote_ip, remote_ip_masked1, remote_ip_masked2, remote_ip_masked3,
                mail_from_localpart, mail_from_domain, mail_from_validated, mail_from_validation,
                rcpt_to_localpart, rcpt_to_domain,
                msg_from_localpart, msg_from_domain, msg_from_org_domain,
                msg_from_validated, msg_from_validation,
                seen, answered, flagged, deleted, draft, junk, notjunk, forwarded, phishing, mdnsent,
                keywords
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(msg.mailbox_id)
        .bind(msg.mailbox_destined_id)
        .bind(msg.mailbox_orig_id)
        .bind(msg.uid)
        .bind(msg.received_at)
        .bind(msg.size)
        .bind(&msg.msg_prefix)
        .bind(&msg.remote_ip)
        .bind(&msg.remote_ip_masked1)
        .bind(&msg.remote_ip_masked2)
        .bind(&msg.remote_ip_masked3)
        .bind(&msg.mail_from_localpart)
        .bind(&msg.mail_from_domain)
        .bind(msg.mail_from_validated)
        .bind(&msg.mail_from_validation)
        .bind(&msg.rcpt_to_localpart)
        .bind(&msg.rcpt_to_domain)
        .bind(&msg.msg_from_localpart)
        .bind(&msg.msg_from_domain)
        .bind(&msg.msg_from_org_domain)
        .bind(msg.msg_from_validated)
        .bind(&msg.msg_from_validation)
        .bind(msg.seen)
        .bind(msg.answered)
        .bind(msg.flagged)
        .bind(msg.deleted)
        .bind(msg.draft)
        .bind(msg.junk)
        .bind(msg.notjunk)
        .bind(msg.forwarded)
        .bind(msg.phishing)
        .bind(msg.mdnsent)
        .bind(&msg.keywords)
        .execute(&mut *tx)
        .await
        .map_err(db::db_err)?;
        let id = res.last_insert_rowid();

        // File before commit: a failed link aborts the transaction, a
        // failed commit removes the file again.
        self.files.store_file(id, data_file, sync).await?;

        if let Err(e) = tx.commit().await {
            if let Err(re) = self.files.remove(id).await {
                warn!(account = %self.name, id, error = %re, "removing file after failed commit");
            }
            return Err(db::db_err(e));
        }

        msg.id = id;
        debug!(account = %self.name, id, uid = msg.uid, mailbox = msg.mailbox_id, "delivered message");
        Ok(())
    }

    pub async fn message(&self, id: i64) -> Result<Message> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db::db_err)?
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))
    }

    /// The full message bytes: stored prefix plus the data file.
    pub async fn read_message(&self, msg: &Message) -> Result<Vec<u8>> {
        file::read_message(&self.files, msg.id, &msg.msg_prefix).await
    }

    pub async fn message_count(&self, mailbox: &str) -> Result<i64> {
        let mb = self
            .mailbox_find(mailbox)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailbox {}", mailbox)))?;
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE mailbox_id = ?")
            .bind(mb.id)
            .fetch_one(&self.pool)
            .await
            .map_err(db::db_err)?;
        Ok(count.0)
    }

    /// Update the mutable flags of a delivered message.
    pub async fn update_flags(&self, id: i64, flags: MessageFlags) -> Result<()> {
        let _wl = self.write().await;
        sqlx::query(
            "UPDATE messages SET seen = ?, answered = ?, flagged = ?, deleted = ?, draft = ?,
             junk = ?, notjunk = ?, forwarded = ?, phishing = ?, mdnsent = ? WHERE id = ?",
        )
        .bind(flags.seen)
        .bind(flags.answered)
        .bind(flags.flagged)
        .bind(flags.deleted)
        .bind(flags.draft)
        .bind(flags.junk)
        .bind(flags.notjunk)
        .bind(flags.forwarded)
        .bind(flags.phishing)
        .bind(flags.mdnsent)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db::db_err)?;
        Ok(())
    }

    /// Move a message to another mailbox, assigning a fresh UID there.
    ///
    /// When the message leaves the Rejects mailbox, the mailbox it counts
    /// towards for reputation is restored to the originally intended one.
    /// That recomputation is best-effort: a failure is logged and does not
    /// undo the move.
    pub async fn move_message(&self, id: i64, to_mailbox: &str) -> Result<()> {
        let _wl = self.write().await;
        let msg = self.message(id).await?;
        let source = self
            .mailbox_by_id(msg.mailbox_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailbox id {}", msg.mailbox_id)))?;
        let target = self.mailbox_ensure(to_mailbox).await?;

        let mut tx = self.pool.begin().await.map_err(db::db_err)?;
        let uid: (i64,) = sqlx::query_as("SELECT uid_next FROM mailboxes WHERE id = ?")
            .bind(target.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db::db_err)?;
        sqlx::query("UPDATE mailboxes SET uid_next = uid_next + 1 WHERE id = ?")
            .bind(target.id)
            .execute(&mut *tx)
            .await
            .map_err(db::db_err)?;
        sqlx::query("UPDATE messages SET mailbox_id = ?, uid = ? WHERE id = ?")
            .bind(target.id)
            .bind(uid.0)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db::db_err)?;
        tx.commit().await.map_err(db::db_err)?;

        let from_rejects = self
            .config
            .rejects_mailbox
            .as_deref()
            .is_some_and(|name| name == source.name);
        if from_rejects {
            if let Some(destined) = msg.mailbox_destined_id {
                let res = sqlx::query(
                    "UPDATE messages SET mailbox_orig_id = ?, mailbox_destined_id = NULL WHERE id = ?",
                )
                .bind(destined)
                .bind(id)
                .execute(&self.pool)
                .await;
                if let Err(e) = res {
                    warn!(account = %self.name, id, error = %e, "restoring reputation mailbox after move out of rejects");
                }
            }
        }
        Ok(())
    }

    /// Remove a message and its file.
    pub async fn remove_message(&self, id: i64) -> Result<()> {
        let _wl = self.write().await;
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db::db_err)?;
        self.files.remove(id).await
    }

    /// Record that this account sent a message to an address, for the
    /// reputation short-circuit on replies.
    pub async fn record_recipient(
        &self,
        message_id: i64,
        addr: &EmailAddress,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        let _wl = self.write().await;
        sqlx::query(
            "INSERT INTO recipients (message_id, localpart, domain, org_domain, sent_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(addr.localpart.to_lowercase())
        .bind(&addr.domain)
        .bind(organizational_domain(&addr.domain))
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .map_err(db::db_err)?;
        Ok(())
    }

    pub async fn recipients(&self, addr: &EmailAddress) -> Result<Vec<Recipient>> {
        sqlx::query_as::<_, Recipient>(
            "SELECT * FROM recipients WHERE domain = ? AND localpart = ? ORDER BY sent_at DESC",
        )
        .bind(&addr.domain)
        .bind(addr.localpart.to_lowercase())
        .fetch_all(&self.pool)
        .await
        .map_err(db::db_err)
    }

    /// Key for subjectpass tokens sent to one of our addresses. Derived
    /// from a per-account secret created on first use, so tokens for
    /// different addresses do not validate for each other.
    pub async fn subjectpass_key(&self, address: &str) -> Result<Vec<u8>> {
        let secret = match self.setting("subjectpass_secret").await? {
            Some(s) => s,
            None => {
                let mut buf = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut buf);
                let secret: String = buf.iter().map(|b| format!("{:02x}", b)).collect();
                self.set_setting("subjectpass_secret", &secret).await?;
                secret
            }
        };
        let mut hasher = sha2::Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(address.to_lowercase().as_bytes());
        Ok(hasher.finalize().to_vec())
    }

    /// Set the account password (argon2 hash in the account database).
    pub async fn set_password(&self, password: &str) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("hashing password: {}", e)))?;
        self.set_setting("password_hash", &hash.to_string()).await?;
        info!(account = %self.name, "password updated");
        Ok(())
    }

    pub async fn verify_password(&self, password: &str) -> Result<bool> {
        let Some(stored) = self.setting("password_hash").await? else {
            return Ok(false);
        };
        let hash = PasswordHash::new(&stored)
            .map_err(|e| Error::Internal(format!("parsing stored hash: {}", e)))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok())
    }

    /// Open the junk filter; `Error::NoJunkFilter` when the account has
    /// none configured.
    pub async fn open_junk_filter(&self) -> Result<JunkFilter> {
        let config = self.config.junk_filter.clone().ok_or(Error::NoJunkFilter)?;
        JunkFilter::open(&self.dir, config).await
    }

    /// Feed one message to the junk filter if the user flagged it. Returns
    /// whether the message was used.
    pub async fn train_message(&self, jf: &mut JunkFilter, msg: &Message) -> Result<bool> {
        let spam = match (msg.junk, msg.notjunk) {
            (true, false) => true,
            (false, true) => false,
            _ => return Ok(false),
        };
        let data = self.read_message(msg).await?;
        jf.train(&data, spam).await?;
        Ok(true)
    }

    /// Delete the junk filter files and retrain from all flagged messages.
    /// Returns how many messages were fed.
    pub async fn retrain(&self) -> Result<usize> {
        let _wl = self.write().await;
        let config = self.config.junk_filter.clone().ok_or(Error::NoJunkFilter)?;

        junk::remove_files(&self.dir).await?;
        let mut jf = JunkFilter::open(&self.dir, config).await?;

        let messages: Vec<Message> =
            sqlx::query_as("SELECT * FROM messages WHERE junk = 1 OR notjunk = 1")
                .fetch_all(&self.pool)
                .await
                .map_err(db::db_err)?;

        let mut trained = 0;
        for msg in &messages {
            match self.train_message(&mut jf, msg).await {
                Ok(true) => trained += 1,
                Ok(false) => {}
                Err(e) => warn!(account = %self.name, id = msg.id, error = %e, "training message"),
            }
        }
        jf.close().await?;
        info!(account = %self.name, trained, "retrained junk filter");
        Ok(trained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merel_common::config::JunkFilterConfig;
    use tempfile::TempDir;

    async fn test_account(dir: &TempDir) -> Account {
        let config = AccountConfig {
            domain: "example.com".to_string(),
            rejects_mailbox: Some("Rejects".to_string()),
            junk_filter: Some(JunkFilterConfig::default()),
            ..AccountConfig::default()
        };
        Account::open("mjl", dir.path(), config).await.unwrap()
    }

    async fn spool(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_deliver_assigns_id_uid_and_size() {
        let dir = TempDir::new().unwrap();
        let acc = test_account(&dir).await;
        let data = spool(&dir, "m1.eml", b"Subject: hello\r\n\r\nworld\r\n").await;

        let rcpt = EmailAddress::parse("mjl@example.com").unwrap();
        let mut msg = Message::new_inbound("127.0.0.10".parse().unwrap(), None, &rcpt, Utc::now());
        msg.msg_prefix = b"Received: from test\r\n".to_vec();
        acc.deliver(&mut msg, &data, true).await.unwrap();

        assert!(msg.id > 0);
        assert_eq!(msg.uid, 1);
        assert!(acc.message_files().exists(msg.id).await);

        // size == len(msg_prefix) + filesize(message file)
        let file_size = acc.message_files().size(msg.id).await.unwrap();
        assert_eq!(msg.size as u64, msg.msg_prefix.len() as u64 + file_size);

        let full = acc.read_message(&msg).await.unwrap();
        assert!(full.starts_with(b"Received: from test\r\n"));
        assert!(full.ends_with(b"world\r\n"));
    }

    #[tokio::test]
    async fn test_uid_monotonic_within_mailbox() {
        let dir = TempDir::new().unwrap();
        let acc = test_account(&dir).await;
        let rcpt = EmailAddress::parse("mjl@example.com").unwrap();

        for i in 1..=3i64 {
            let data = spool(&dir, &format!("m{}.eml", i), b"Subject: x\r\n\r\n").await;
            let mut msg =
                Message::new_inbound("127.0.0.1".parse().unwrap(), None, &rcpt, Utc::now());
            acc.deliver(&mut msg, &data, false).await.unwrap();
            assert_eq!(msg.uid, i);
        }

        let mb = acc.mailbox_find("Inbox").await.unwrap().unwrap();
        assert_eq!(mb.uid_next, 4);
        assert!(mb.uid_validity < acc.next_uid_validity().await.unwrap());
    }

    #[tokio::test]
    async fn test_mailbox_rename_bumps_uid_validity() {
        let dir = TempDir::new().unwrap();
        let acc = test_account(&dir).await;

        let mb = acc.mailbox_create("Lists").await.unwrap();
        acc.mailbox_create("Lists/rust").await.unwrap();
        let before = acc.next_uid_validity().await.unwrap();

        acc.mailbox_rename("Lists", "Archive").await.unwrap();
        assert!(acc.mailbox_find("Lists").await.unwrap().is_none());
        let renamed = acc.mailbox_find("Archive").await.unwrap().unwrap();
        assert_eq!(renamed.id, mb.id);
        assert!(renamed.uid_validity >= before);
        assert!(acc.mailbox_find("Archive/rust").await.unwrap().is_some());
        assert!(acc.next_uid_validity().await.unwrap() > before);
    }

    #[tokio::test]
    async fn test_mailbox_destroy_removes_files() {
        let dir = TempDir::new().unwrap();
        let acc = test_account(&dir).await;
        let rcpt = EmailAddress::parse("mjl@example.com").unwrap();
        let data = spool(&dir, "m.eml", b"Subject: x\r\n\r\n").await;
        let mut msg = Message::new_inbound("127.0.0.1".parse().unwrap(), None, &rcpt, Utc::now());
        acc.deliver_mailbox("Trash", &mut msg, &data, false).await.unwrap();
        assert!(acc.message_files().exists(msg.id).await);

        acc.mailbox_destroy("Trash").await.unwrap();
        assert!(acc.mailbox_find("Trash").await.unwrap().is_none());
        assert!(!acc.message_files().exists(msg.id).await);
    }

    #[tokio::test]
    async fn test_move_out_of_rejects_restores_orig_mailbox() {
        let dir = TempDir::new().unwrap();
        let acc = test_account(&dir).await;
        let rcpt = EmailAddress::parse("mjl@example.com").unwrap();

        let inbox = acc.mailbox_create("Inbox").await.unwrap();
        let data = spool(&dir, "m.eml", b"Subject: x\r\n\r\n").await;
        let mut msg = Message::new_inbound("127.0.0.1".parse().unwrap(), None, &rcpt, Utc::now());
        msg.mailbox_destined_id = Some(inbox.id);
        acc.deliver_mailbox("Rejects", &mut msg, &data, false).await.unwrap();

        acc.move_message(msg.id, "Inbox").await.unwrap();
        let moved = acc.message(msg.id).await.unwrap();
        assert_eq!(moved.mailbox_id, inbox.id);
        assert_eq!(moved.mailbox_orig_id, inbox.id);
        assert_eq!(moved.mailbox_destined_id, None);
        assert_eq!(moved.uid, 1);
    }

    #[tokio::test]
    async fn test_password_roundtrip() {
        let dir = TempDir::new().unwrap();
        let acc = test_account(&dir).await;
        assert!(!acc.verify_password("secret").await.unwrap());
        acc.set_password("secret").await.unwrap();
        assert!(acc.verify_password("secret").await.unwrap());
        assert!(!acc.verify_password("wrong").await.unwrap());
    }

    #[tokio::test]
    async fn test_retrain_from_flagged_messages() {
        let dir = TempDir::new().unwrap();
        let acc = test_account(&dir).await;
        let rcpt = EmailAddress::parse("mjl@example.com").unwrap();

        let data = spool(&dir, "spam.eml", b"Subject: pills\r\n\r\ncasino lottery\r\n").await;
        let mut spam = Message::new_inbound("127.0.0.1".parse().unwrap(), None, &rcpt, Utc::now());
        spam.junk = true;
        acc.deliver(&mut spam, &data, false).await.unwrap();

        let data = spool(&dir, "ham.eml", b"Subject: notes\r\n\r\nmeeting agenda\r\n").await;
        let mut ham = Message::new_inbound("127.0.0.1".parse().unwrap(), None, &rcpt, Utc::now());
        ham.notjunk = true;
        acc.deliver(&mut ham, &data, false).await.unwrap();

        let trained = acc.retrain().await.unwrap();
        assert_eq!(trained, 2);

        let jf = acc.open_junk_filter().await.unwrap();
        let c = jf.classify(b"casino lottery pills").await.unwrap();
        assert!(c.probability > 0.5);
        jf.close().await.unwrap();
    }
}
