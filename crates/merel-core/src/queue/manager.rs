//! Queue scheduler: picks due entries, attempts delivery, applies
//! backoff, and returns failed mail to its sender.
//!
//! One loop selects ready entries; each attempt runs in its own task so a
//! slow destination does not hold up the rest. Entries being attempted
//! carry a lease bit that excludes them from selection; leases do not
//! survive a restart. Concurrency is capped globally and per destination
//! domain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use merel_common::clock::Clock;
use merel_common::config::QueueConfig;
use merel_common::Result;
use merel_storage::db;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use super::transport::{DeliveryAgent, DeliveryResult};
use super::{Queue, QueueMessage};

/// How many due entries one pass claims at most.
const CLAIM_BATCH: i64 = 32;

pub struct Scheduler {
    queue: Arc<Queue>,
    agent: Arc<dyn DeliveryAgent>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    hostname: String,
    global: Arc<Semaphore>,
    domains: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<Queue>,
        agent: Arc<dyn DeliveryAgent>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        hostname: String,
    ) -> Arc<Self> {
        let global = Arc::new(Semaphore::new(config.max_concurrency));
        Arc::new(Self {
            queue,
            agent,
            config,
            clock,
            hostname,
            global,
            domains: Mutex::new(HashMap::new()),
        })
    }

    /// Run the delivery loop.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(TokioDuration::from_secs(1));
        info!("queue scheduler started");
        loop {
            ticker.tick().await;
            if let Err(e) = self.process_due().await {
                error!(error = %e, "processing queue");
            }
        }
    }

    /// Claim and attempt every due entry. The returned handles complete
    /// when the attempts do.
    pub async fn process_due(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let now = self.clock.now();
        let due: Vec<QueueMessage> = sqlx::query_as(
            "SELECT * FROM queue WHERE leased = 0 AND next_attempt <= ?
             ORDER BY next_attempt LIMIT ?",
        )
        .bind(now)
        .bind(CLAIM_BATCH)
        .fetch_all(self.queue.db())
        .await
        .map_err(db::db_err)?;

        let mut handles = Vec::new();
        for qm in due {
            // The lease is the claim; a concurrent pass loses the race.
            let claimed = sqlx::query("UPDATE queue SET leased = 1 WHERE id = ? AND leased = 0")
                .bind(qm.id)
                .execute(self.queue.db())
                .await
                .map_err(db::db_err)?
                .rows_affected();
            if claimed != 1 {
                continue;
            }
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                scheduler.attempt(qm).await;
            }));
        }
        Ok(handles)
    }

    async fn attempt(self: Arc<Self>, qm: QueueMessage) {
        let _global = self.global.clone().acquire_owned().await.ok();
        let _domain = self
            .domain_semaphore(&qm.recipient_domain)
            .acquire_owned()
            .await
            .ok();

        debug!(id = qm.id, recipient_domain = %qm.recipient_domain, attempt = qm.attempts + 1, "delivery attempt");

        let data = match self.queue.open_message(qm.id).await {
            Ok(data) => data,
            Err(e) => {
                // A row without blob cannot ever deliver.
                error!(id = qm.id, error = %e, "reading queue blob, dropping entry");
                if let Err(e) = self.queue.remove(qm.id).await {
                    warn!(id = qm.id, error = %e, "removing broken queue entry");
                }
                return;
            }
        };

        let sender = qm.sender();
        let recipient = qm.recipient();
        let result = self
            .agent
            .deliver(&qm.transport, sender.as_ref(), &recipient, &data)
            .await;

        let outcome = match result {
            DeliveryResult::Delivered => {
                info!(id = qm.id, recipient = %recipient, "delivered from queue");
                self.queue.remove(qm.id).await
            }
            DeliveryResult::Temporary(err) => {
                let attempts = qm.attempts + 1;
                if attempts >= self.config.max_attempts {
                    info!(id = qm.id, attempts, "giving up after max attempts");
                    self.give_up(&qm, &err).await
                } else {
                    self.schedule_retry(&qm, attempts, &err).await
                }
            }
            DeliveryResult::Permanent(err) => {
                info!(id = qm.id, error = %err, "permanent failure");
                self.give_up(&qm, &err).await
            }
        };
        if let Err(e) = outcome {
            // Never kill the loop; release the lease so the entry is
            // picked up again.
            error!(id = qm.id, error = %e, "handling attempt result");
            let _ = sqlx::query("UPDATE queue SET leased = 0 WHERE id = ?")
                .bind(qm.id)
                .execute(self.queue.db())
                .await;
        }
    }

    async fn schedule_retry(&self, qm: &QueueMessage, attempts: i64, err: &str) -> Result<()> {
        let now = self.clock.now();
        let delay = self.backoff(attempts);
        let next = now + delay;
        info!(id = qm.id, attempts, next_attempt = %next, error = %err, "scheduling retry");
        sqlx::query(
            "UPDATE queue SET leased = 0, attempts = ?, next_attempt = ?, last_attempt = ?, last_error = ?
             WHERE id = ?",
        )
        .bind(attempts)
        .bind(next)
        .bind(now)
        .bind(err)
        .bind(qm.id)
        .execute(self.queue.db())
        .await
        .map_err(db::db_err)?;
        Ok(())
    }

    async fn give_up(&self, qm: &QueueMessage, err: &str) -> Result<()> {
        if let Some(sender) = qm.sender() {
            if qm.is_dsn {
                warn!(id = qm.id, "not returning a failed dsn");
            } else {
                let dsn = self.dsn_message(qm, err);
                // DSNs go out with the null reverse-path so they can never
                // bounce back and forth.
                self.queue.add(None, &sender, "", true, &dsn).await?;
            }
        } else {
            warn!(id = qm.id, "failed message has no return path, dropping");
        }
        self.queue.remove(qm.id).await
    }

    /// Exponential backoff: 7.5 minutes doubling per attempt, capped.
    fn backoff(&self, attempts: i64) -> Duration {
        let shift = (attempts - 1).clamp(0, 30) as u32;
        let secs = self
            .config
            .first_retry_secs
            .saturating_mul(1u64 << shift)
            .min(self.config.max_retry_secs);
        Duration::seconds(secs as i64)
    }

    fn dsn_message(&self, qm: &QueueMessage, err: &str) -> Vec<u8> {
        let now = self.clock.now();
        format!(
            "From: MAILER-DAEMON@{host}\r\n\
             To: <{sender}>\r\n\
             Subject: mail delivery failed: {recipient}\r\n\
             Auto-Submitted: auto-replied\r\n\
             Date: {date}\r\n\
             \r\n\
             Delivery of your message to {recipient} failed permanently.\r\n\
             \r\n\
             Last error: {err}\r\n\
             Attempts: {attempts}\r\n\
             First queued: {queued}\r\n",
            host = self.hostname,
            sender = qm.sender().map(|s| s.to_string()).unwrap_or_default(),
            recipient = qm.recipient(),
            date = now.to_rfc2822(),
            err = err,
            attempts = qm.attempts + 1,
            queued = qm.queued_at.to_rfc3339(),
        )
        .into_bytes()
    }

    fn domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let mut domains = self.domains.lock().unwrap();
        domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_domain_concurrency)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::transport::RecordingAgent;
    use crate::queue::QueueFilter;
    use chrono::Utc;
    use merel_common::clock::ManualClock;
    use merel_common::types::EmailAddress;
    use tempfile::TempDir;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).unwrap()
    }

    async fn setup(
        dir: &TempDir,
        script: Vec<DeliveryResult>,
        config: QueueConfig,
    ) -> (Arc<Queue>, Arc<Scheduler>, Arc<ManualClock>, Arc<RecordingAgent>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(
            Queue::open(&dir.path().join("queue"), clock.clone())
                .await
                .unwrap(),
        );
        let agent = RecordingAgent::new(script);
        let scheduler = Scheduler::new(
            queue.clone(),
            agent.clone(),
            config,
            clock.clone(),
            "merel.example".to_string(),
        );
        (queue, scheduler, clock, agent)
    }

    async fn drain(handles: Vec<JoinHandle<()>>) {
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_backoff_schedule() {
        let dir = TempDir::new().unwrap();
        let (_, scheduler, _, _) = setup(&dir, vec![], QueueConfig::default()).await;
        assert_eq!(scheduler.backoff(1), Duration::seconds(450));
        assert_eq!(scheduler.backoff(2), Duration::seconds(900));
        assert_eq!(scheduler.backoff(3), Duration::seconds(1800));
        assert_eq!(scheduler.backoff(8), Duration::seconds(57600));
        // Capped at a day.
        assert_eq!(scheduler.backoff(9), Duration::seconds(86400));
        assert_eq!(scheduler.backoff(20), Duration::seconds(86400));
    }

    #[tokio::test]
    async fn test_temporary_failure_backs_off_then_kick_retries() {
        let dir = TempDir::new().unwrap();
        let (queue, scheduler, clock, agent) = setup(
            &dir,
            vec![
                DeliveryResult::Temporary("451 greylisted".to_string()),
                DeliveryResult::Delivered,
            ],
            QueueConfig::default(),
        )
        .await;

        let id = queue
            .add(Some(&addr("mjl@merel.example")), &addr("a@one.example"), "", false, b"m")
            .await
            .unwrap();

        drain(scheduler.process_due().await.unwrap()).await;

        // First attempt got a 4xx: still queued, backoff applied.
        let qm = queue.get(id).await.unwrap();
        assert_eq!(qm.attempts, 1);
        let expected = clock.now() + Duration::seconds(450);
        assert!((qm.next_attempt - expected).num_seconds().abs() < 1);
        assert_eq!(qm.last_error.as_deref(), Some("451 greylisted"));
        assert!(!qm.leased);
        assert_eq!(queue.list().await.unwrap().len(), 1);

        // Not due yet: nothing claimed.
        assert!(scheduler.process_due().await.unwrap().is_empty());

        // Kick makes it due immediately; the next attempt succeeds.
        let filter = QueueFilter { id: Some(id), ..QueueFilter::default() };
        queue.kick(&filter, None).await.unwrap();
        assert!(queue.get(id).await.unwrap().next_attempt <= clock.now());

        drain(scheduler.process_due().await.unwrap()).await;
        assert!(queue.list().await.unwrap().is_empty());
        assert_eq!(agent.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_returns_dsn() {
        let dir = TempDir::new().unwrap();
        let (queue, scheduler, _, _) = setup(
            &dir,
            vec![DeliveryResult::Permanent("550 no such user".to_string())],
            QueueConfig::default(),
        )
        .await;

        queue
            .add(Some(&addr("mjl@merel.example")), &addr("a@one.example"), "", false, b"m")
            .await
            .unwrap();
        drain(scheduler.process_due().await.unwrap()).await;

        let list = queue.list().await.unwrap();
        assert_eq!(list.len(), 1);
        let dsn = &list[0];
        assert!(dsn.is_dsn);
        assert!(dsn.sender().is_none());
        assert_eq!(dsn.recipient().to_string(), "mjl@merel.example");

        let body = queue.open_message(dsn.id).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("550 no such user"));
        assert!(text.contains("a@one.example"));
    }

    #[tokio::test]
    async fn test_failed_dsn_is_not_bounced_again() {
        let dir = TempDir::new().unwrap();
        let (queue, scheduler, _, _) = setup(
            &dir,
            vec![DeliveryResult::Permanent("550 nope".to_string())],
            QueueConfig::default(),
        )
        .await;

        // A message with the null reverse-path (e.g. a DSN we generated).
        queue
            .add(None, &addr("a@one.example"), "", true, b"dsn")
            .await
            .unwrap();
        drain(scheduler.process_due().await.unwrap()).await;
        assert!(queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_attempts_gives_up() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            max_attempts: 1,
            ..QueueConfig::default()
        };
        let (queue, scheduler, _, _) = setup(
            &dir,
            vec![DeliveryResult::Temporary("451 busy".to_string())],
            config,
        )
        .await;

        queue
            .add(Some(&addr("mjl@merel.example")), &addr("a@one.example"), "", false, b"m")
            .await
            .unwrap();
        drain(scheduler.process_due().await.unwrap()).await;

        // Original dropped, only the DSN remains.
        let list = queue.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].is_dsn);
    }

    #[tokio::test]
    async fn test_transport_passed_to_agent() {
        let dir = TempDir::new().unwrap();
        let (queue, scheduler, _, agent) =
            setup(&dir, vec![DeliveryResult::Delivered], QueueConfig::default()).await;

        queue
            .add(Some(&addr("mjl@merel.example")), &addr("a@one.example"), "null", false, b"m")
            .await
            .unwrap();
        drain(scheduler.process_due().await.unwrap()).await;

        let calls = agent.calls.lock().unwrap();
        assert_eq!(calls[0], ("null".to_string(), "a@one.example".to_string()));
    }
}
