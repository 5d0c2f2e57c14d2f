//! Storage for validated reports and cached MTA-STS policies.
//!
//! Three small databases at the top of the data directory: `tlsrpt.db`
//! and `dmarcrpt.db` receive the reports the inbound analysis validated,
//! `mtasts.db` caches fetched MTA-STS policies for outbound delivery.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use merel_common::clock::Clock;
use merel_common::dns::Resolver;
use merel_common::{Error, Result};
use merel_storage::db::{self, open_database};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::{dmarcrpt, mtasts, tlsrpt};

const TLSRPT_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        received_at TEXT NOT NULL,
        organization_name TEXT NOT NULL,
        report_id TEXT NOT NULL,
        policy_domain TEXT NOT NULL,
        raw TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tlsrpt_domain ON reports (policy_domain)",
];

const DMARCRPT_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        received_at TEXT NOT NULL,
        org_name TEXT NOT NULL,
        report_id TEXT NOT NULL,
        domain TEXT NOT NULL,
        period_begin INTEGER NOT NULL,
        period_end INTEGER NOT NULL,
        raw TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_dmarcrpt_domain ON reports (domain)",
];

const MTASTS_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS policies (
        domain TEXT PRIMARY KEY,
        record_id TEXT NOT NULL,
        policy TEXT NOT NULL,
        fetched_at TEXT NOT NULL,
        max_age_seconds INTEGER NOT NULL
    )",
];

/// Store for validated TLS reports (`tlsrpt.db`).
pub struct TlsReportStore {
    pool: SqlitePool,
}

impl TlsReportStore {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let pool = open_database(&data_dir.join("tlsrpt.db"), TLSRPT_SCHEMA).await?;
        Ok(Self { pool })
    }

    /// Record a validated report, one row per policy domain.
    pub async fn add(&self, report: &tlsrpt::Report, received_at: DateTime<Utc>) -> Result<()> {
        let raw = serde_json::to_string(report)
            .map_err(|e| Error::Internal(format!("encoding tls report: {}", e)))?;
        for domain in report.policy_domains() {
            sqlx::query(
                "INSERT INTO reports (received_at, organization_name, report_id, policy_domain, raw)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(received_at)
            .bind(&report.organization_name)
            .bind(&report.report_id)
            .bind(domain)
            .bind(&raw)
            .execute(&self.pool)
            .await
            .map_err(db::db_err)?;
        }
        info!(report_id = %report.report_id, "stored tls report");
        Ok(())
    }

    pub async fn count_for_domain(&self, domain: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reports WHERE policy_domain = ?")
            .bind(domain)
            .fetch_one(&self.pool)
            .await
            .map_err(db::db_err)?;
        Ok(row.0)
    }
}

/// Store for validated DMARC aggregate reports (`dmarcrpt.db`).
pub struct DmarcReportStore {
    pool: SqlitePool,
}

impl DmarcReportStore {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let pool = open_database(&data_dir.join("dmarcrpt.db"), DMARCRPT_SCHEMA).await?;
        Ok(Self { pool })
    }

    pub async fn add(
        &self,
        feedback: &dmarcrpt::Feedback,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        let raw = serde_json::to_string(feedback)
            .map_err(|e| Error::Internal(format!("encoding dmarc report: {}", e)))?;
        sqlx::query(
            "INSERT INTO reports (received_at, org_name, report_id, domain, period_begin, period_end, raw)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(received_at)
        .bind(&feedback.report_metadata.org_name)
        .bind(&feedback.report_metadata.report_id)
        .bind(&feedback.policy_published.domain)
        .bind(feedback.report_metadata.date_range.begin)
        .bind(feedback.report_metadata.date_range.end)
        .bind(&raw)
        .execute(&self.pool)
        .await
        .map_err(db::db_err)?;
        info!(report_id = %feedback.report_metadata.report_id, "stored dmarc report");
        Ok(())
    }

    pub async fn count_for_domain(&self, domain: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reports WHERE domain = ?")
            .bind(domain)
            .fetch_one(&self.pool)
            .await
            .map_err(db::db_err)?;
        Ok(row.0)
    }
}

/// Fetch-through cache of MTA-STS policies (`mtasts.db`).
pub struct MtastsCache {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl MtastsCache {
    pub async fn open(data_dir: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = open_database(&data_dir.join("mtasts.db"), MTASTS_SCHEMA).await?;
        Ok(Self { pool, clock })
    }

    /// The cached, non-expired policy for a domain.
    pub async fn cached(&self, domain: &str) -> Result<Option<mtasts::Policy>> {
        let domain = domain.to_lowercase();
        let row: Option<(String, DateTime<Utc>, i64)> = sqlx::query_as(
            "SELECT policy, fetched_at, max_age_seconds FROM policies WHERE domain = ?",
        )
        .bind(&domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(db::db_err)?;

        let Some((policy, fetched_at, max_age)) = row else {
            return Ok(None);
        };
        let age = self.clock.now() - fetched_at;
        if age.num_seconds() > max_age {
            debug!(domain, "cached mta-sts policy expired");
            return Ok(None);
        }
        match mtasts::parse_policy(&policy) {
            Ok(policy) => Ok(Some(policy)),
            Err(e) => {
                debug!(domain, error = %e, "cached mta-sts policy unparseable");
                Ok(None)
            }
        }
    }

    pub async fn store(&self, domain: &str, record_id: &str, policy: &mtasts::Policy) -> Result<()> {
        sqlx::query(
            "INSERT INTO policies (domain, record_id, policy, fetched_at, max_age_seconds)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(domain) DO UPDATE SET
                record_id = excluded.record_id,
                policy = excluded.policy,
                fetched_at = excluded.fetched_at,
                max_age_seconds = excluded.max_age_seconds",
        )
        .bind(domain.to_lowercase())
        .bind(record_id)
        .bind(policy.to_string())
        .bind(self.clock.now())
        .bind(policy.max_age_seconds as i64)
        .execute(&self.pool)
        .await
        .map_err(db::db_err)?;
        Ok(())
    }

    /// The policy for a domain: cached if fresh, otherwise looked up and
    /// fetched, then cached.
    pub async fn get(
        &self,
        resolver: &dyn Resolver,
        domain: &str,
    ) -> Result<Option<mtasts::Policy>> {
        if let Some(policy) = self.cached(domain).await? {
            return Ok(Some(policy));
        }
        match mtasts::get(resolver, domain).await {
            Ok((record, policy)) => {
                self.store(domain, &record.id, &policy).await?;
                Ok(Some(policy))
            }
            Err(mtasts::Error::NoRecord | mtasts::Error::MultipleRecords) => Ok(None),
            Err(e) => Err(Error::Dns(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merel_common::clock::ManualClock;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tls_report_store() {
        let dir = TempDir::new().unwrap();
        let store = TlsReportStore::open(dir.path()).await.unwrap();

        let report = tlsrpt::parse(crate::tlsrpt::SAMPLE_REPORT.as_bytes()).unwrap();
        store.add(&report, Utc::now()).await.unwrap();

        assert_eq!(store.count_for_domain("merel.example").await.unwrap(), 1);
        assert_eq!(store.count_for_domain("other.example").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dmarc_report_store() {
        let dir = TempDir::new().unwrap();
        let store = DmarcReportStore::open(dir.path()).await.unwrap();

        let xml = crate::dmarcrpt::sample_report("merel.example", 1700000000);
        let feedback = dmarcrpt::parse(xml.as_bytes()).unwrap();
        store.add(&feedback, Utc::now()).await.unwrap();

        assert_eq!(store.count_for_domain("merel.example").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mtasts_cache_expiry() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MtastsCache::open(dir.path(), clock.clone()).await.unwrap();

        assert!(cache.cached("example.com").await.unwrap().is_none());

        let policy = mtasts::parse_policy(
            "version: STSv1\nmode: enforce\nmx: mail.example.com\nmax_age: 3600\n",
        )
        .unwrap();
        cache.store("Example.COM", "id1", &policy).await.unwrap();

        let cached = cache.cached("example.com").await.unwrap().unwrap();
        assert_eq!(cached.mode, mtasts::Mode::Enforce);
        assert!(cached.matches("mail.example.com"));

        clock.advance(chrono::Duration::seconds(3601));
        assert!(cache.cached("example.com").await.unwrap().is_none());
    }
}
