//! Per-account junk filter: a word-token bayesian classifier.
//!
//! Storage is two files next to the account index: `junkfilter.db` with
//! per-word ham/spam counts and message totals, and `junkfilter.bloom`, a
//! prefilter that avoids database lookups for words never seen in
//! training. Both are disposable; the filter is fully rebuildable from the
//! messages flagged junk or notjunk.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use merel_common::config::JunkFilterConfig;
use merel_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::debug;

use crate::bloom::Bloom;
use crate::db::{self, JUNK_SCHEMA};

/// Result of classifying one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Junk probability in [0, 1]. 0 when no trained words matched.
    pub probability: f64,
    /// Selected words that leaned ham.
    pub ham_words: usize,
    /// Selected words that leaned spam.
    pub spam_words: usize,
    /// Words that participated in the probability combination.
    pub words_used: usize,
}

pub struct JunkFilter {
    pool: SqlitePool,
    bloom: Bloom,
    bloom_path: PathBuf,
    config: JunkFilterConfig,
}

impl JunkFilter {
    /// Open (creating if missing) the filter files in an account directory.
    pub async fn open(dir: &Path, config: JunkFilterConfig) -> Result<Self> {
        let pool = db::open_database(&dir.join("junkfilter.db"), JUNK_SCHEMA).await?;
        let bloom_path = dir.join("junkfilter.bloom");
        let bloom = Bloom::load(&bloom_path).await?;
        Ok(Self {
            pool,
            bloom,
            bloom_path,
            config,
        })
    }

    /// Classification probability above which a message counts as junk.
    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Persist the bloom filter and close the database.
    pub async fn close(self) -> Result<()> {
        self.bloom.save(&self.bloom_path).await?;
        self.pool.close().await;
        Ok(())
    }

    /// Feed one message to the filter.
    pub async fn train(&mut self, data: &[u8], spam: bool) -> Result<()> {
        let words = tokenize(data);
        let (dh, ds) = if spam { (0i64, 1i64) } else { (1i64, 0i64) };

        let mut tx = self.pool.begin().await.map_err(db::db_err)?;
        for word in &words {
            sqlx::query(
                "INSERT INTO words (word, ham, spam) VALUES (?, ?, ?)
                 ON CONFLICT(word) DO UPDATE SET ham = ham + excluded.ham, spam = spam + excluded.spam",
            )
            .bind(word)
            .bind(dh)
            .bind(ds)
            .execute(&mut *tx)
            .await
            .map_err(db::db_err)?;
        }
        sqlx::query("UPDATE totals SET ham = ham + ?, spam = spam + ? WHERE id = 1")
            .bind(dh)
            .bind(ds)
            .execute(&mut *tx)
            .await
            .map_err(db::db_err)?;
        tx.commit().await.map_err(db::db_err)?;

        for word in &words {
            self.bloom.add(word);
        }
        self.bloom.save(&self.bloom_path).await?;

        debug!(words = words.len(), spam, "trained message");
        Ok(())
    }

    /// Remove one previously trained message from the counts. The bloom
    /// filter keeps its bits; it only over-approximates.
    pub async fn untrain(&mut self, data: &[u8], spam: bool) -> Result<()> {
        let words = tokenize(data);
        let (dh, ds) = if spam { (0i64, 1i64) } else { (1i64, 0i64) };

        let mut tx = self.pool.begin().await.map_err(db::db_err)?;
        for word in &words {
            sqlx::query(
                "UPDATE words SET ham = MAX(0, ham - ?), spam = MAX(0, spam - ?) WHERE word = ?",
            )
            .bind(dh)
            .bind(ds)
            .bind(word)
            .execute(&mut *tx)
            .await
            .map_err(db::db_err)?;
        }
        sqlx::query("UPDATE totals SET ham = MAX(0, ham - ?), spam = MAX(0, spam - ?) WHERE id = 1")
            .bind(dh)
            .bind(ds)
            .execute(&mut *tx)
            .await
            .map_err(db::db_err)?;
        tx.commit().await.map_err(db::db_err)?;
        Ok(())
    }

    /// Classify a message into a junk probability.
    pub async fn classify(&self, data: &[u8]) -> Result<Classification> {
        let (ham_total, spam_total): (i64, i64) =
            sqlx::query_as("SELECT ham, spam FROM totals WHERE id = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(db::db_err)?;

        if ham_total + spam_total == 0 {
            // An untrained filter has no opinion; let messages in.
            return Ok(Classification {
                probability: 0.0,
                ham_words: 0,
                spam_words: 0,
                words_used: 0,
            });
        }

        let mut scored: Vec<f64> = Vec::new();
        for word in tokenize(data) {
            if !self.bloom.contains(&word) {
                continue;
            }
            let counts: Option<(i64, i64)> =
                sqlx::query_as("SELECT ham, spam FROM words WHERE word = ?")
                    .bind(&word)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db::db_err)?;
            let (ham, spam) = match counts {
                Some(c) if c.0 + c.1 > 0 => c,
                _ => continue,
            };
            scored.push(word_probability(ham, spam, ham_total, spam_total));
        }

        // The words furthest from neutral carry the decision.
        scored.sort_by(|a, b| {
            (b - 0.5)
                .abs()
                .partial_cmp(&(a - 0.5).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(self.config.top_words);

        if scored.is_empty() {
            return Ok(Classification {
                probability: 0.0,
                ham_words: 0,
                spam_words: 0,
                words_used: 0,
            });
        }

        let mut log_p = 0f64;
        let mut log_not = 0f64;
        let mut ham_words = 0;
        let mut spam_words = 0;
        for p in &scored {
            log_p += p.ln();
            log_not += (1.0 - p).ln();
            if *p < 0.5 {
                ham_words += 1;
            } else if *p > 0.5 {
                spam_words += 1;
            }
        }
        let probability = 1.0 / (1.0 + (log_not - log_p).exp());

        Ok(Classification {
            probability,
            ham_words,
            spam_words,
            words_used: scored.len(),
        })
    }
}

/// Bayesian word probability with the usual smoothing towards neutral for
/// rarely seen words.
fn word_probability(ham: i64, spam: i64, ham_total: i64, spam_total: i64) -> f64 {
    let ph = ham as f64 / ham_total.max(1) as f64;
    let ps = spam as f64 / spam_total.max(1) as f64;
    let raw = if ph + ps > 0.0 { ps / (ph + ps) } else { 0.5 };
    let n = (ham + spam) as f64;
    let smoothed = (0.5 + n * raw) / (1.0 + n);
    smoothed.clamp(0.01, 0.99)
}

/// Unique lowercase word tokens of a message. Words are runs of
/// alphanumerics of reasonable length containing at least one letter.
fn tokenize(data: &[u8]) -> BTreeSet<String> {
    let text = String::from_utf8_lossy(data);
    let mut words = BTreeSet::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '\'' || c == '-' {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            push_word(&mut words, std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        push_word(&mut words, current);
    }
    words
}

fn push_word(words: &mut BTreeSet<String>, word: String) {
    if word.len() < 2 || word.len() > 30 {
        return;
    }
    if !word.chars().any(|c| c.is_alphabetic()) {
        return;
    }
    words.insert(word);
}

/// Remove the filter files; the next open starts fresh. Used by retrain.
pub async fn remove_files(dir: &Path) -> Result<()> {
    for name in ["junkfilter.db", "junkfilter.db-wal", "junkfilter.db-shm", "junkfilter.bloom"] {
        match tokio::fs::remove_file(dir.join(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Storage(format!("removing {}: {}", name, e))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spammy() -> &'static [u8] {
        b"Subject: cheap pills\r\n\r\nbuy viagra lottery winner casino bonus\r\n"
    }

    fn hammy() -> &'static [u8] {
        b"Subject: meeting notes\r\n\r\nagenda project deadline review thanks\r\n"
    }

    #[test]
    fn test_tokenize() {
        let words = tokenize(b"Hello, hello WORLD 123 a x-ray");
        assert!(words.contains("hello"));
        assert!(words.contains("world"));
        assert!(words.contains("x-ray"));
        assert!(!words.contains("123")); // no letters
        assert!(!words.contains("a")); // too short
        assert_eq!(words.iter().filter(|w| *w == "hello").count(), 1);
    }

    #[test]
    fn test_word_probability_bounds() {
        let p = word_probability(0, 100, 100, 100);
        assert!(p > 0.9 && p <= 0.99);
        let p = word_probability(100, 0, 100, 100);
        assert!(p < 0.1 && p >= 0.01);
        // A single observation stays close to neutral.
        let p = word_probability(0, 1, 100, 100);
        assert!(p > 0.5 && p < 0.8);
    }

    #[tokio::test]
    async fn test_train_classify() {
        let dir = TempDir::new().unwrap();
        let mut jf = JunkFilter::open(dir.path(), JunkFilterConfig::default()).await.unwrap();

        for _ in 0..5 {
            jf.train(spammy(), true).await.unwrap();
            jf.train(hammy(), false).await.unwrap();
        }

        let spam = jf.classify(spammy()).await.unwrap();
        assert!(spam.probability > 0.8, "got {}", spam.probability);
        assert!(spam.spam_words > 0);

        let ham = jf.classify(hammy()).await.unwrap();
        assert!(ham.probability < 0.2, "got {}", ham.probability);
        assert!(ham.ham_words > 0);

        jf.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_untrained_filter_has_no_opinion() {
        let dir = TempDir::new().unwrap();
        let jf = JunkFilter::open(dir.path(), JunkFilterConfig::default()).await.unwrap();
        let c = jf.classify(spammy()).await.unwrap();
        assert_eq!(c.probability, 0.0);
        assert_eq!(c.words_used, 0);
    }

    #[tokio::test]
    async fn test_bloom_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut jf = JunkFilter::open(dir.path(), JunkFilterConfig::default()).await.unwrap();
        jf.train(spammy(), true).await.unwrap();
        jf.close().await.unwrap();

        let jf = JunkFilter::open(dir.path(), JunkFilterConfig::default()).await.unwrap();
        let c = jf.classify(spammy()).await.unwrap();
        assert!(c.words_used > 0);
        jf.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_untrain_reverses_train() {
        let dir = TempDir::new().unwrap();
        let mut jf = JunkFilter::open(dir.path(), JunkFilterConfig::default()).await.unwrap();
        jf.train(spammy(), true).await.unwrap();
        jf.untrain(spammy(), true).await.unwrap();
        let c = jf.classify(spammy()).await.unwrap();
        assert_eq!(c.probability, 0.0);
        jf.close().await.unwrap();
    }
}
