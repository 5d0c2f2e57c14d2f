//! The store: account registry and address resolution.
//!
//! Accounts are opened on first use and cached as `Arc` handles, so the
//! reference count tracks outside users (queue, analyzer, control socket).
//! `close_idle` drops handles nobody else holds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use merel_common::config::{Config, Destination};
use merel_common::types::EmailAddress;
use merel_common::{Error, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::account::Account;

pub struct Store {
    data_dir: PathBuf,
    config: Arc<Config>,
    accounts: Mutex<HashMap<String, Arc<Account>>>,
    received_id_key: [u8; 16],
}

impl Store {
    /// Open the data directory, creating it and the `receivedid.key` on
    /// first use.
    pub async fn open(config: Arc<Config>) -> Result<Self> {
        let data_dir = config.data_dir.clone();
        std::fs::create_dir_all(data_dir.join("accounts"))
            .map_err(|e| Error::Storage(format!("creating data dir: {}", e)))?;

        let received_id_key = load_or_create_key(&data_dir.join("receivedid.key"))?;

        info!(data_dir = %data_dir.display(), "opened store");
        Ok(Self {
            data_dir,
            config,
            accounts: Mutex::new(HashMap::new()),
            received_id_key,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a handle to an account, opening it on first use.
    pub async fn account(&self, name: &str) -> Result<Arc<Account>> {
        let mut accounts = self.accounts.lock().await;
        if let Some(acc) = accounts.get(name) {
            return Ok(acc.clone());
        }
        let config = self
            .config
            .accounts
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("account {}", name)))?;
        let dir = self.data_dir.join("accounts").join(name);
        let acc = Arc::new(Account::open(name, &dir, config).await?);
        accounts.insert(name.to_string(), acc.clone());
        debug!(account = name, "opened account");
        Ok(acc)
    }

    /// Resolve a recipient address to its account, canonical address and
    /// destination configuration. Localparts fold case; the catchall
    /// destination applies when no exact localpart matches.
    pub async fn open_email(&self, addr: &str) -> Result<(Arc<Account>, String, Destination)> {
        let addr = EmailAddress::parse(addr)
            .ok_or_else(|| Error::Validation(format!("invalid address {:?}", addr)))?;
        let (name, _, canonical, dest) = self
            .config
            .find_destination(&addr)
            .ok_or_else(|| Error::NotFound(format!("no destination for {}", addr)))?;
        let dest = dest.clone();
        let account = self.account(&name).await?;
        Ok((account, canonical, dest))
    }

    /// Drop account handles that nobody outside the registry holds.
    pub async fn close_idle(&self) {
        let mut accounts = self.accounts.lock().await;
        accounts.retain(|name, acc| {
            let keep = Arc::strong_count(acc) > 1;
            if !keep {
                debug!(account = %name, "closing idle account");
            }
            keep
        });
    }

    /// Opaque connection id for Received headers, keyed so message ids do
    /// not leak the delivery counter.
    pub fn received_id(&self, cid: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.received_id_key);
        hasher.update(cid.to_be_bytes());
        let digest = hasher.finalize();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        format!("{:016x}", u64::from_be_bytes(buf))
    }
}

fn load_or_create_key(path: &Path) -> Result<[u8; 16]> {
    match std::fs::read(path) {
        Ok(data) if data.len() == 16 => {
            let mut key = [0u8; 16];
            key.copy_from_slice(&data);
            Ok(key)
        }
        Ok(_) => Err(Error::Storage(format!(
            "{} has unexpected size",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut key);
            std::fs::write(path, key)
                .map_err(|e| Error::Storage(format!("writing {}: {}", path.display(), e)))?;
            Ok(key)
        }
        Err(e) => Err(Error::Storage(format!("reading {}: {}", path.display(), e))),
    }
}
