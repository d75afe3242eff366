//! In-memory store.
//!
//! Suitable for tests, development, and single-process embedders. All state
//! lives behind one mutex, so every trait method is trivially atomic.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Mode, NewSecret, ScratchCode, SecretRecord};
use crate::store::OtpStore;

#[derive(Default)]
struct Inner {
    secrets: HashMap<Uuid, SecretRecord>,
    scratches: Vec<ScratchCode>,
}

/// In-memory twin of [`super::PgStore`].
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites a secret's creation timestamp. Exists so GC cutoff behavior
    /// can be exercised without waiting out real timeouts.
    pub async fn backdate_created_at(&self, secret_id: Uuid, created_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.secrets.get_mut(&secret_id) {
            Some(record) => {
                record.created_at = created_at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OtpStore for MemStore {
    async fn create_secret(
        &self,
        new: NewSecret,
        scratch_codes: &[String],
    ) -> Result<SecretRecord> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let record = SecretRecord {
            secret_id: Uuid::new_v4(),
            secret: new.secret,
            digits: new.config.digits() as i16,
            mode: new.config.mode(),
            algo: new.config.algo(),
            period: new.config.period() as i16,
            counter: 1,
            confirmed: false,
            created_at: now,
            updated_at: now,
        };
        for code in scratch_codes {
            inner.scratches.push(ScratchCode {
                scratch_id: Uuid::new_v4(),
                secret_id: record.secret_id,
                code: code.clone(),
            });
        }
        inner.secrets.insert(record.secret_id, record.clone());
        Ok(record)
    }

    async fn get_secret(&self, secret_id: Uuid) -> Result<Option<SecretRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.secrets.get(&secret_id).cloned())
    }

    async fn confirm_secret(&self, secret_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.secrets.get_mut(&secret_id) {
            Some(record) if !record.confirmed => {
                record.confirmed = true;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_counter(&self, secret_id: Uuid, delta: i64) -> Result<Option<i64>> {
        let mut inner = self.inner.lock().await;
        match inner.secrets.get_mut(&secret_id) {
            Some(record) if record.mode == Mode::Hotp => {
                record.counter += delta;
                record.updated_at = Utc::now();
                Ok(Some(record.counter))
            }
            _ => Ok(None),
        }
    }

    async fn set_counter(&self, secret_id: Uuid, value: i64) -> Result<Option<i64>> {
        if value < 1 {
            return Ok(None);
        }
        let mut inner = self.inner.lock().await;
        match inner.secrets.get_mut(&secret_id) {
            Some(record) if record.mode == Mode::Hotp => {
                record.counter = value;
                record.updated_at = Utc::now();
                Ok(Some(record.counter))
            }
            _ => Ok(None),
        }
    }

    async fn delete_secret(&self, secret_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.scratches.retain(|s| s.secret_id != secret_id);
        Ok(inner.secrets.remove(&secret_id).is_some())
    }

    async fn find_unconfirmed_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .secrets
            .values()
            .filter(|r| !r.confirmed && r.created_at < cutoff)
            .map(|r| r.secret_id)
            .collect())
    }

    async fn purge_unconfirmed_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let stale: Vec<Uuid> = inner
            .secrets
            .values()
            .filter(|r| !r.confirmed && r.created_at < cutoff)
            .map(|r| r.secret_id)
            .collect();
        inner.scratches.retain(|s| !stale.contains(&s.secret_id));
        for secret_id in &stale {
            inner.secrets.remove(secret_id);
        }
        Ok(stale.len() as u64)
    }

    async fn create_scratches(&self, secret_id: Uuid, codes: &[String]) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.secrets.contains_key(&secret_id) {
            return Ok(false);
        }
        for code in codes {
            inner.scratches.push(ScratchCode {
                scratch_id: Uuid::new_v4(),
                secret_id,
                code: code.clone(),
            });
        }
        Ok(true)
    }

    async fn scratches_for(&self, secret_id: Uuid) -> Result<Vec<ScratchCode>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .scratches
            .iter()
            .filter(|s| s.secret_id == secret_id)
            .cloned()
            .collect())
    }

    async fn consume_scratch(&self, secret_id: Uuid, code: &str, consume: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let position = inner
            .scratches
            .iter()
            .position(|s| s.secret_id == secret_id && s.code == code);
        match position {
            Some(index) => {
                if consume {
                    inner.scratches.remove(index);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn invalidate_scratches(&self, secret_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.scratches.retain(|s| s.secret_id != secret_id);
        Ok(())
    }
}
