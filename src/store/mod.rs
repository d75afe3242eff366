//! Persistence seam for secrets and scratch codes.
//!
//! Implementations must make every trait method atomic: when a method
//! touches more than one row it opens its own transaction and rolls back on
//! any failure, so no partial write is ever observable. Expected negative
//! outcomes (missing rows, policy rejections) are `bool`/`Option` results;
//! only genuine storage failures surface as errors.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{NewSecret, ScratchCode, SecretRecord};

pub use memory::MemStore;
pub use postgres::PgStore;

/// Storage contract for the OTP engine.
#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Persists a new unconfirmed secret together with its initial scratch
    /// batch, atomically, and returns the stored record.
    async fn create_secret(
        &self,
        new: NewSecret,
        scratch_codes: &[String],
    ) -> Result<SecretRecord>;

    /// Fetches a secret by id.
    async fn get_secret(&self, secret_id: Uuid) -> Result<Option<SecretRecord>>;

    /// Marks a secret confirmed. Returns `false` without mutation when the
    /// secret is missing or already confirmed.
    async fn confirm_secret(&self, secret_id: Uuid) -> Result<bool>;

    /// Advances the HOTP counter by `delta` and returns the new value.
    /// Returns `None` without mutation for TOTP secrets or missing ids.
    async fn advance_counter(&self, secret_id: Uuid, delta: i64) -> Result<Option<i64>>;

    /// Sets the HOTP counter to an absolute value (>= 1) and returns it.
    /// Returns `None` without mutation for TOTP secrets or missing ids.
    async fn set_counter(&self, secret_id: Uuid, value: i64) -> Result<Option<i64>>;

    /// Deletes a secret and all its scratch codes in one transaction.
    /// Returns `false` when no such secret existed.
    async fn delete_secret(&self, secret_id: Uuid) -> Result<bool>;

    /// Lists unconfirmed secrets created strictly before `cutoff`.
    async fn find_unconfirmed_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Deletes every unconfirmed secret created strictly before `cutoff`,
    /// cascading to scratch codes, as a single all-or-nothing sweep.
    /// Returns the number of secrets removed.
    async fn purge_unconfirmed_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Inserts a batch of scratch codes for an existing secret, atomically.
    /// Returns `false` without mutation when the secret does not exist.
    async fn create_scratches(&self, secret_id: Uuid, codes: &[String]) -> Result<bool>;

    /// Lists the scratch codes currently bound to a secret.
    async fn scratches_for(&self, secret_id: Uuid) -> Result<Vec<ScratchCode>>;

    /// Looks for an exact match among the secret's scratch codes. On match,
    /// deletes that one row when `consume` is set, in the same transaction
    /// that reports success. No normalization, first match wins.
    async fn consume_scratch(&self, secret_id: Uuid, code: &str, consume: bool) -> Result<bool>;

    /// Deletes every scratch code for a secret. Succeeds even when the set
    /// was already empty.
    async fn invalidate_scratches(&self, secret_id: Uuid) -> Result<()>;
}
