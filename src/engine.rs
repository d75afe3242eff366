//! OTP engine: binds one secret at a time and runs verification,
//! confirmation, scratch-code routing, and unconfirmed-secret cleanup.
//!
//! The handle moves through three states: unbound, bound-unconfirmed,
//! bound-confirmed. Every accessor and mutator short-circuits to a negative
//! result while unbound, so callers can probe state without error handling.
//! The engine holds no locks; a handle belongs to one logical session and
//! the store is the sole synchronization point.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Mode, NewSecret, SecretConfig, SecretRecord, SCRATCH_LENGTH};
use crate::oath;
use crate::store::OtpStore;

/// Default slip allowed; odd values reach further into the past.
pub const DEFAULT_SLIP: u32 = 2;
/// Default timeout for unconfirmed secrets, seconds.
pub const DEFAULT_TIMEOUT: u64 = 900;
/// Default chance that a `create`/`bind` call sweeps expired secrets.
pub const DEFAULT_GC_PROBABILITY: f64 = 0.05;

/// Policy deciding when a `create`/`bind` call runs the unconfirmed-secret
/// sweep. Injectable so tests can force or disable collection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GcTrigger {
    Never,
    /// Independent roll per call with the given probability.
    Probability(f64),
    Always,
}

impl GcTrigger {
    fn fires(self) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Probability(p) => rand::thread_rng().gen::<f64>() < p,
        }
    }
}

impl Default for GcTrigger {
    fn default() -> Self {
        Self::Probability(DEFAULT_GC_PROBABILITY)
    }
}

/// Engine configuration; the per-secret parameters live in
/// [`SecretConfig`].
#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub secret: SecretConfig,
    /// Scratch codes generated per batch.
    pub scratch_count: usize,
    /// Adjacent moving-factor windows accepted besides the current one.
    pub slip: u32,
    /// Whether a matched scratch code is deleted on successful use.
    pub consume_scratch: bool,
    /// Age after which an unconfirmed secret becomes collectable, seconds.
    pub unconfirmed_timeout: u64,
    pub gc: GcTrigger,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            secret: SecretConfig::default(),
            scratch_count: crate::models::DEFAULT_SCRATCH_COUNT,
            slip: DEFAULT_SLIP,
            consume_scratch: true,
            unconfirmed_timeout: DEFAULT_TIMEOUT,
            gc: GcTrigger::default(),
        }
    }
}

/// A handle over at most one secret at a time.
pub struct Otp {
    store: Arc<dyn OtpStore>,
    config: OtpConfig,
    secret: Option<SecretRecord>,
}

impl Otp {
    /// Builds an unbound engine over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn OtpStore>, config: OtpConfig) -> Self {
        Self {
            store,
            config,
            secret: None,
        }
    }

    /// Generates and persists a fresh secret with its scratch batch (one
    /// transaction), binds the engine to it, and returns its id. May run
    /// the GC sweep per the configured trigger.
    ///
    /// # Errors
    /// Returns an error on invalid configuration or storage failure.
    pub async fn create(&mut self) -> Result<Uuid> {
        let new = NewSecret::new(oath::generate_secret_base32(), self.config.secret)?;
        let codes: Vec<String> = (0..self.config.scratch_count)
            .map(|_| oath::random_digits(SCRATCH_LENGTH))
            .collect();
        let record = self.store.create_secret(new, &codes).await?;
        let secret_id = record.secret_id;
        debug!(%secret_id, mode = record.mode.as_str(), "created secret");
        self.secret = Some(record);
        self.maybe_gc().await;
        Ok(secret_id)
    }

    /// Loads an existing secret and binds to it. Returns whether the secret
    /// was found; the engine stays unbound when it was not. May run the GC
    /// sweep per the configured trigger.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn bind(&mut self, secret_id: Uuid) -> Result<bool> {
        self.secret = self.store.get_secret(secret_id).await?;
        self.maybe_gc().await;
        Ok(self.secret.is_some())
    }

    /// Id of the bound secret, `None` while unbound.
    #[must_use]
    pub fn sid(&self) -> Option<Uuid> {
        self.secret.as_ref().map(|s| s.secret_id)
    }

    /// Base32-encoded secret for external `otpauth://`/QR consumers.
    #[must_use]
    pub fn secret_base32(&self) -> Option<&str> {
        self.secret.as_ref().map(|s| s.secret.as_str())
    }

    /// Confirmation status, `None` while unbound.
    #[must_use]
    pub fn is_confirmed(&self) -> Option<bool> {
        self.secret.as_ref().map(|s| s.confirmed)
    }

    /// Remaining scratch codes for the bound secret, `None` while unbound.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn scratches(&self) -> Result<Option<Vec<String>>> {
        let Some(record) = &self.secret else {
            return Ok(None);
        };
        let codes = self
            .store
            .scratches_for(record.secret_id)
            .await?
            .into_iter()
            .map(|s| s.code)
            .collect();
        Ok(Some(codes))
    }

    /// Computes the current primary code without verifying or mutating
    /// anything; for display and testing, not authentication decisions.
    ///
    /// # Errors
    /// Returns an error when the stored secret fails to decode.
    pub fn generate(&self) -> Result<Option<String>> {
        let Some(record) = &self.secret else {
            return Ok(None);
        };
        let secret_bytes = decode_stored_secret(record)?;
        let code = oath::code(
            &secret_bytes,
            record.digits as u32,
            record.algo,
            moving_factor(record),
        );
        Ok(Some(code))
    }

    /// Checks a candidate against the primary OTP and, on mismatch, the
    /// scratch codes (consuming a matched one per configuration).
    ///
    /// A matched HOTP code advances the stored counter by one; note that
    /// verify-then-advance is not compare-and-swap, so two concurrent valid
    /// attempts against the same secret can both succeed.
    ///
    /// # Errors
    /// Returns an error on storage failure; a wrong code and an unbound
    /// handle both yield `Ok(false)`.
    pub async fn verify(&mut self, code: &str) -> Result<bool> {
        self.check_code(code, true).await
    }

    /// Like [`Otp::verify`] but scratch codes are never accepted, and a
    /// passing primary code confirms the secret. Returns `false` when the
    /// secret is already confirmed.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn confirm(&mut self, code: &str) -> Result<bool> {
        let Some(record) = &self.secret else {
            return Ok(false);
        };
        if record.confirmed {
            return Ok(false);
        }
        let secret_id = record.secret_id;
        if !self.check_code(code, false).await? {
            return Ok(false);
        }
        let confirmed = self.store.confirm_secret(secret_id).await?;
        if confirmed {
            if let Some(bound) = self.secret.as_mut() {
                bound.confirmed = true;
            }
        }
        Ok(confirmed)
    }

    /// Advances the HOTP counter by one; `None` for TOTP secrets or while
    /// unbound.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn increment_counter(&mut self) -> Result<Option<i64>> {
        let Some(secret_id) = self.sid() else {
            return Ok(None);
        };
        let advanced = self.store.advance_counter(secret_id, 1).await?;
        if let (Some(value), Some(bound)) = (advanced, self.secret.as_mut()) {
            bound.counter = value;
        }
        Ok(advanced)
    }

    /// Sets the HOTP counter to an absolute value (>= 1); `None` for TOTP
    /// secrets, out-of-range values, or while unbound.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn update_counter(&mut self, value: i64) -> Result<Option<i64>> {
        let Some(secret_id) = self.sid() else {
            return Ok(None);
        };
        let updated = self.store.set_counter(secret_id, value).await?;
        if let (Some(value), Some(bound)) = (updated, self.secret.as_mut()) {
            bound.counter = value;
        }
        Ok(updated)
    }

    /// Deletes every scratch code of the bound secret. Returns `false`
    /// while unbound.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn invalidate_scratches(&self) -> Result<bool> {
        let Some(secret_id) = self.sid() else {
            return Ok(false);
        };
        self.store.invalidate_scratches(secret_id).await?;
        Ok(true)
    }

    /// Replaces the scratch batch: delete-all then create-new, never a
    /// merge. Returns `false` while unbound.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn regenerate_scratches(&self) -> Result<bool> {
        let Some(secret_id) = self.sid() else {
            return Ok(false);
        };
        self.store.invalidate_scratches(secret_id).await?;
        let codes: Vec<String> = (0..self.config.scratch_count)
            .map(|_| oath::random_digits(SCRATCH_LENGTH))
            .collect();
        self.store.create_scratches(secret_id, &codes).await
    }

    /// Deletes the bound secret (cascading to scratch codes) and returns
    /// the handle to the unbound state.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn forget(&mut self) -> Result<bool> {
        let Some(secret_id) = self.sid() else {
            return Ok(false);
        };
        let deleted = self.store.delete_secret(secret_id).await?;
        self.secret = None;
        Ok(deleted)
    }

    /// Removes every unconfirmed secret older than `timeout` seconds, as
    /// one all-or-nothing sweep. Returns the number of secrets removed.
    ///
    /// # Errors
    /// Returns an error on storage failure; the sweep rolls back entirely.
    pub async fn cleanup_unconfirmed(&self, timeout: u64) -> Result<u64> {
        let cutoff = Utc::now()
            - Duration::seconds(i64::try_from(timeout).context("timeout out of range")?);
        let purged = self.store.purge_unconfirmed_older_than(cutoff).await?;
        if purged > 0 {
            debug!(purged, "removed expired unconfirmed secrets");
        }
        Ok(purged)
    }

    /// Performs the code check shared by `verify` and `confirm`.
    async fn check_code(&mut self, code: &str, accept_scratch: bool) -> Result<bool> {
        let Some(record) = self.secret.clone() else {
            return Ok(false);
        };
        let digits = record.digits as usize;
        // Malformed candidates never reach the HMAC.
        if !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }
        if code.len() != digits && code.len() != SCRATCH_LENGTH {
            return Ok(false);
        }

        if code.len() == digits {
            let secret_bytes = decode_stored_secret(&record)?;
            let matched = oath::verify(
                &secret_bytes,
                record.digits as u32,
                record.algo,
                code,
                moving_factor(&record),
                self.config.slip,
            );
            if matched {
                if record.mode == Mode::Hotp {
                    let advanced = self.store.advance_counter(record.secret_id, 1).await?;
                    if let (Some(value), Some(bound)) = (advanced, self.secret.as_mut()) {
                        bound.counter = value;
                    }
                }
                return Ok(true);
            }
        }

        if accept_scratch && code.len() == SCRATCH_LENGTH {
            return self
                .store
                .consume_scratch(record.secret_id, code, self.config.consume_scratch)
                .await;
        }

        Ok(false)
    }

    /// Runs the cleanup sweep when the trigger fires. Failures here never
    /// fail the `create`/`bind` that rolled the trigger.
    async fn maybe_gc(&self) {
        if !self.config.gc.fires() {
            return;
        }
        if let Err(err) = self.cleanup_unconfirmed(self.config.unconfirmed_timeout).await {
            warn!(error = %err, "unconfirmed secret cleanup failed");
        }
    }
}

/// Current moving factor: time window for TOTP, stored counter for HOTP.
fn moving_factor(record: &SecretRecord) -> u64 {
    match record.mode {
        Mode::Totp => unix_now() / u64::from(record.period.unsigned_abs()),
        Mode::Hotp => record.counter.unsigned_abs(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn decode_stored_secret(record: &SecretRecord) -> Result<Vec<u8>> {
    oath::decode_secret(&record.secret)
        .with_context(|| format!("stored secret {} is not valid Base32", record.secret_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Algo, SecretConfig};
    use crate::store::MemStore;

    fn engine(store: &MemStore, config: OtpConfig) -> Otp {
        Otp::new(Arc::new(store.clone()), config)
    }

    fn quiet_config() -> OtpConfig {
        OtpConfig {
            gc: GcTrigger::Never,
            ..OtpConfig::default()
        }
    }

    fn hotp_config(slip: u32) -> OtpConfig {
        OtpConfig {
            secret: SecretConfig::new(6, Mode::Hotp, Algo::Sha1, 30).unwrap(),
            slip,
            gc: GcTrigger::Never,
            ..OtpConfig::default()
        }
    }

    fn wrong_code(right: &str) -> String {
        if right == "000000" {
            "000001".to_string()
        } else {
            "000000".to_string()
        }
    }

    #[tokio::test]
    async fn unbound_handle_fails_fast() {
        let store = MemStore::new();
        let mut otp = engine(&store, quiet_config());
        assert_eq!(otp.sid(), None);
        assert_eq!(otp.secret_base32(), None);
        assert_eq!(otp.is_confirmed(), None);
        assert_eq!(otp.generate().unwrap(), None);
        assert_eq!(otp.scratches().await.unwrap(), None);
        assert!(!otp.verify("123456").await.unwrap());
        assert!(!otp.confirm("123456").await.unwrap());
        assert!(!otp.forget().await.unwrap());
        assert!(!otp.invalidate_scratches().await.unwrap());
        assert_eq!(otp.increment_counter().await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_yields_immediately_verifiable_secret() {
        let store = MemStore::new();
        let mut otp = engine(&store, quiet_config());
        let sid = otp.create().await.unwrap();
        assert_eq!(otp.sid(), Some(sid));
        assert_eq!(otp.is_confirmed(), Some(false));

        let code = otp.generate().unwrap().unwrap();
        assert_eq!(code.len(), 6);
        assert!(otp.verify(&code).await.unwrap());
        assert!(!otp.verify(&wrong_code(&code)).await.unwrap());
    }

    #[tokio::test]
    async fn bind_finds_existing_secret() {
        let store = MemStore::new();
        let mut creator = engine(&store, quiet_config());
        let sid = creator.create().await.unwrap();
        let secret = creator.secret_base32().unwrap().to_string();

        let mut other = engine(&store, quiet_config());
        assert!(other.bind(sid).await.unwrap());
        assert_eq!(other.secret_base32(), Some(secret.as_str()));
        assert!(!other.bind(Uuid::new_v4()).await.unwrap());
        assert_eq!(other.sid(), None);
    }

    #[tokio::test]
    async fn malformed_candidates_are_rejected_early() {
        let store = MemStore::new();
        let mut otp = engine(&store, quiet_config());
        otp.create().await.unwrap();
        assert!(!otp.verify("12345").await.unwrap());
        assert!(!otp.verify("1234567").await.unwrap());
        assert!(!otp.verify("abcdef").await.unwrap());
        assert!(!otp.verify("12 456").await.unwrap());
        assert!(!otp.verify("").await.unwrap());
    }

    #[tokio::test]
    async fn scratch_codes_are_single_use() {
        let store = MemStore::new();
        let mut otp = engine(&store, quiet_config());
        otp.create().await.unwrap();

        let scratches = otp.scratches().await.unwrap().unwrap();
        assert_eq!(scratches.len(), 5);
        for code in &scratches {
            assert_eq!(code.len(), 8);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }

        let code = scratches[0].clone();
        assert!(otp.verify(&code).await.unwrap());
        let remaining = otp.scratches().await.unwrap().unwrap();
        assert_eq!(remaining.len(), 4);
        assert!(!remaining.contains(&code));
        assert!(!otp.verify(&code).await.unwrap());
    }

    #[tokio::test]
    async fn scratch_codes_survive_when_consumption_disabled() {
        let store = MemStore::new();
        let config = OtpConfig {
            consume_scratch: false,
            ..quiet_config()
        };
        let mut otp = engine(&store, config);
        otp.create().await.unwrap();

        let code = otp.scratches().await.unwrap().unwrap()[0].clone();
        assert!(otp.verify(&code).await.unwrap());
        assert!(otp.verify(&code).await.unwrap());
        assert_eq!(otp.scratches().await.unwrap().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn confirm_succeeds_exactly_once_and_rejects_scratches() {
        let store = MemStore::new();
        let mut otp = engine(&store, quiet_config());
        otp.create().await.unwrap();

        let scratch = otp.scratches().await.unwrap().unwrap()[0].clone();
        assert!(!otp.confirm(&scratch).await.unwrap());
        assert_eq!(otp.is_confirmed(), Some(false));
        // the failed confirmation must not have consumed the scratch code
        assert_eq!(otp.scratches().await.unwrap().unwrap().len(), 5);

        let code = otp.generate().unwrap().unwrap();
        assert!(!otp.confirm(&wrong_code(&code)).await.unwrap());
        assert!(otp.confirm(&code).await.unwrap());
        assert_eq!(otp.is_confirmed(), Some(true));

        let fresh = otp.generate().unwrap().unwrap();
        assert!(!otp.confirm(&fresh).await.unwrap());
        assert_eq!(otp.is_confirmed(), Some(true));
    }

    #[tokio::test]
    async fn hotp_advances_counter_and_blocks_replay_without_slip() {
        let store = MemStore::new();
        let mut otp = engine(&store, hotp_config(0));
        let sid = otp.create().await.unwrap();

        let code = otp.generate().unwrap().unwrap();
        assert!(otp.verify(&code).await.unwrap());
        let record = store.get_secret(sid).await.unwrap().unwrap();
        assert_eq!(record.counter, 2);

        assert!(!otp.verify(&code).await.unwrap());
        let next = otp.generate().unwrap().unwrap();
        assert!(otp.verify(&next).await.unwrap());
    }

    #[tokio::test]
    async fn failed_verification_leaves_the_record_untouched() {
        let store = MemStore::new();
        let mut otp = engine(&store, hotp_config(0));
        let sid = otp.create().await.unwrap();
        let before = store.get_secret(sid).await.unwrap().unwrap();

        let code = otp.generate().unwrap().unwrap();
        assert!(!otp.verify(&wrong_code(&code)).await.unwrap());
        let after = store.get_secret(sid).await.unwrap().unwrap();
        assert_eq!(after.counter, before.counter);
        assert_eq!(after.updated_at, before.updated_at);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(otp.verify(&code).await.unwrap());
        let advanced = store.get_secret(sid).await.unwrap().unwrap();
        assert_eq!(advanced.counter, before.counter + 1);
        assert!(advanced.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn hotp_slip_tolerates_one_missed_window() {
        let store = MemStore::new();
        let mut otp = engine(&store, hotp_config(2));
        otp.create().await.unwrap();

        // simulate the client being one step ahead of the stored counter
        let secret = oath::decode_secret(otp.secret_base32().unwrap()).unwrap();
        let ahead = oath::code(&secret, 6, Algo::Sha1, 2);
        assert!(otp.verify(&ahead).await.unwrap());
    }

    #[tokio::test]
    async fn counter_operations_respect_mode() {
        let store = MemStore::new();
        let mut hotp = engine(&store, hotp_config(0));
        hotp.create().await.unwrap();
        assert_eq!(hotp.increment_counter().await.unwrap(), Some(2));
        assert_eq!(hotp.update_counter(7).await.unwrap(), Some(7));
        assert_eq!(hotp.update_counter(0).await.unwrap(), None);

        let mut totp = engine(&store, quiet_config());
        let sid = totp.create().await.unwrap();
        assert_eq!(totp.increment_counter().await.unwrap(), None);
        assert_eq!(totp.update_counter(5).await.unwrap(), None);
        let record = store.get_secret(sid).await.unwrap().unwrap();
        assert_eq!(record.counter, 1);
    }

    #[tokio::test]
    async fn regenerated_scratches_are_disjoint() {
        let store = MemStore::new();
        let mut otp = engine(&store, quiet_config());
        otp.create().await.unwrap();

        let before = otp.scratches().await.unwrap().unwrap();
        assert!(otp.regenerate_scratches().await.unwrap());
        let after = otp.scratches().await.unwrap().unwrap();
        assert_eq!(after.len(), before.len());
        assert!(after.iter().all(|code| !before.contains(code)));
    }

    #[tokio::test]
    async fn invalidate_scratches_empties_the_batch() {
        let store = MemStore::new();
        let mut otp = engine(&store, quiet_config());
        otp.create().await.unwrap();
        assert!(otp.invalidate_scratches().await.unwrap());
        assert_eq!(otp.scratches().await.unwrap().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn forget_deletes_and_unbinds() {
        let store = MemStore::new();
        let mut otp = engine(&store, quiet_config());
        let sid = otp.create().await.unwrap();
        assert!(otp.forget().await.unwrap());
        assert_eq!(otp.sid(), None);
        assert!(store.get_secret(sid).await.unwrap().is_none());
        assert!(store.scratches_for(sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_unconfirmed_secrets() {
        let store = MemStore::new();

        let mut stale_unconfirmed = engine(&store, quiet_config());
        let stale_unconfirmed_id = stale_unconfirmed.create().await.unwrap();
        let mut stale_confirmed = engine(&store, quiet_config());
        let stale_confirmed_id = stale_confirmed.create().await.unwrap();
        let code = stale_confirmed.generate().unwrap().unwrap();
        assert!(stale_confirmed.confirm(&code).await.unwrap());
        let mut fresh_unconfirmed = engine(&store, quiet_config());
        let fresh_unconfirmed_id = fresh_unconfirmed.create().await.unwrap();

        let long_ago = Utc::now() - Duration::seconds(3600);
        store.backdate_created_at(stale_unconfirmed_id, long_ago).await;
        store.backdate_created_at(stale_confirmed_id, long_ago).await;

        let purged = stale_unconfirmed.cleanup_unconfirmed(900).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_secret(stale_unconfirmed_id).await.unwrap().is_none());
        assert!(store.get_secret(stale_confirmed_id).await.unwrap().is_some());
        assert!(store.get_secret(fresh_unconfirmed_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn forced_gc_sweeps_on_bind() {
        let store = MemStore::new();

        let mut abandoned = engine(&store, quiet_config());
        let abandoned_id = abandoned.create().await.unwrap();
        store
            .backdate_created_at(abandoned_id, Utc::now() - Duration::seconds(3600))
            .await;

        let mut active = engine(&store, quiet_config());
        let active_id = active.create().await.unwrap();

        let config = OtpConfig {
            gc: GcTrigger::Always,
            ..quiet_config()
        };
        let mut binder = engine(&store, config);
        assert!(binder.bind(active_id).await.unwrap());

        assert!(store.get_secret(abandoned_id).await.unwrap().is_none());
        assert!(store.get_secret(active_id).await.unwrap().is_some());
    }

    #[test]
    fn gc_trigger_extremes() {
        assert!(!GcTrigger::Never.fires());
        assert!(GcTrigger::Always.fires());
        assert!(!GcTrigger::Probability(0.0).fires());
        assert!(GcTrigger::Probability(1.0).fires());
    }
}
