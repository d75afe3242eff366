//! Postgres-backed store.
//!
//! Multi-row mutations run inside explicit transactions; policy rejections
//! (already confirmed, wrong mode) are expressed as guarded UPDATEs whose
//! zero-rows-affected outcome maps to a boolean, never an error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{NewSecret, ScratchCode, SecretRecord};
use crate::store::OtpStore;

/// Schema for the two tables this store owns, see `db/schema.sql`.
pub const SCHEMA: &str = include_str!("../../db/schema.sql");

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies `db/schema.sql`. Idempotent, meant for embedders that do not
    /// run their own migrations.
    ///
    /// # Errors
    /// Returns an error if schema execution fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply otputil schema")?;
        Ok(())
    }
}

#[async_trait]
impl OtpStore for PgStore {
    async fn create_secret(
        &self,
        new: NewSecret,
        scratch_codes: &[String],
    ) -> Result<SecretRecord> {
        let secret_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO otp_secrets (secret_id, secret, digits, mode, algo, period)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(secret_id)
        .bind(&new.secret)
        .bind(i16::try_from(new.config.digits()).context("digits out of range")?)
        .bind(new.config.mode().as_str())
        .bind(new.config.algo().as_str())
        .bind(i16::try_from(new.config.period()).context("period out of range")?)
        .execute(&mut *tx)
        .await
        .context("failed to insert secret")?;

        for code in scratch_codes {
            sqlx::query(
                r"
                INSERT INTO otp_scratch_codes (scratch_id, secret_id, code)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(Uuid::new_v4())
            .bind(secret_id)
            .bind(code)
            .execute(&mut *tx)
            .await
            .context("failed to insert scratch code")?;
        }

        let record = sqlx::query_as::<_, SecretRecord>(
            "SELECT * FROM otp_secrets WHERE secret_id = $1",
        )
        .bind(secret_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to read back secret")?;

        tx.commit().await?;
        Ok(record)
    }

    async fn get_secret(&self, secret_id: Uuid) -> Result<Option<SecretRecord>> {
        sqlx::query_as::<_, SecretRecord>("SELECT * FROM otp_secrets WHERE secret_id = $1")
            .bind(secret_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch secret")
    }

    async fn confirm_secret(&self, secret_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE otp_secrets
            SET confirmed = TRUE, updated_at = NOW()
            WHERE secret_id = $1 AND confirmed = FALSE
            ",
        )
        .bind(secret_id)
        .execute(&self.pool)
        .await
        .context("failed to confirm secret")?;
        Ok(result.rows_affected() == 1)
    }

    async fn advance_counter(&self, secret_id: Uuid, delta: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            r"
            UPDATE otp_secrets
            SET counter = counter + $2, updated_at = NOW()
            WHERE secret_id = $1 AND mode = 'hotp'
            RETURNING counter
            ",
        )
        .bind(secret_id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await
        .context("failed to advance counter")?;
        Ok(row.map(|row| row.get("counter")))
    }

    async fn set_counter(&self, secret_id: Uuid, value: i64) -> Result<Option<i64>> {
        if value < 1 {
            return Ok(None);
        }
        let row = sqlx::query(
            r"
            UPDATE otp_secrets
            SET counter = $2, updated_at = NOW()
            WHERE secret_id = $1 AND mode = 'hotp'
            RETURNING counter
            ",
        )
        .bind(secret_id)
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .context("failed to set counter")?;
        Ok(row.map(|row| row.get("counter")))
    }

    async fn delete_secret(&self, secret_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM otp_scratch_codes WHERE secret_id = $1")
            .bind(secret_id)
            .execute(&mut *tx)
            .await
            .context("failed to delete scratch codes")?;

        let result = sqlx::query("DELETE FROM otp_secrets WHERE secret_id = $1")
            .bind(secret_id)
            .execute(&mut *tx)
            .await
            .context("failed to delete secret")?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_unconfirmed_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r"
            SELECT secret_id FROM otp_secrets
            WHERE confirmed = FALSE AND created_at < $1
            ",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to list unconfirmed secrets")?;
        Ok(rows.into_iter().map(|row| row.get("secret_id")).collect())
    }

    async fn purge_unconfirmed_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            DELETE FROM otp_scratch_codes
            WHERE secret_id IN (
                SELECT secret_id FROM otp_secrets
                WHERE confirmed = FALSE AND created_at < $1
            )
            ",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .context("failed to purge scratch codes")?;

        let result = sqlx::query(
            r"
            DELETE FROM otp_secrets
            WHERE confirmed = FALSE AND created_at < $1
            ",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .context("failed to purge unconfirmed secrets")?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn create_scratches(&self, secret_id: Uuid, codes: &[String]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM otp_secrets WHERE secret_id = $1")
            .bind(secret_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to check secret existence")?
            .is_some();
        if !exists {
            return Ok(false);
        }

        for code in codes {
            sqlx::query(
                r"
                INSERT INTO otp_scratch_codes (scratch_id, secret_id, code)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(Uuid::new_v4())
            .bind(secret_id)
            .bind(code)
            .execute(&mut *tx)
            .await
            .context("failed to insert scratch code")?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn scratches_for(&self, secret_id: Uuid) -> Result<Vec<ScratchCode>> {
        sqlx::query_as::<_, ScratchCode>(
            "SELECT scratch_id, secret_id, code FROM otp_scratch_codes WHERE secret_id = $1",
        )
        .bind(secret_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list scratch codes")
    }

    async fn consume_scratch(&self, secret_id: Uuid, code: &str, consume: bool) -> Result<bool> {
        if !consume {
            let row = sqlx::query(
                r"
                SELECT 1 FROM otp_scratch_codes
                WHERE secret_id = $1 AND code = $2
                LIMIT 1
                ",
            )
            .bind(secret_id)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("failed to check scratch code")?;
            return Ok(row.is_some());
        }

        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query(
            r"
            SELECT scratch_id FROM otp_scratch_codes
            WHERE secret_id = $1 AND code = $2
            LIMIT 1
            ",
        )
        .bind(secret_id)
        .bind(code)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to look up scratch code")?
        else {
            return Ok(false);
        };

        let scratch_id: Uuid = row.get("scratch_id");
        sqlx::query("DELETE FROM otp_scratch_codes WHERE scratch_id = $1")
            .bind(scratch_id)
            .execute(&mut *tx)
            .await
            .context("failed to consume scratch code")?;

        tx.commit().await?;
        Ok(true)
    }

    async fn invalidate_scratches(&self, secret_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM otp_scratch_codes WHERE secret_id = $1")
            .bind(secret_id)
            .execute(&self.pool)
            .await
            .context("failed to invalidate scratch codes")?;
        Ok(())
    }
}
