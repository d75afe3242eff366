//! One-time password secret lifecycle and verification engine.
//!
//! Issues and verifies OTPs bound to a per-user secret, in time-based
//! (TOTP) or counter-based (HOTP) mode, with a pool of single-use numeric
//! scratch recovery codes. The [`Otp`] engine binds one secret at a time
//! and drives verification with configurable slip tolerance, one-time
//! scratch-code consumption, HOTP counter advancement, and probabilistic
//! collection of abandoned unconfirmed secrets.
//!
//! Persistence sits behind the [`store::OtpStore`] trait; [`store::PgStore`]
//! is the Postgres implementation (`db/schema.sql`), [`store::MemStore`] an
//! in-memory one for tests and single-process embedders.
//!
//! ```no_run
//! use std::sync::Arc;
//! use otputil::{Otp, OtpConfig, store::MemStore};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = Arc::new(MemStore::new());
//! let mut otp = Otp::new(store, OtpConfig::default());
//! let sid = otp.create().await?;
//! let code = otp.generate()?.expect("bound");
//! assert!(otp.confirm(&code).await?);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod models;
pub mod oath;
pub mod store;

pub use engine::{GcTrigger, Otp, OtpConfig, DEFAULT_GC_PROBABILITY, DEFAULT_SLIP, DEFAULT_TIMEOUT};
pub use error::ValidationError;
pub use models::{Algo, Mode, ScratchCode, SecretConfig, SecretRecord};
