//! A distributed locking crate built on Redis and key expiry.
//!
//! A [`Lock`] names a critical section shared across processes. Acquiring it
//! atomically creates a `name -> token` record with a TTL and polls until the
//! record is won or a deadline passes; releasing deletes the record only
//! while it still carries the holder's token. If a holder dies mid-section,
//! the TTL reclaims the lock. [`Lock::with`] wraps a caller-provided action
//! with the whole protocol.
//!
//! ```no_run
//! use latchkey::{Lock, RedisBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(RedisBackend::new("redis://127.0.0.1/")?);
//!     let lock = Lock::builder()
//!         .name("job-42".to_string())
//!         .backend(backend)
//!         .build();
//!
//!     lock.with(async || {
//!         // critical section
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

mod backend;
mod error;

pub use backend::{Backend, Connection, MemoryBackend, RedisBackend};
pub use error::Error;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::*;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

/// How long a record survives without intervention.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(10);
/// Max total wait for an acquisition before it fails.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(20_000);
/// Fixed delay between acquisition retries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// A named mutual-exclusion region backed by a shared key-value store.
///
/// Two instances with the same name contend for the same critical section,
/// whichever process or machine they live in. An instance holds no state
/// across calls beyond its backend handle; it can be used concurrently from
/// many tasks, each call minting its own holder token.
pub struct Lock {
    name: String,
    backend: Arc<dyn Backend>,
    expiry: Duration,
    acquire_timeout: Duration,
    poll_interval: Duration,
}

impl Lock {
    pub fn builder() -> LockBuilder {
        LockBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the lock on `conn`, writing `token` as the holder value.
    ///
    /// Polls the store every `poll_interval` until the record is created or
    /// `acquire_timeout` has elapsed since the call began, then fails with
    /// [`Error::AcquireTimeout`]. The store's conditional set is the sole
    /// serialization point: exactly one concurrent attempt wins per record
    /// lifetime, with no fairness among the rest. A store error aborts the
    /// loop immediately as [`Error::Backend`].
    ///
    /// `token` must be unique to this acquisition attempt; [`Lock::with`]
    /// mints one per call.
    pub async fn acquire(&self, conn: &mut dyn Connection, token: &str) -> Result<(), Error> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;

        loop {
            if conn.set_if_absent(&self.name, token, self.expiry).await? {
                debug!("lock `{}` acquired by {token}", self.name);
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(Error::AcquireTimeout {
                    name: self.name.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            debug!(
                "lock `{}` held elsewhere, next attempt in {:?}",
                self.name, self.poll_interval
            );
            sleep(self.poll_interval).await;
        }
    }

    /// Deletes the lock record only while it still carries `token`.
    ///
    /// Returns whether a record was deleted. A record owned by a different
    /// token, or one already expired, is left alone and reported as `false`;
    /// neither case is an error.
    pub async fn release(&self, conn: &mut dyn Connection, token: &str) -> Result<bool, Error> {
        Ok(conn.compare_and_delete(&self.name, token).await?)
    }

    /// Runs `action` with the lock held.
    ///
    /// A fresh connection and a fresh holder token are scoped to this call.
    /// The action never runs without the lock: an acquisition failure
    /// propagates before it starts. Once the action finishes, by returning
    /// or by panicking, release is attempted and the connection dropped;
    /// a panic is then resumed, and anything else the action produced is
    /// returned verbatim. The release outcome itself is not surfaced, since
    /// a record that is already gone has been reclaimed by expiry.
    ///
    /// Dropping the returned future mid-action skips the release; the
    /// record then dies by TTL.
    pub async fn with<R>(&self, action: impl AsyncFnOnce() -> R) -> Result<R, Error> {
        let mut conn = self.backend.connect().await?;
        let token = Uuid::new_v4().to_string();
        self.acquire(conn.as_mut(), &token).await?;

        let result = AssertUnwindSafe(action()).catch_unwind().await;

        match self.release(conn.as_mut(), &token).await {
            Ok(true) => debug!("lock `{}` released by {token}", self.name),
            Ok(false) => debug!("lock `{}` was already gone at release", self.name),
            Err(e) => warn!("releasing lock `{}` failed: {e}", self.name),
        }

        match result {
            Ok(out) => Ok(out),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

#[derive(Default)]
pub struct LockBuilder {
    name: String,
    backend: Option<Arc<dyn Backend>>,
    expiry: Option<Duration>,
    acquire_timeout: Option<Duration>,
    poll_interval: Option<Duration>,
}

impl LockBuilder {
    pub fn new() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn name(mut self, name: String) -> LockBuilder {
        self.name = name;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> LockBuilder {
        self.backend = Some(backend);
        self
    }

    pub fn expiry(mut self, expiry: Duration) -> LockBuilder {
        self.expiry = Some(expiry);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> LockBuilder {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> LockBuilder {
        self.poll_interval = Some(interval);
        self
    }

    /// Panics if no backend was supplied.
    pub fn build(self) -> Lock {
        Lock {
            name: self.name,
            backend: self.backend.expect("a backend is required"),
            expiry: self.expiry.unwrap_or(DEFAULT_EXPIRY),
            acquire_timeout: self.acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
            poll_interval: self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
        }
    }
}
