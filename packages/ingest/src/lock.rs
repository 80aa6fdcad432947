// ABOUTME: Owner-token locks that serialize ingestion per sandbox across workers and processes
// ABOUTME: SQLite backend for shared deployments, in-memory backend for tests and single processes

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use superagent_core::{generate_owner_token, RetryPolicy, Sleeper};

use crate::error::Result;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take `key` for `owner_token` unless someone else holds an unexpired lease
    async fn acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool>;

    /// Drop `key` only if it is still held by `owner_token`
    async fn release(&self, key: &str, owner_token: &str) -> Result<bool>;
}

// ============================================================================
// SQLITE BACKEND
// ============================================================================

pub struct SqliteLock {
    pool: SqlitePool,
}

impl SqliteLock {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for SqliteLock {
    async fn acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);

        let result = sqlx::query(
            r#"
            INSERT INTO sandbox_locks (lock_key, owner_token, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(lock_key) DO UPDATE SET
                owner_token = excluded.owner_token,
                expires_at = excluded.expires_at
            WHERE sandbox_locks.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(owner_token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sandbox_locks WHERE lock_key = ?1 AND owner_token = ?2")
            .bind(key)
            .bind(owner_token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

#[derive(Default)]
pub struct MemoryLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, ignoring expired leases
    pub async fn holder(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some((_, expires)) = leases.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }

        leases.insert(key.to_string(), (owner_token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some((owner, _)) if owner == owner_token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// LEASES
// ============================================================================

/// A held lock. Release explicitly with [`LockLease::release`]; a lease dropped without
/// release (early return, panic unwinding) releases itself in a background task.
pub struct LockLease {
    lock: Arc<dyn DistributedLock>,
    key: String,
    owner_token: String,
    released: bool,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// Release the lock. Failures are logged; the lease expires on its own regardless.
    pub async fn release(mut self) -> bool {
        self.released = true;
        release_logged(self.lock.as_ref(), &self.key, &self.owner_token).await
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);
        let owner_token = std::mem::take(&mut self.owner_token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_logged(lock.as_ref(), &key, &owner_token).await;
                });
            }
            Err(_) => warn!(lock_key = %key, "Lock lease dropped outside a runtime; left to expire"),
        }
    }
}

async fn release_logged(lock: &dyn DistributedLock, key: &str, owner_token: &str) -> bool {
    match lock.release(key, owner_token).await {
        Ok(true) => {
            debug!(lock_key = %key, "Lock released");
            true
        }
        Ok(false) => {
            warn!(lock_key = %key, "Lock was no longer held by this owner");
            false
        }
        Err(e) => {
            error!(lock_key = %key, error = %e, "Failed to release lock");
            false
        }
    }
}

/// Try to take `key` under a fresh owner token, backing off per `policy`.
///
/// Backend errors count as failed attempts. Returns `None` when every attempt failed.
pub async fn acquire_with_retry(
    lock: Arc<dyn DistributedLock>,
    key: &str,
    ttl: Duration,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
) -> Option<LockLease> {
    let owner_token = generate_owner_token();

    let acquired = policy
        .retry_until(sleeper, |attempt| {
            let lock = lock.clone();
            let owner_token = owner_token.clone();
            async move {
                match lock.acquire(key, &owner_token, ttl).await {
                    Ok(true) => true,
                    Ok(false) => {
                        debug!(lock_key = %key, attempt, "Lock busy");
                        false
                    }
                    Err(e) => {
                        warn!(lock_key = %key, attempt, error = %e, "Lock acquire failed");
                        false
                    }
                }
            }
        })
        .await;

    acquired.then(|| LockLease {
        lock,
        key: key.to_string(),
        owner_token,
        released: false,
    })
}
