//! Distributed lock client over Redis.
//!
//! Named, TTL-bounded locks keyed
//! `"<service>:lock:<resource>"` with all whitespace stripped from the
//! resource id. Acquisition spins while the lock is held elsewhere, up to a
//! blocking timeout; transient Redis errors are retried a bounded number of
//! times before surfacing as a lock-service error.
//!
//! Contention is not an error: it is reported as `Ok(None)` and needs no
//! release. A returned [`AcquiredLock`] must be released on every exit path.

use crate::error::WorkerError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRIES: u32 = 3;

/// Pause between acquisition attempts while the lock is contended.
pub const LOCKED_RETRY_DURATION: Duration = Duration::from_millis(20);

/// Pause between attempts after a lock-service error.
pub const ERR_RETRY_DURATION: Duration = Duration::from_millis(50);

const RELEASE_SCRIPT: &str =
    r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("del", KEYS[1]) else return 0 end"#;

/// Lock acquisition settings.
///
/// `ttl` must be positive; `retries` is the number of whole-acquire attempts
/// on service errors and is at least 1.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Server-side expiry of the lock
    pub ttl: Duration,

    /// Maximum wall-clock spent spinning while the lock is held elsewhere
    pub blocking_timeout: Duration,

    /// Attempts on transient service errors
    pub retries: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            blocking_timeout: DEFAULT_BLOCKING_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }
}

/// Route-level lock settings: where to find the resource id in the payload
/// and whether running without the lock is acceptable.
#[derive(Debug, Clone)]
pub struct RouteLock {
    pub options: LockOptions,

    /// Dotted path to the resource id inside the decoded payload
    pub path_to_id: String,

    /// When true, a missing resource id, a service error, or contention
    /// fails the handler instead of downgrading to an unlocked run
    pub mandatory: bool,
}

impl RouteLock {
    pub fn new(path_to_id: impl Into<String>) -> Self {
        Self {
            options: LockOptions::default(),
            path_to_id: path_to_id.into(),
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }
}

/// Proof of a held lock. Hand it back to [`LockService::release`].
#[derive(Debug)]
pub struct AcquiredLock {
    key: String,
    token: String,
}

impl AcquiredLock {
    pub fn new(key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Seam for the lock service so the handler lifecycle can run against an
/// in-process implementation in tests.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the named lock. `Ok(None)` means the blocking timeout
    /// expired while contention persisted.
    async fn acquire(
        &self,
        resource: &str,
        options: &LockOptions,
    ) -> Result<Option<AcquiredLock>, WorkerError>;

    /// Release a previously acquired lock.
    async fn release(&self, lock: AcquiredLock) -> Result<(), WorkerError>;
}

/// Redis-backed [`LockService`].
pub struct RedisLocker {
    redis: ConnectionManager,
    service_name: String,
    contention_pause: Duration,
}

impl RedisLocker {
    pub fn new(redis: ConnectionManager, service_name: impl Into<String>) -> Self {
        Self {
            redis,
            service_name: service_name.into(),
            contention_pause: LOCKED_RETRY_DURATION,
        }
    }

    /// Override the pause between contended acquisition attempts.
    pub fn with_contention_pause(mut self, pause: Duration) -> Self {
        self.contention_pause = pause;
        self
    }

    /// Wire format of a lock key: whitespace inside the resource id is
    /// stripped entirely.
    pub fn lock_key(service_name: &str, resource: &str) -> String {
        let resource: String = resource.split_whitespace().collect();
        format!("{service_name}:lock:{resource}")
    }

    /// One full acquisition pass: spin on SET NX until acquired or the
    /// blocking timeout expires.
    async fn spin_acquire(
        &self,
        key: &str,
        token: &str,
        options: &LockOptions,
    ) -> Result<bool, redis::RedisError> {
        let ttl_ms = options.ttl.as_millis().max(1) as u64;
        let deadline = Instant::now() + options.blocking_timeout;

        loop {
            let mut conn = self.redis.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;

            if reply.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.contention_pause).await;
        }
    }
}

#[async_trait]
impl LockService for RedisLocker {
    async fn acquire(
        &self,
        resource: &str,
        options: &LockOptions,
    ) -> Result<Option<AcquiredLock>, WorkerError> {
        let key = Self::lock_key(&self.service_name, resource);
        let token = Uuid::new_v4().to_string();
        let attempts = options.retries.max(1);

        let mut last_error = None;
        for attempt in 0..attempts {
            match self.spin_acquire(&key, &token, options).await {
                Ok(true) => {
                    debug!(key = %key, "acquired lock");
                    return Ok(Some(AcquiredLock::new(key, token)));
                }
                Ok(false) => {
                    debug!(key = %key, "lock contended past blocking timeout");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(key = %key, attempt = attempt + 1, error = %e, "lock service error");
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(ERR_RETRY_DURATION).await;
                    }
                }
            }
        }

        Err(WorkerError::LockService(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn release(&self, lock: AcquiredLock) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lock.key)
            .arg(&lock.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| WorkerError::LockService(e.to_string()))?;

        if deleted == 0 {
            return Err(WorkerError::LockService(format!(
                "lock '{}' expired or changed owner before release",
                lock.key
            )));
        }

        debug!(key = %lock.key, "released lock");
        Ok(())
    }
}
