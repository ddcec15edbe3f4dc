//! Advisory task locks for team mode.
//!
//! Solo and p2p modes run with [`NoopLocker`]; nothing is acquired and
//! nothing can go stale. Team mode layers TTL-based advisory locks over the
//! PID guard. When the team server is unreachable the composite locker
//! falls back to the file locker and stays there for the rest of the task
//! (the fallback is sticky; there is no mid-task promotion back).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {0} is held by {1}")]
    Held(String, String),

    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

// ---------------------------------------------------------------------------
// Lock types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryLock {
    pub key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ttl_secs: i64,
}

impl AdvisoryLock {
    /// A lock whose last heartbeat is older than its TTL is stale and may be
    /// taken over.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > Duration::seconds(self.ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Locker trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Locker: Send + Sync {
    async fn acquire(&self, key: &str, owner: &str, ttl_secs: i64) -> Result<()>;
    async fn heartbeat(&self, key: &str, owner: &str) -> Result<()>;
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// NoopLocker
// ---------------------------------------------------------------------------

/// Default locker: every operation succeeds without doing anything.
pub struct NoopLocker;

#[async_trait]
impl Locker for NoopLocker {
    async fn acquire(&self, _key: &str, _owner: &str, _ttl_secs: i64) -> Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _key: &str, _owner: &str) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _key: &str, _owner: &str) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileLocker
// ---------------------------------------------------------------------------

/// File-based locker under `.orc/locks/<key>.json`.
///
/// Used directly in tests and as the fallback side of [`CompositeLocker`].
pub struct FileLocker {
    dir: PathBuf,
}

impl FileLocker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn read(&self, key: &str) -> Option<AdvisoryLock> {
        let content = std::fs::read_to_string(self.lock_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write(&self, lock: &AdvisoryLock) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(lock).expect("lock serializes");
        std::fs::write(self.lock_path(&lock.key), json)?;
        Ok(())
    }
}

#[async_trait]
impl Locker for FileLocker {
    async fn acquire(&self, key: &str, owner: &str, ttl_secs: i64) -> Result<()> {
        let now = Utc::now();
        if let Some(existing) = self.read(key) {
            if existing.owner != owner && !existing.is_stale(now) {
                return Err(LockError::Held(key.to_string(), existing.owner));
            }
            if existing.is_stale(now) {
                tracing::info!(key = %key, owner = %existing.owner, "taking over stale lock");
            }
        }
        self.write(&AdvisoryLock {
            key: key.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            last_heartbeat: now,
            ttl_secs,
        })
    }

    async fn heartbeat(&self, key: &str, owner: &str) -> Result<()> {
        match self.read(key) {
            Some(mut lock) if lock.owner == owner => {
                lock.last_heartbeat = Utc::now();
                self.write(&lock)
            }
            Some(lock) => Err(LockError::Held(key.to_string(), lock.owner)),
            None => Err(LockError::Unavailable(format!("lock {key} vanished"))),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        if let Some(lock) = self.read(key) {
            if lock.owner == owner {
                let _ = std::fs::remove_file(self.lock_path(key));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CompositeLocker
// ---------------------------------------------------------------------------

/// Primary locker with a sticky file-based fallback.
///
/// On the first `Unavailable` from the primary, all subsequent operations go
/// to the fallback until this locker is dropped at task end.
pub struct CompositeLocker {
    primary: Box<dyn Locker>,
    fallback: FileLocker,
    fellback: AtomicBool,
}

impl CompositeLocker {
    pub fn new(primary: Box<dyn Locker>, fallback: FileLocker) -> Self {
        Self {
            primary,
            fallback,
            fellback: AtomicBool::new(false),
        }
    }

    pub fn is_using_fallback(&self) -> bool {
        self.fellback.load(Ordering::Relaxed)
    }

    fn fall_back(&self, reason: &str) {
        tracing::warn!(%reason, "lock backend unavailable; falling back to file locks");
        self.fellback.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Locker for CompositeLocker {
    async fn acquire(&self, key: &str, owner: &str, ttl_secs: i64) -> Result<()> {
        if !self.is_using_fallback() {
            match self.primary.acquire(key, owner, ttl_secs).await {
                Err(LockError::Unavailable(reason)) => self.fall_back(&reason),
                other => return other,
            }
        }
        self.fallback.acquire(key, owner, ttl_secs).await
    }

    async fn heartbeat(&self, key: &str, owner: &str) -> Result<()> {
        if !self.is_using_fallback() {
            match self.primary.heartbeat(key, owner).await {
                Err(LockError::Unavailable(reason)) => self.fall_back(&reason),
                other => return other,
            }
        }
        self.fallback.heartbeat(key, owner).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        if !self.is_using_fallback() {
            match self.primary.release(key, owner).await {
                Err(LockError::Unavailable(reason)) => self.fall_back(&reason),
                other => return other,
            }
        }
        self.fallback.release(key, owner).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
