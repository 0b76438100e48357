//! Distributed locks over the command channel.
//!
//! `lock` and `unlock` are ordinary executor-backed actions, so a lock call
//! waits its turn behind any command already in flight. Contention is
//! reported by the service as an "Exceeded N attempts to lock the resource"
//! failure and surfaced as-is; see [`CacheError::is_lock_contention`].

use crate::client::{CacheClient, PendingReply};
use crate::{CacheError, CacheResult};
use cache_protocol_types::{actions, Value};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct LockState {
    expires_at: Mutex<Instant>,
    released: AtomicBool,
}

/// An acquired lock.
///
/// The expiry tracked here is local: it counts from when `lock` (or the
/// latest `extend`) was called, which is never later than the service
/// started its own TTL, so it never outlives the lock on the service.
#[derive(Debug, Clone)]
pub struct LockHandle {
    key: String,
    token: Value,
    ttl: Duration,
    state: Arc<LockState>,
}

impl LockHandle {
    fn new(key: String, token: Value, ttl: Duration, requested_at: Instant) -> Self {
        Self {
            key,
            token,
            ttl,
            state: Arc::new(LockState {
                expires_at: Mutex::new(requested_at + ttl),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque token issued by the service.
    pub fn token(&self) -> &Value {
        &self.token
    }

    /// TTL requested when the lock was acquired.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self) -> Instant {
        *self.state.expires_at.lock()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::Acquire)
    }

    fn check_live(&self) -> CacheResult<()> {
        if self.is_released() {
            return Err(CacheError::LockReleased {
                key: self.key.clone(),
            });
        }
        if self.is_expired() {
            return Err(CacheError::LockExpired {
                key: self.key.clone(),
            });
        }
        Ok(())
    }
}

/// Result of [`CacheClient::unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// The service released the lock.
    Released,
    /// The TTL had already elapsed; nothing was sent.
    Expired,
}

impl CacheClient {
    /// Acquire `key` for `ttl`.
    pub fn lock(&self, key: &str, ttl: Duration) -> PendingReply<LockHandle> {
        let owned_key = key.to_string();
        let requested_at = Instant::now();
        self.submit_map(
            actions::LOCK,
            vec![key.into(), ttl_millis(ttl)],
            move |token| {
                if token.is_nil() {
                    return Err(CacheError::UnexpectedReply(format!(
                        "lock on \"{}\" returned no token",
                        owned_key
                    )));
                }
                debug!(key = %owned_key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
                Ok(LockHandle::new(owned_key, token, ttl, requested_at))
            },
        )
    }

    /// Push the expiry of a held lock to `ttl` from now. Fails without
    /// contacting the service if the handle is stale.
    pub fn extend(&self, handle: &LockHandle, ttl: Duration) -> PendingReply<()> {
        if let Err(e) = handle.check_live() {
            return PendingReply::ready(Err(e));
        }
        let state = handle.state.clone();
        let key = handle.key.clone();
        let requested_at = Instant::now();
        self.submit_map(
            actions::EXTEND,
            vec![handle.token.clone(), ttl_millis(ttl)],
            move |_| {
                *state.expires_at.lock() = requested_at + ttl;
                debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock extended");
                Ok(())
            },
        )
    }

    /// Release a lock. An expired handle resolves to
    /// [`UnlockOutcome::Expired`] without a round trip; a handle that was
    /// already released is an error. A failed unlock leaves the handle
    /// live, so it can be retried.
    pub fn unlock(&self, handle: &LockHandle) -> PendingReply<UnlockOutcome> {
        if handle.is_released() {
            return PendingReply::ready(Err(CacheError::LockReleased {
                key: handle.key.clone(),
            }));
        }
        if handle.is_expired() {
            debug!(key = %handle.key, "Unlock after expiry is a no-op");
            return PendingReply::ready(Ok(UnlockOutcome::Expired));
        }
        let state = handle.state.clone();
        let key = handle.key.clone();
        self.submit_map(actions::UNLOCK, vec![handle.token.clone()], move |_| {
            state.released.store(true, Ordering::Release);
            debug!(key = %key, "Lock released");
            Ok(UnlockOutcome::Released)
        })
    }
}

fn ttl_millis(ttl: Duration) -> Value {
    Value::from(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
}
