//! # Named Lock Registry
//!
//! In-memory, process-wide mutual exclusion keyed by an arbitrary string
//! ("slug"). Locks expire after a caller-chosen hold time, may be acquired
//! reentrantly by their holder, and are reclaimable when their holder thread
//! dies without releasing ("orphaned").
//!
//! WARNING: these locks live in one process's memory only. If several
//! processes share a resource, this registry will not coordinate them.
//!
//! Hold locks briefly and release via the RAII guard:
//!
//! ```rust
//! use std::time::Duration;
//! use taskmill::lock::LockRegistry;
//!
//! # fn main() -> taskmill::Result<()> {
//! let registry = LockRegistry::new();
//! if let Some(guard) = registry.try_acquire("rebuild:index", Duration::from_secs(5), false)? {
//!     // do the guarded work
//!     drop(guard);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{Result, TaskmillError};

/// Hold time used by [`LockRegistry::force_acquire`].
const FORCE_HOLD: Duration = Duration::from_secs(24 * 60 * 60);

thread_local! {
    // Liveness sentinel: dropped when the owning thread exits, so a lock
    // entry holding a `Weak` to it can tell whether its holder is alive.
    static LIVENESS: Arc<()> = Arc::new(());
}

fn current_thread_sentinel() -> Weak<()> {
    LIVENESS.with(Arc::downgrade)
}

fn current_thread_label() -> String {
    let t = thread::current();
    match t.name() {
        Some(name) => format!("{name}-{:?}", t.id()),
        None => format!("{:?}", t.id()),
    }
}

struct LockEntry {
    epoch: u64,
    holder: ThreadId,
    holder_label: String,
    alive: Weak<()>,
    revoked: Arc<AtomicBool>,
    created_at: Instant,
    expires_at: Instant,
    /// Reentrancy depth beyond the first hold. Normally 0.
    depth: u32,
}

impl LockEntry {
    fn is_orphaned(&self) -> bool {
        self.alive.strong_count() == 0
    }

    fn is_valid(&self) -> bool {
        !self.is_orphaned() && Instant::now() < self.expires_at
    }
}

/// Snapshot of a registered lock, for inspection and diagnostics.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub slug: String,
    pub holder: String,
    pub depth: u32,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub orphaned: bool,
}

struct RegistryInner {
    locks: DashMap<String, LockEntry>,
    epochs: AtomicU64,
    // Signalled on every release or reclaim so blocked acquirers re-check
    // promptly instead of sleeping out their full backoff interval.
    freed: Mutex<()>,
    freed_cv: Condvar,
    config: LockConfig,
}

impl RegistryInner {
    fn notify_freed(&self) {
        self.freed_cv.notify_all();
    }
}

/// A process-wide registry of named, expiring, reentrant locks.
///
/// Cloning is cheap and clones share the same registry. There is no global
/// default instance: construct one and pass it to whoever needs it.
#[derive(Clone)]
pub struct LockRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                locks: DashMap::new(),
                epochs: AtomicU64::new(0),
                freed: Mutex::new(()),
                freed_cv: Condvar::new(),
                config,
            }),
        }
    }

    /// Try to claim `slug`, returning immediately.
    ///
    /// Succeeds when the slug is free, when the current entry is expired or
    /// orphaned (it is reclaimed, with a warning log), or when the calling
    /// thread already holds it and asked for `reentrant` (depth increments,
    /// expiry is left unchanged). Returns `Ok(None)` when another thread
    /// holds it validly.
    ///
    /// A same-thread re-acquire without `reentrant` is treated as a bug in
    /// the caller (usually runaway recursion): the stale lock is
    /// force-released and [`TaskmillError::LockRecursion`] is returned.
    pub fn try_acquire(
        &self,
        slug: &str,
        max_hold: Duration,
        reentrant: bool,
    ) -> Result<Option<LockHandle>> {
        let me = thread::current().id();
        match self.inner.locks.entry(slug.to_string()) {
            Entry::Vacant(vacant) => {
                let (entry, handle) = self.claim(slug, max_hold);
                vacant.insert(entry);
                Ok(Some(handle))
            }
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if !current.is_valid() {
                    warn!(
                        slug,
                        holder = %current.holder_label,
                        orphaned = current.is_orphaned(),
                        "reclaiming dead lock"
                    );
                    let (entry, handle) = self.claim(slug, max_hold);
                    occupied.insert(entry);
                    return Ok(Some(handle));
                }
                if current.holder == me {
                    if reentrant {
                        let current = occupied.get_mut();
                        current.depth += 1;
                        let handle = LockHandle {
                            registry: Arc::clone(&self.inner),
                            slug: slug.to_string(),
                            epoch: current.epoch,
                            revoked: Arc::clone(&current.revoked),
                            expires_at: current.expires_at,
                            released: false,
                        };
                        return Ok(Some(handle));
                    }
                    // Probably an unwanted recursion heading for deadlock.
                    // Clear the lock and surface the bug.
                    occupied.remove();
                    self.inner.notify_freed();
                    return Err(TaskmillError::LockRecursion(slug.to_string()));
                }
                Ok(None)
            }
        }
    }

    /// Like [`Self::try_acquire`] but blocks until the lock is free or
    /// `max_try` elapses.
    ///
    /// Waiters sleep on a condvar signalled by every release, with a wait
    /// timeout that doubles from the configured initial interval up to its
    /// cap, jittered ±50% so contending threads do not phase-lock. There is
    /// no fairness policy: under heavy contention a caller can starve until
    /// its `max_try` runs out.
    pub fn acquire(
        &self,
        slug: &str,
        max_hold: Duration,
        max_try: Duration,
        reentrant: bool,
    ) -> Result<LockHandle> {
        let deadline = Instant::now() + max_try;
        let mut interval = self.inner.config.initial_backoff();
        loop {
            if let Some(handle) = self.try_acquire(slug, max_hold, reentrant)? {
                return Ok(handle);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TaskmillError::LockTimeout(slug.to_string()));
            }
            debug!(
                slug,
                waiter = %current_thread_label(),
                holder = %self.holder_label(slug),
                "waiting on lock"
            );
            let jittered = interval.mul_f64(0.5 + fastrand::f64());
            let wait = jittered.min(deadline.saturating_duration_since(now));
            let mut guard = self.inner.freed.lock();
            self.inner.freed_cv.wait_for(&mut guard, wait);
            drop(guard);
            interval = (interval * 2).min(self.inner.config.max_backoff());
        }
    }

    /// Aggressively take `slug`, revoking the current holder.
    ///
    /// Intended for administrative recovery only. The holder is not stopped
    /// mid-flight; its revocation flag is raised (observable via
    /// [`LockHandle::is_revoked`]) and the registry entry is evicted, so the
    /// old guard's eventual release becomes a no-op.
    pub fn force_acquire(&self, slug: &str) -> Result<LockHandle> {
        loop {
            if let Some(handle) = self.try_acquire(slug, FORCE_HOLD, false)? {
                return Ok(handle);
            }
            let Some(current) = self.inner.locks.get(slug) else {
                continue;
            };
            let epoch = current.epoch;
            warn!(slug, holder = %current.holder_label, "force acquire: revoking holder");
            current.revoked.store(true, Ordering::Release);
            drop(current);
            self.inner.locks.remove_if(slug, |_, e| e.epoch == epoch);
            self.inner.notify_freed();
        }
    }

    /// Snapshot the lock registered for `slug`, if any.
    pub fn examine(&self, slug: &str) -> Option<LockInfo> {
        self.inner.locks.get(slug).map(|e| LockInfo {
            slug: slug.to_string(),
            holder: e.holder_label.clone(),
            depth: e.depth,
            created_at: e.created_at,
            expires_at: e.expires_at,
            orphaned: e.is_orphaned(),
        })
    }

    /// Human-readable label of the current holder, or `"nobody"`.
    pub fn holder_label(&self, slug: &str) -> String {
        self.inner
            .locks
            .get(slug)
            .map(|e| e.holder_label.clone())
            .unwrap_or_else(|| "nobody".to_string())
    }

    /// Does the calling thread hold a valid lock on `slug`?
    pub fn held_by_current_thread(&self, slug: &str) -> bool {
        self.inner
            .locks
            .get(slug)
            .map(|e| e.holder == thread::current().id() && e.is_valid())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.locks.is_empty()
    }

    /// Drop every lock. Test support; obvious reasons not to use otherwise.
    pub fn clear(&self) {
        self.inner.locks.clear();
        self.inner.notify_freed();
    }

    fn claim(&self, slug: &str, max_hold: Duration) -> (LockEntry, LockHandle) {
        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
        let revoked = Arc::new(AtomicBool::new(false));
        let now = Instant::now();
        let expires_at = now + max_hold;
        let entry = LockEntry {
            epoch,
            holder: thread::current().id(),
            holder_label: current_thread_label(),
            alive: current_thread_sentinel(),
            revoked: Arc::clone(&revoked),
            created_at: now,
            expires_at,
            depth: 0,
        };
        let handle = LockHandle {
            registry: Arc::clone(&self.inner),
            slug: slug.to_string(),
            epoch,
            revoked,
            expires_at,
            released: false,
        };
        (entry, handle)
    }
}

/// RAII guard for a held lock. Dropping it releases one level of the hold;
/// at depth zero the slug becomes free.
pub struct LockHandle {
    registry: Arc<RegistryInner>,
    slug: String,
    epoch: u64,
    revoked: Arc<AtomicBool>,
    expires_at: Instant,
    released: bool,
}

impl LockHandle {
    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// True once [`LockRegistry::force_acquire`] has taken this lock away.
    /// Holders doing long work should check this and back out.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let Some(mut entry) = self.registry.locks.get_mut(&self.slug) else {
                return;
            };
            if entry.epoch != self.epoch {
                // Someone reclaimed this slug already (expiry, orphan
                // healing, or a force acquire); nothing left to release.
                return;
            }
            if entry.depth > 0 {
                entry.depth -= 1;
                return;
            }
        }
        // Depth zero: compare-and-remove so we never delete a successor's
        // entry out from under it.
        self.registry
            .locks
            .remove_if(&self.slug, |_, e| e.epoch == self.epoch);
        self.registry.notify_freed();
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("slug", &self.slug)
            .field("epoch", &self.epoch)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_secs(5);

    #[test]
    fn test_basic_acquire_release() {
        let registry = LockRegistry::new();
        let guard = registry.try_acquire("a", HOLD, false).unwrap().unwrap();
        assert!(registry.held_by_current_thread("a"));
        assert_eq!(registry.len(), 1);
        drop(guard);
        assert!(!registry.held_by_current_thread("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_thread_nonreentrant_is_an_error() {
        let registry = LockRegistry::new();
        let _guard = registry.try_acquire("a", HOLD, false).unwrap().unwrap();
        let err = registry.try_acquire("a", HOLD, false).unwrap_err();
        assert!(matches!(err, TaskmillError::LockRecursion(_)));
        // the buggy lock was force-released
        assert!(!registry.held_by_current_thread("a"));
    }

    #[test]
    fn test_reentrant_depth() {
        let registry = LockRegistry::new();
        let g1 = registry.try_acquire("a", HOLD, true).unwrap().unwrap();
        let g2 = registry.try_acquire("a", HOLD, true).unwrap().unwrap();
        let g3 = registry.try_acquire("a", HOLD, true).unwrap().unwrap();
        assert_eq!(registry.examine("a").unwrap().depth, 2);
        drop(g3);
        drop(g2);
        assert!(registry.held_by_current_thread("a"));
        drop(g1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expired_lock_is_reclaimed() {
        let registry = LockRegistry::new();
        let _stale = registry
            .try_acquire("a", Duration::from_millis(20), false)
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // reentrant=false + same thread would normally error, but the lock
        // is expired so it is reclaimed instead
        let fresh = registry.try_acquire("a", HOLD, false).unwrap();
        assert!(fresh.is_some());
    }

    #[test]
    fn test_examine_and_holder_label() {
        let registry = LockRegistry::new();
        assert_eq!(registry.holder_label("a"), "nobody");
        let _guard = registry.try_acquire("a", HOLD, false).unwrap().unwrap();
        let info = registry.examine("a").unwrap();
        assert_eq!(info.slug, "a");
        assert_eq!(info.depth, 0);
        assert!(!info.orphaned);
    }
}
