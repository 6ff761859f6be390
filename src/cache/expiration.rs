//! Expiration policy types
//!
//! An [`ExpirationPolicy`] describes how long an entry may live and what
//! happens when it goes: sliding and absolute expiration (both may apply, the
//! nearer deadline wins), a [`CachePriority`] for capacity compaction, an
//! optional [`ChangeToken`] dependency, and caller state handed back with the
//! [`EvictionNotification`].

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Type-erased value, used for eviction state and by the shared cache.
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// Per-entry eviction callback
pub type EvictionCallback<K, V> = Arc<dyn Fn(&EvictionNotification<K, V>) + Send + Sync>;

/// Order in which compaction removes entries (lowest first)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
    /// Survives compaction and capacity eviction, but not expiration,
    /// removal or `clear`
    NeverRemove,
}

/// Sliding and/or absolute expiration. Neither set means never expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expiration {
    /// Expire after this long without access
    pub sliding: Option<Duration>,
    /// Expire at this wall-clock instant regardless of access
    pub absolute: Option<DateTime<Utc>>,
}

impl Expiration {
    pub fn never() -> Self {
        Self::default()
    }

    pub fn sliding(idle: Duration) -> Self {
        Self {
            sliding: Some(idle),
            absolute: None,
        }
    }

    pub fn absolute_at(at: DateTime<Utc>) -> Self {
        Self {
            sliding: None,
            absolute: Some(at),
        }
    }

    /// Absolute expiration `ttl` from now. A `ttl` too large to represent
    /// never expires.
    pub fn absolute_in(ttl: Duration) -> Self {
        let at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        Self {
            sliding: None,
            absolute: at,
        }
    }

    /// Add a sliding window to this expiration.
    pub fn with_sliding(mut self, idle: Duration) -> Self {
        self.sliding = Some(idle);
        self
    }

    /// Add an absolute deadline to this expiration.
    pub fn with_absolute(mut self, at: DateTime<Utc>) -> Self {
        self.absolute = Some(at);
        self
    }

    pub fn is_sliding(&self) -> bool {
        self.sliding.is_some()
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute.is_some()
    }

    pub fn never_expires(&self) -> bool {
        !self.is_sliding() && !self.is_absolute()
    }

    /// Monotonic deadline for the absolute part. Instants already in the
    /// past map to `now`.
    pub(crate) fn absolute_deadline(&self, now: Instant) -> Option<Instant> {
        self.absolute.map(|at| {
            let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            now + remaining
        })
    }
}

/// Dependency token. Signalling it invalidates every entry that depends on
/// it; such entries are evicted with [`EvictionReason::Depended`] on their
/// next access or expiration scan.
#[derive(Debug, Clone, Default)]
pub struct ChangeToken {
    changed: Arc<AtomicBool>,
}

impl ChangeToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.changed.store(true, Ordering::Release);
    }

    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }
}

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// The store gave no recognizable reason
    None,
    Removed,
    Expired,
    /// Removed to bring the store back under capacity
    Overfull,
    Replaced,
    /// A dependency token was signalled
    Depended,
}

/// Delivered once per destroyed entry that carried a policy
pub struct EvictionNotification<K, V> {
    pub key: K,
    pub value: V,
    pub reason: EvictionReason,
    /// State supplied with the policy
    pub state: Option<SharedValue>,
}

impl<K, V> EvictionNotification<K, V> {
    /// Borrow the policy state as a concrete type.
    pub fn state_as<S: Any>(&self) -> Option<&S> {
        self.state.as_deref().and_then(|state| state.downcast_ref())
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for EvictionNotification<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionNotification")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("reason", &self.reason)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

/// How an entry expires and who hears about it.
///
/// ```rust,ignore
/// let policy = ExpirationPolicy::sliding(Duration::from_secs(300))
///     .with_priority(CachePriority::High)
///     .with_state(session_id)
///     .on_evicted(|n| debug!(reason = ?n.reason, "Session dropped"));
/// ```
pub struct ExpirationPolicy<K, V> {
    pub expiration: Expiration,
    pub priority: CachePriority,
    pub dependency: Option<ChangeToken>,
    pub state: Option<SharedValue>,
    pub callback: Option<EvictionCallback<K, V>>,
}

impl<K, V> Default for ExpirationPolicy<K, V> {
    fn default() -> Self {
        Self {
            expiration: Expiration::never(),
            priority: CachePriority::Normal,
            dependency: None,
            state: None,
            callback: None,
        }
    }
}

impl<K, V> Clone for ExpirationPolicy<K, V> {
    fn clone(&self) -> Self {
        Self {
            expiration: self.expiration,
            priority: self.priority,
            dependency: self.dependency.clone(),
            state: self.state.clone(),
            callback: self.callback.clone(),
        }
    }
}

impl<K, V> ExpirationPolicy<K, V> {
    /// Never expires, normal priority
    pub fn never() -> Self {
        Self::default()
    }

    pub fn new(expiration: Expiration) -> Self {
        Self {
            expiration,
            ..Self::default()
        }
    }

    pub fn sliding(idle: Duration) -> Self {
        Self::new(Expiration::sliding(idle))
    }

    pub fn absolute_at(at: DateTime<Utc>) -> Self {
        Self::new(Expiration::absolute_at(at))
    }

    pub fn absolute_in(ttl: Duration) -> Self {
        Self::new(Expiration::absolute_in(ttl))
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, token: ChangeToken) -> Self {
        self.dependency = Some(token);
        self
    }

    pub fn with_state<S: Any + Send + Sync>(mut self, state: S) -> Self {
        self.state = Some(Arc::new(state));
        self
    }

    pub fn on_evicted<F>(mut self, callback: F) -> Self
    where
        F: Fn(&EvictionNotification<K, V>) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Whether eviction of an entry under this policy is reported
    pub fn is_tracked(&self) -> bool {
        !self.expiration.never_expires() || self.dependency.is_some() || self.callback.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_kinds_are_not_exclusive() {
        let expiration = Expiration::sliding(Duration::from_secs(5)).with_absolute(Utc::now());
        assert!(expiration.is_sliding());
        assert!(expiration.is_absolute());
        assert!(!expiration.never_expires());
        assert!(Expiration::never().never_expires());
    }

    #[test]
    fn test_past_absolute_deadline_is_now() {
        let now = Instant::now();
        let expiration = Expiration::absolute_at(Utc::now() - chrono::Duration::seconds(10));
        assert_eq!(expiration.absolute_deadline(now), Some(now));
    }

    #[test]
    fn test_absolute_in_sets_future_deadline() {
        let now = Instant::now();
        let deadline = Expiration::absolute_in(Duration::from_secs(60))
            .absolute_deadline(now)
            .unwrap();
        assert!(deadline > now + Duration::from_secs(55));
        assert!(Expiration::absolute_in(Duration::MAX).never_expires());
    }

    #[test]
    fn test_change_token_is_shared_between_clones() {
        let token = ChangeToken::new();
        let dependent = token.clone();
        assert!(!dependent.has_changed());
        token.signal();
        assert!(dependent.has_changed());
    }

    #[test]
    fn test_priority_order() {
        assert!(CachePriority::Low < CachePriority::Normal);
        assert!(CachePriority::High < CachePriority::NeverRemove);
        assert_eq!(CachePriority::default(), CachePriority::Normal);
    }

    #[test]
    fn test_policy_tracking() {
        let untracked: ExpirationPolicy<String, u32> =
            ExpirationPolicy::never().with_priority(CachePriority::High);
        assert!(!untracked.is_tracked());

        let with_callback: ExpirationPolicy<String, u32> = ExpirationPolicy::never().on_evicted(|_| {});
        assert!(with_callback.is_tracked());

        let with_dependency: ExpirationPolicy<String, u32> =
            ExpirationPolicy::never().with_dependency(ChangeToken::new());
        assert!(with_dependency.is_tracked());
    }

    #[test]
    fn test_notification_state_downcast() {
        let notification = EvictionNotification {
            key: "k",
            value: 1u8,
            reason: EvictionReason::Removed,
            state: Some(Arc::new(42u64) as SharedValue),
        };
        assert_eq!(notification.state_as::<u64>(), Some(&42));
        assert_eq!(notification.state_as::<String>(), None);
    }
}
