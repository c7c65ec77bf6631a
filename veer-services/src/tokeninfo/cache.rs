//! Bounded TTL/LRU cache with per-token request coalescing.
//!
//! The cache never performs I/O itself: a miss elects exactly one owner to
//! fetch upstream while every concurrent caller for the same token parks on
//! a oneshot and observes the owner's terminal result.
use std::{
    cell::RefCell,
    collections::HashMap,
    time::{Duration, Instant},
};

use futures::channel::oneshot;
use serde_json::{Map, Value};

use super::TokeninfoError;

pub(crate) type Claims = Map<String, Value>;
type FetchResult = Result<Claims, TokeninfoError>;

struct Entry {
    info: Claims,
    cached_at: Instant,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    inflight: HashMap<String, Vec<oneshot::Sender<FetchResult>>>,
    // recency clock; the entry with the smallest stamp is the LRU victim
    tick: u64,
}

/// Outcome of a cache probe.
pub(crate) enum Lookup {
    /// Fresh entry: an adjusted shallow copy of the claims.
    Hit(Claims),
    /// The caller was elected to fetch upstream and must call
    /// [`TokeninfoCache::resolve`] with the outcome.
    MissOwner,
    /// Another task is already fetching this token.
    Wait(oneshot::Receiver<FetchResult>),
}

pub(crate) struct TokeninfoCache {
    size: usize,
    ttl: Duration,
    state: RefCell<CacheState>,
}

impl TokeninfoCache {
    pub(crate) fn new(size: usize, ttl: Duration) -> Self {
        Self {
            size,
            ttl,
            state: RefCell::new(CacheState::default()),
        }
    }

    pub(crate) fn lookup(&self, token: &str, now: Instant) -> Lookup {
        if self.size == 0 {
            // caching disabled: no entries, no coalescing
            return Lookup::MissOwner;
        }
        let mut state = self.state.borrow_mut();
        state.tick += 1;
        let tick = state.tick;

        match state.entries.get_mut(token) {
            Some(entry) if now < entry.expires_at => {
                entry.last_used = tick;
                let mut info = entry.info.clone();
                let elapsed = now.duration_since(entry.cached_at).as_secs();
                let original = expires_in_of(&entry.info).unwrap_or(0);
                info.insert(
                    "expires_in".to_string(),
                    Value::from(original.saturating_sub(elapsed as i64)),
                );
                return Lookup::Hit(info);
            }
            Some(_) => {
                // stale entries are never returned
                state.entries.remove(token);
            }
            None => {}
        }

        match state.inflight.get_mut(token) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Lookup::Wait(rx)
            }
            None => {
                state.inflight.insert(token.to_string(), Vec::new());
                Lookup::MissOwner
            }
        }
    }

    /// Deliver the owner's fetch outcome: wake all waiters and, on success,
    /// insert the entry subject to the TTL bound and the size cap.
    pub(crate) fn resolve(&self, token: &str, result: FetchResult, now: Instant) {
        let mut state = self.state.borrow_mut();
        if let Some(waiters) = state.inflight.remove(token) {
            for tx in waiters {
                let _ = tx.send(result.clone());
            }
        }

        let Ok(info) = result else { return };
        if self.size == 0 {
            return;
        }
        let expires_in = expires_in_of(&info).unwrap_or(0);
        let bounded = Duration::from_secs(expires_in.max(0) as u64).min(self.ttl);
        if bounded.is_zero() {
            // an already-expired validation is not worth keeping
            return;
        }

        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(
            token.to_string(),
            Entry {
                info,
                cached_at: now,
                expires_at: now + bounded,
                last_used: tick,
            },
        );

        while state.entries.len() > self.size {
            let victim = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
                .expect("non-empty cache has an LRU entry");
            state.entries.remove(&victim);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }
}

fn expires_in_of(info: &Claims) -> Option<i64> {
    info.get("expires_in").and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(expires_in: i64) -> Claims {
        let mut map = Claims::new();
        map.insert("uid".into(), Value::from("u"));
        map.insert("expires_in".into(), Value::from(expires_in));
        map
    }

    fn cache(size: usize, ttl_secs: u64) -> TokeninfoCache {
        TokeninfoCache::new(size, Duration::from_secs(ttl_secs))
    }

    #[test]
    fn hit_adjusts_expires_in_by_elapsed_seconds() {
        let c = cache(10, 3600);
        let t0 = Instant::now();
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
        c.resolve("t", Ok(claims(600)), t0);

        let Lookup::Hit(info) = c.lookup("t", t0 + Duration::from_secs(42)) else {
            panic!("expected hit");
        };
        assert_eq!(info["expires_in"], Value::from(558));
        // stored entry is untouched
        let Lookup::Hit(later) = c.lookup("t", t0 + Duration::from_secs(43)) else {
            panic!("expected hit");
        };
        assert_eq!(later["expires_in"], Value::from(557));
    }

    #[test]
    fn expired_entry_behaves_as_miss_and_is_removed() {
        let c = cache(10, 5);
        let t0 = Instant::now();
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
        c.resolve("t", Ok(claims(600)), t0);
        // ttl bounds the lifetime below the token's own expiry
        assert!(matches!(
            c.lookup("t", t0 + Duration::from_secs(6)),
            Lookup::MissOwner
        ));
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn concurrent_miss_parks_waiters_on_owner_result() {
        let c = cache(10, 3600);
        let t0 = Instant::now();
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
        let Lookup::Wait(mut rx1) = c.lookup("t", t0) else {
            panic!("expected wait");
        };
        let Lookup::Wait(mut rx2) = c.lookup("t", t0) else {
            panic!("expected wait");
        };
        assert!(rx1.try_recv().unwrap().is_none());
        c.resolve("t", Ok(claims(600)), t0);
        assert!(rx1.try_recv().unwrap().is_some());
        assert!(rx2.try_recv().unwrap().is_some());
    }

    #[test]
    fn errors_are_broadcast_and_not_cached() {
        let c = cache(10, 3600);
        let t0 = Instant::now();
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
        let Lookup::Wait(mut rx) = c.lookup("t", t0) else {
            panic!("expected wait");
        };
        c.resolve("t", Err(TokeninfoError::InvalidToken), t0);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Some(Err(TokeninfoError::InvalidToken))
        ));
        assert_eq!(c.len(), 0);
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
    }

    #[test]
    fn size_bound_evicts_least_recently_used() {
        let c = cache(2, 3600);
        let t0 = Instant::now();
        for token in ["a", "b"] {
            assert!(matches!(c.lookup(token, t0), Lookup::MissOwner));
            c.resolve(token, Ok(claims(600)), t0);
        }
        // touch "a" so "b" becomes the LRU victim
        assert!(matches!(c.lookup("a", t0), Lookup::Hit(_)));
        assert!(matches!(c.lookup("c", t0), Lookup::MissOwner));
        c.resolve("c", Ok(claims(600)), t0);
        assert_eq!(c.len(), 2);
        assert!(matches!(c.lookup("b", t0), Lookup::MissOwner));
        let Lookup::Hit(_) = c.lookup("a", t0) else {
            panic!("a should have survived eviction");
        };
    }

    #[test]
    fn zero_expires_in_is_not_cached() {
        let c = cache(10, 3600);
        let t0 = Instant::now();
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
        c.resolve("t", Ok(claims(0)), t0);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn zero_size_disables_caching_and_coalescing() {
        let c = cache(0, 3600);
        let t0 = Instant::now();
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
        c.resolve("t", Ok(claims(600)), t0);
        assert!(matches!(c.lookup("t", t0), Lookup::MissOwner));
    }
}
