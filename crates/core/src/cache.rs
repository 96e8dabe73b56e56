//! Bounded-staleness in-memory cache of decrypted keys.
//!
//! Entries are keyed by user; one coarse `cached_at` covers the whole user
//! entry, so refreshing one service refreshes the user's staleness window.
//! Plaintext lives only in process memory, wrapped in `SecretString`.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;

use crate::registry::ServiceKind;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_MAX_CACHED_USERS: usize = 1024;

struct UserEntry {
    keys: HashMap<ServiceKind, SecretString>,
    cached_at: DateTime<Utc>,
}

pub struct SessionCache {
    ttl: Duration,
    max_users: usize,
    users: HashMap<String, UserEntry>,
}

impl SessionCache {
    pub fn new(ttl: Duration, max_users: usize) -> Self {
        Self { ttl, max_users: max_users.max(1), users: HashMap::new() }
    }

    fn is_fresh(&self, entry: &UserEntry, now: DateTime<Utc>) -> bool {
        now - entry.cached_at < self.ttl
    }

    /// Returns the cached plaintext only while the user's window is fresh.
    pub fn get(
        &self,
        user_id: &str,
        service: ServiceKind,
        now: DateTime<Utc>,
    ) -> Option<SecretString> {
        let entry = self.users.get(user_id)?;
        if !self.is_fresh(entry, now) {
            return None;
        }
        entry.keys.get(&service).cloned()
    }

    /// Inserts a value and resets the user's staleness window.
    pub fn insert(
        &mut self,
        user_id: &str,
        service: ServiceKind,
        value: SecretString,
        now: DateTime<Utc>,
    ) {
        let entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserEntry { keys: HashMap::new(), cached_at: now });
        entry.keys.insert(service, value);
        entry.cached_at = now;
        self.enforce_bound();
    }

    /// Services with a cached value inside the fresh window, for
    /// capability reporting when the durable store cannot be asked.
    pub fn services_for(&self, user_id: &str, now: DateTime<Utc>) -> Vec<ServiceKind> {
        let Some(entry) = self.users.get(user_id) else {
            return Vec::new();
        };
        if !self.is_fresh(entry, now) {
            return Vec::new();
        }
        let mut services: Vec<ServiceKind> = entry.keys.keys().copied().collect();
        services.sort();
        services
    }

    pub fn evict_service(&mut self, user_id: &str, service: ServiceKind) -> bool {
        self.users.get_mut(user_id).map(|entry| entry.keys.remove(&service).is_some()).unwrap_or(false)
    }

    pub fn evict_user(&mut self, user_id: &str) -> bool {
        self.users.remove(user_id).is_some()
    }

    /// Lazy sweep: drops user entries whose window elapsed. No background
    /// task; callers invoke this for memory hygiene.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let before = self.users.len();
        self.users.retain(|_, entry| now - entry.cached_at < ttl);
        before - self.users.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    // Growth bound: evict the stalest user entry when over capacity.
    fn enforce_bound(&mut self) {
        while self.users.len() > self.max_users {
            let Some(stalest) = self
                .users
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(user, _)| user.clone())
            else {
                return;
            };
            self.users.remove(&stalest);
        }
    }
}
