//! Vault facade over the envelope cipher, the session cache and the
//! durable store. One instance serves all users; per-user isolation comes
//! from key derivation and row scoping, not from separate instances.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{info, warn};

use keyvault_core::cache::{DEFAULT_CACHE_TTL_SECS, DEFAULT_MAX_CACHED_USERS};
use keyvault_core::config::VaultConfig;
use keyvault_core::domain::credential::{Credential, CredentialStatus};
use keyvault_core::envelope::EnvelopeCipher;
use keyvault_core::errors::SubmitError;
use keyvault_core::registry::{ServiceKind, ServiceRegistry};
use keyvault_core::SessionCache;
use keyvault_db::repositories::{CredentialStore, RepositoryError};

/// Per-user credential operations. The implementation is chosen once at
/// startup; callers never branch on storage mode.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Validates, encrypts and stores an API key, superseding any prior
    /// active key for the same (user, service). Surrounding whitespace is
    /// stripped before validation. `expires_at` falls back to the
    /// configured default window; implementations without durable storage
    /// ignore it, since only the session window bounds their entries.
    async fn submit(
        &self,
        user_id: &str,
        service: ServiceKind,
        raw_key: SecretString,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), SubmitError>;

    /// Returns the decrypted key, or `None` when absent, expired, revoked
    /// or undecryptable. Lookup failures are indistinguishable on purpose.
    async fn get(&self, user_id: &str, service: ServiceKind) -> Option<SecretString>;

    /// Retires the active key for one service. Returns false when there
    /// was nothing to revoke.
    async fn revoke(&self, user_id: &str, service: ServiceKind) -> bool;

    /// Retires every active key the user has. Returns how many were retired.
    async fn clear(&self, user_id: &str) -> u64;

    /// Which services the user can drive right now, and setup metadata
    /// for the ones they cannot.
    async fn capabilities(&self, user_id: &str) -> CapabilitySet;

    async fn status(&self) -> VaultStatus;

    /// Drops stale cache entries. Returns how many users were evicted.
    async fn cleanup_expired_cache(&self) -> usize;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilitySet {
    pub available: Vec<ServiceKind>,
    pub missing: Vec<MissingService>,
}

/// Setup guidance for a service the user has not connected yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingService {
    pub kind: ServiceKind,
    pub display_name: &'static str,
    pub capabilities: &'static [&'static str],
    pub setup_url: &'static str,
    pub instructions: &'static str,
    pub required_scopes: &'static [&'static str],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaultMode {
    Durable,
    CacheOnly,
}

impl VaultMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::CacheOnly => "cache_only",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VaultStatus {
    pub mode: VaultMode,
    pub store_available: bool,
    pub cached_users: usize,
}

/// Runtime knobs, split out so tests can shrink windows without sleeping.
#[derive(Clone, Debug)]
pub struct VaultTuning {
    pub cache_ttl: Duration,
    pub default_expiry: Duration,
    pub store_timeout: StdDuration,
    pub max_cached_users: usize,
}

impl Default for VaultTuning {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::seconds(DEFAULT_CACHE_TTL_SECS as i64),
            default_expiry: Duration::days(30),
            store_timeout: StdDuration::from_secs(5),
            max_cached_users: DEFAULT_MAX_CACHED_USERS,
        }
    }
}

impl VaultTuning {
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            cache_ttl: Duration::seconds(config.cache_ttl_secs as i64),
            default_expiry: Duration::days(config.default_expiry_days),
            store_timeout: StdDuration::from_secs(config.store_timeout_secs),
            max_cached_users: config.max_cached_users,
        }
    }
}

/// Strips accidental whitespace from a pasted key. Applied once, before
/// validation, so the validated shape is exactly what gets stored.
pub(crate) fn normalize_key(raw_key: SecretString) -> SecretString {
    let exposed = raw_key.expose_secret();
    let trimmed = exposed.trim();
    if trimmed.len() == exposed.len() {
        raw_key
    } else {
        SecretString::from(trimmed.to_string())
    }
}

/// Vault backed by a durable store. Reads prefer the session cache; every
/// store call sits behind a timeout so a slow backend degrades the vault
/// instead of hanging callers.
pub struct DurableVault {
    store: Arc<dyn CredentialStore>,
    cipher: EnvelopeCipher,
    registry: ServiceRegistry,
    cache: Mutex<SessionCache>,
    tuning: VaultTuning,
    store_available: AtomicBool,
}

impl DurableVault {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: EnvelopeCipher,
        registry: ServiceRegistry,
        tuning: VaultTuning,
    ) -> Self {
        let cache = SessionCache::new(tuning.cache_ttl, tuning.max_cached_users);
        Self {
            store,
            cipher,
            registry,
            cache: Mutex::new(cache),
            tuning,
            store_available: AtomicBool::new(true),
        }
    }

    /// Runs one store call under the configured timeout. A timeout or a
    /// store error flips the vault into degraded mode until a later call
    /// succeeds.
    async fn with_store<T, F>(&self, operation: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, RepositoryError>> + Send,
    {
        match tokio::time::timeout(self.tuning.store_timeout, fut).await {
            Ok(Ok(value)) => {
                self.store_available.store(true, Ordering::SeqCst);
                Some(value)
            }
            Ok(Err(error)) => {
                warn!(
                    event_name = "vault.store.error",
                    operation,
                    error = %error,
                    "credential store call failed"
                );
                self.store_available.store(false, Ordering::SeqCst);
                None
            }
            Err(_) => {
                warn!(
                    event_name = "vault.store.timeout",
                    operation,
                    timeout_secs = self.tuning.store_timeout.as_secs(),
                    "credential store call timed out"
                );
                self.store_available.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    async fn encrypt_off_thread(
        &self,
        user_id: &str,
        raw_key: &SecretString,
    ) -> Result<keyvault_core::KeyBundle, SubmitError> {
        // PBKDF2 at production iteration counts is too slow for the
        // async executor threads.
        let cipher = self.cipher.clone();
        let user = user_id.to_string();
        let key = raw_key.clone();
        let handle =
            tokio::task::spawn_blocking(move || cipher.encrypt(key.expose_secret(), &user));
        match handle.await {
            Ok(result) => Ok(result?),
            Err(error) => {
                warn!(
                    event_name = "vault.cipher.worker_failed",
                    error = %error,
                    "encryption worker did not complete"
                );
                Err(SubmitError::Worker)
            }
        }
    }

    async fn decrypt_off_thread(&self, credential: &Credential) -> Option<SecretString> {
        let cipher = self.cipher.clone();
        let user = credential.user_id.clone();
        let bundle = credential.bundle();
        let fingerprint = credential.fingerprint.clone();
        let handle = tokio::task::spawn_blocking(move || cipher.decrypt(&bundle, &user));
        match handle.await {
            Ok(Ok(plaintext)) => Some(plaintext),
            Ok(Err(error)) => {
                // Fail closed: a row that will not decrypt is treated as
                // absent, never surfaced partially.
                warn!(
                    event_name = "vault.cipher.decrypt_failed",
                    fingerprint = %fingerprint,
                    error = %error,
                    "stored credential failed decryption"
                );
                None
            }
            Err(error) => {
                warn!(
                    event_name = "vault.cipher.worker_failed",
                    error = %error,
                    "decryption worker did not complete"
                );
                None
            }
        }
    }

    fn spawn_record_usage(&self, credential: &Credential, used_at: DateTime<Utc>) {
        // Best effort; a lost increment never blocks or fails a read.
        let store = Arc::clone(&self.store);
        let id = credential.id.clone();
        tokio::spawn(async move {
            if let Err(error) = store.record_usage(&id, used_at).await {
                warn!(
                    event_name = "vault.usage.record_failed",
                    error = %error,
                    "usage recording failed"
                );
            }
        });
    }

    fn spawn_mark_expired(&self, credential: &Credential) {
        let store = Arc::clone(&self.store);
        let id = credential.id.clone();
        let fingerprint = credential.fingerprint.clone();
        tokio::spawn(async move {
            match store.mark_status(&id, CredentialStatus::Expired).await {
                Ok(true) => {
                    info!(
                        event_name = "vault.credential.expired",
                        fingerprint = %fingerprint,
                        "credential lazily marked expired"
                    );
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(
                        event_name = "vault.credential.expire_failed",
                        error = %error,
                        "expiry transition failed"
                    );
                }
            }
        });
    }

    fn missing_from(&self, available: &[ServiceKind]) -> Vec<MissingService> {
        self.registry
            .descriptors()
            .iter()
            .filter(|descriptor| !available.contains(&descriptor.kind))
            .map(|descriptor| MissingService {
                kind: descriptor.kind,
                display_name: descriptor.display_name,
                capabilities: descriptor.capabilities,
                setup_url: descriptor.setup_url,
                instructions: descriptor.instructions,
                required_scopes: descriptor.required_scopes,
            })
            .collect()
    }
}

#[async_trait]
impl Vault for DurableVault {
    async fn submit(
        &self,
        user_id: &str,
        service: ServiceKind,
        raw_key: SecretString,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), SubmitError> {
        let raw_key = normalize_key(raw_key);
        if !self.registry.validate_key(service, raw_key.expose_secret()) {
            return Err(SubmitError::InvalidFormat { service });
        }

        let bundle = self.encrypt_off_thread(user_id, &raw_key).await?;

        let now = Utc::now();
        let credential = Credential::issue(
            user_id,
            service,
            self.registry.display_name(service),
            bundle,
            self.cipher.iterations(),
            expires_at.unwrap_or(now + self.tuning.default_expiry),
        );
        let fingerprint = credential.fingerprint.clone();

        // No durable row, no cached plaintext: a submit that cannot be
        // persisted must not look like it succeeded.
        self.with_store("upsert", self.store.upsert(credential))
            .await
            .ok_or(SubmitError::StoreUnavailable)?;

        let mut cache = self.cache.lock().await;
        cache.insert(user_id, service, raw_key, now);
        drop(cache);

        info!(
            event_name = "vault.credential.stored",
            user_id = %user_id,
            service = %service,
            fingerprint = %fingerprint,
            "credential stored"
        );
        Ok(())
    }

    async fn get(&self, user_id: &str, service: ServiceKind) -> Option<SecretString> {
        let now = Utc::now();

        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(user_id, service, now) {
                return Some(hit);
            }
        }

        let credential =
            self.with_store("get_active", self.store.get_active(user_id, service)).await??;

        if credential.is_expired_at(now) {
            self.spawn_mark_expired(&credential);
            let mut cache = self.cache.lock().await;
            cache.evict_service(user_id, service);
            return None;
        }

        let plaintext = self.decrypt_off_thread(&credential).await?;

        let mut cache = self.cache.lock().await;
        cache.insert(user_id, service, plaintext.clone(), now);
        drop(cache);

        self.spawn_record_usage(&credential, now);
        Some(plaintext)
    }

    async fn revoke(&self, user_id: &str, service: ServiceKind) -> bool {
        // Cached plaintext goes first so a revoke is immediate even when
        // the store lags behind.
        {
            let mut cache = self.cache.lock().await;
            cache.evict_service(user_id, service);
        }

        let revoked = self
            .with_store("revoke_active", self.store.revoke_active(user_id, service))
            .await
            .unwrap_or(false);
        if revoked {
            info!(
                event_name = "vault.credential.revoked",
                user_id = %user_id,
                service = %service,
                "credential revoked"
            );
        }
        revoked
    }

    async fn clear(&self, user_id: &str) -> u64 {
        {
            let mut cache = self.cache.lock().await;
            cache.evict_user(user_id);
        }

        let cleared =
            self.with_store("revoke_all", self.store.revoke_all(user_id)).await.unwrap_or(0);
        if cleared > 0 {
            info!(
                event_name = "vault.credential.cleared",
                user_id = %user_id,
                revoked = cleared,
                "all credentials revoked"
            );
        }
        cleared
    }

    async fn capabilities(&self, user_id: &str) -> CapabilitySet {
        let now = Utc::now();

        let available = match self.with_store("list_active", self.store.list_active(user_id)).await
        {
            Some(rows) => rows
                .iter()
                .filter(|row| !row.is_expired_at(now))
                .map(|row| row.service)
                .collect(),
            // Degraded: the fresh cache window is the best answer we have.
            None => {
                let cache = self.cache.lock().await;
                cache.services_for(user_id, now)
            }
        };

        let missing = self.missing_from(&available);
        CapabilitySet { available, missing }
    }

    async fn status(&self) -> VaultStatus {
        let store_available = tokio::time::timeout(self.tuning.store_timeout, async {
            self.store.is_available().await
        })
        .await
        .unwrap_or(false);
        self.store_available.store(store_available, Ordering::SeqCst);

        let cache = self.cache.lock().await;
        VaultStatus { mode: VaultMode::Durable, store_available, cached_users: cache.user_count() }
    }

    async fn cleanup_expired_cache(&self) -> usize {
        let mut cache = self.cache.lock().await;
        cache.cleanup_expired(Utc::now())
    }
}
