use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use keyvault_core::chrono::{DateTime, Utc};
use keyvault_core::domain::credential::{Credential, CredentialId, CredentialStatus};
use keyvault_core::registry::ServiceKind;

use super::{CredentialStore, RepositoryError};

/// Vec-backed store mirroring the SQL adapter's append-only lifecycle.
/// Tests flip `set_available` to simulate an outage.
pub struct InMemoryCredentialStore {
    rows: RwLock<Vec<Credential>>,
    available: AtomicBool,
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self { rows: RwLock::new(Vec::new()), available: AtomicBool::new(true) }
    }
}

impl InMemoryCredentialStore {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn rows(&self) -> Vec<Credential> {
        self.rows.read().await.clone()
    }

    fn ensure_available(&self) -> Result<(), RepositoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Decode("in-memory store marked unavailable".to_string()))
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn upsert(&self, credential: Credential) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        let mut rows = self.rows.write().await;
        for row in rows.iter_mut() {
            if row.user_id == credential.user_id
                && row.service == credential.service
                && row.status == CredentialStatus::Active
            {
                row.status = CredentialStatus::Revoked;
                row.updated_at = credential.updated_at;
            }
        }
        rows.push(credential);
        Ok(())
    }

    async fn get_active(
        &self,
        user_id: &str,
        service: ServiceKind,
    ) -> Result<Option<Credential>, RepositoryError> {
        self.ensure_available()?;
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|row| {
                row.user_id == user_id
                    && row.service == service
                    && row.status == CredentialStatus::Active
            })
            .cloned())
    }

    async fn list_active(&self, user_id: &str) -> Result<Vec<Credential>, RepositoryError> {
        self.ensure_available()?;
        let rows = self.rows.read().await;
        let mut active: Vec<Credential> = rows
            .iter()
            .filter(|row| row.user_id == user_id && row.status == CredentialStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|row| row.service);
        Ok(active)
    }

    async fn mark_status(
        &self,
        id: &CredentialId,
        status: CredentialStatus,
    ) -> Result<bool, RepositoryError> {
        self.ensure_available()?;
        let mut rows = self.rows.write().await;
        let Some(row) = rows.iter_mut().find(|row| &row.id == id) else {
            return Ok(false);
        };
        if !row.status.can_transition_to(status) {
            return Ok(false);
        }
        row.status = status;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn revoke_active(
        &self,
        user_id: &str,
        service: ServiceKind,
    ) -> Result<bool, RepositoryError> {
        self.ensure_available()?;
        let mut rows = self.rows.write().await;
        let mut revoked = false;
        for row in rows.iter_mut() {
            if row.user_id == user_id
                && row.service == service
                && row.status == CredentialStatus::Active
            {
                row.status = CredentialStatus::Revoked;
                row.updated_at = Utc::now();
                revoked = true;
            }
        }
        Ok(revoked)
    }

    async fn revoke_all(&self, user_id: &str) -> Result<u64, RepositoryError> {
        self.ensure_available()?;
        let mut rows = self.rows.write().await;
        let mut revoked = 0;
        for row in rows.iter_mut() {
            if row.user_id == user_id && row.status == CredentialStatus::Active {
                row.status = CredentialStatus::Revoked;
                row.updated_at = Utc::now();
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn record_usage(
        &self,
        id: &CredentialId,
        used_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.iter_mut().find(|row| &row.id == id) {
            row.usage_count += 1;
            row.last_used_at = Some(used_at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use keyvault_core::domain::credential::{Credential, CredentialStatus};
    use keyvault_core::envelope::KeyBundle;
    use keyvault_core::registry::ServiceKind;

    use crate::repositories::{CredentialStore, InMemoryCredentialStore};

    fn credential(user_id: &str, service: ServiceKind) -> Credential {
        let bundle = KeyBundle {
            ciphertext: "Y2lwaGVy".to_string(),
            salt: "c2FsdA==".to_string(),
            iv: "aXY=".to_string(),
            auth_tag: "dGFn".to_string(),
            integrity_hash: "00".repeat(32),
        };
        Credential::issue(
            user_id,
            service,
            service.as_str(),
            bundle,
            100_000,
            Utc::now() + Duration::days(30),
        )
    }

    #[tokio::test]
    async fn upsert_supersedes_prior_active_row() {
        let store = InMemoryCredentialStore::default();
        let first = credential("u1", ServiceKind::Github);
        let second = credential("u1", ServiceKind::Github);

        store.upsert(first.clone()).await.expect("first upsert");
        store.upsert(second.clone()).await.expect("second upsert");

        let active = store
            .get_active("u1", ServiceKind::Github)
            .await
            .expect("get")
            .expect("row present");
        assert_eq!(active.id, second.id);

        let rows = store.rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows.iter().filter(|row| row.status == CredentialStatus::Active).count(),
            1
        );
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemoryCredentialStore::default();
        store.set_available(false);

        assert!(!store.is_available().await);
        assert!(store.upsert(credential("u1", ServiceKind::Github)).await.is_err());
        assert!(store.get_active("u1", ServiceKind::Github).await.is_err());
        assert!(store.list_active("u1").await.is_err());
    }

    #[tokio::test]
    async fn revoke_all_only_touches_the_named_user() {
        let store = InMemoryCredentialStore::default();
        store.upsert(credential("u1", ServiceKind::Github)).await.expect("upsert");
        store.upsert(credential("u1", ServiceKind::Slack)).await.expect("upsert");
        store.upsert(credential("u2", ServiceKind::Github)).await.expect("upsert");

        assert_eq!(store.revoke_all("u1").await.expect("revoke all"), 2);
        assert!(store.get_active("u2", ServiceKind::Github).await.expect("get").is_some());
    }
}
