use async_trait::async_trait;
use thiserror::Error;

use keyvault_core::chrono::{DateTime, Utc};
use keyvault_core::domain::credential::{Credential, CredentialId, CredentialStatus};
use keyvault_core::registry::ServiceKind;

pub mod credential;
pub mod memory;

pub use credential::SqlCredentialStore;
pub use memory::InMemoryCredentialStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Durable adapter behind the vault. Implementations store encrypted rows
/// only; plaintext never crosses this boundary.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Cheap liveness check, used to report degraded mode.
    async fn is_available(&self) -> bool;

    /// Persists a fresh active row, atomically retiring any prior active
    /// row for the same (user, service).
    async fn upsert(&self, credential: Credential) -> Result<(), RepositoryError>;

    async fn get_active(
        &self,
        user_id: &str,
        service: ServiceKind,
    ) -> Result<Option<Credential>, RepositoryError>;

    async fn list_active(&self, user_id: &str) -> Result<Vec<Credential>, RepositoryError>;

    /// Moves one row out of `active`. Returns false when the row was
    /// missing or already terminal.
    async fn mark_status(
        &self,
        id: &CredentialId,
        status: CredentialStatus,
    ) -> Result<bool, RepositoryError>;

    async fn revoke_active(
        &self,
        user_id: &str,
        service: ServiceKind,
    ) -> Result<bool, RepositoryError>;

    async fn revoke_all(&self, user_id: &str) -> Result<u64, RepositoryError>;

    async fn record_usage(
        &self,
        id: &CredentialId,
        used_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}
