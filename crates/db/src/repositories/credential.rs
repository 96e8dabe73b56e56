use keyvault_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use keyvault_core::domain::credential::{Credential, CredentialId, CredentialStatus};
use keyvault_core::registry::ServiceKind;

use super::{CredentialStore, RepositoryError};
use crate::DbPool;

const CREDENTIAL_COLUMNS: &str = "
    id,
    user_id,
    service,
    service_name,
    ciphertext,
    salt,
    iv,
    auth_tag,
    integrity_hash,
    algorithm,
    kdf,
    iterations,
    fingerprint,
    status,
    expires_at,
    created_at,
    updated_at,
    last_used_at,
    usage_count";

pub struct SqlCredentialStore {
    pool: DbPool,
}

impl SqlCredentialStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CredentialStore for SqlCredentialStore {
    async fn is_available(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn upsert(&self, credential: Credential) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Retire, never delete: the superseded row stays for audit.
        sqlx::query(
            "UPDATE credential
             SET status = 'revoked', updated_at = ?
             WHERE user_id = ? AND service = ? AND status = 'active'",
        )
        .bind(credential.updated_at.to_rfc3339())
        .bind(&credential.user_id)
        .bind(credential.service.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO credential (
                id,
                user_id,
                service,
                service_name,
                ciphertext,
                salt,
                iv,
                auth_tag,
                integrity_hash,
                algorithm,
                kdf,
                iterations,
                fingerprint,
                status,
                expires_at,
                created_at,
                updated_at,
                last_used_at,
                usage_count
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&credential.id.0)
        .bind(&credential.user_id)
        .bind(credential.service.as_str())
        .bind(&credential.service_name)
        .bind(&credential.ciphertext)
        .bind(&credential.salt)
        .bind(&credential.iv)
        .bind(&credential.auth_tag)
        .bind(&credential.integrity_hash)
        .bind(&credential.algorithm)
        .bind(&credential.kdf)
        .bind(i64::from(credential.iterations))
        .bind(&credential.fingerprint)
        .bind(credential.status.as_str())
        .bind(credential.expires_at.to_rfc3339())
        .bind(credential.created_at.to_rfc3339())
        .bind(credential.updated_at.to_rfc3339())
        .bind(credential.last_used_at.map(|value| value.to_rfc3339()))
        .bind(credential.usage_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_active(
        &self,
        user_id: &str,
        service: ServiceKind,
    ) -> Result<Option<Credential>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CREDENTIAL_COLUMNS}
             FROM credential
             WHERE user_id = ? AND service = ? AND status = 'active'",
        ))
        .bind(user_id)
        .bind(service.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(credential_from_row).transpose()
    }

    async fn list_active(&self, user_id: &str) -> Result<Vec<Credential>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CREDENTIAL_COLUMNS}
             FROM credential
             WHERE user_id = ? AND status = 'active'
             ORDER BY service ASC",
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(credential_from_row).collect()
    }

    async fn mark_status(
        &self,
        id: &CredentialId,
        status: CredentialStatus,
    ) -> Result<bool, RepositoryError> {
        // The guard enforces the one-way lifecycle in SQL as well; terminal
        // rows never move again even under concurrent callers.
        let result = sqlx::query(
            "UPDATE credential
             SET status = ?, updated_at = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn revoke_active(
        &self,
        user_id: &str,
        service: ServiceKind,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE credential
             SET status = 'revoked', updated_at = ?
             WHERE user_id = ? AND service = ? AND status = 'active'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .bind(service.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all(&self, user_id: &str) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE credential
             SET status = 'revoked', updated_at = ?
             WHERE user_id = ? AND status = 'active'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn record_usage(
        &self,
        id: &CredentialId,
        used_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE credential
             SET usage_count = usage_count + 1, last_used_at = ?
             WHERE id = ?",
        )
        .bind(used_at.to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn credential_from_row(row: SqliteRow) -> Result<Credential, RepositoryError> {
    let service_raw = row.get::<String, _>("service");
    let service = ServiceKind::parse(&service_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown service `{service_raw}`")))?;

    let status_raw = row.get::<String, _>("status");
    let status = CredentialStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status_raw}`")))?;

    Ok(Credential {
        id: CredentialId(row.get::<String, _>("id")),
        user_id: row.get::<String, _>("user_id"),
        service,
        service_name: row.get::<String, _>("service_name"),
        ciphertext: row.get::<String, _>("ciphertext"),
        salt: row.get::<String, _>("salt"),
        iv: row.get::<String, _>("iv"),
        auth_tag: row.get::<String, _>("auth_tag"),
        integrity_hash: row.get::<String, _>("integrity_hash"),
        algorithm: row.get::<String, _>("algorithm"),
        kdf: row.get::<String, _>("kdf"),
        iterations: parse_u32("iterations", row.get::<i64, _>("iterations"))?,
        fingerprint: row.get::<String, _>("fingerprint"),
        status,
        expires_at: parse_timestamp("expires_at", &row.get::<String, _>("expires_at"))?,
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp("updated_at", &row.get::<String, _>("updated_at"))?,
        last_used_at: parse_optional_timestamp(
            "last_used_at",
            row.get::<Option<String>, _>("last_used_at"),
        )?,
        usage_count: row.get::<i64, _>("usage_count"),
    })
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| RepositoryError::Decode(format!("invalid `{column}` timestamp: {err}")))
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|raw| parse_timestamp(column, &raw)).transpose()
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("`{column}` out of range: {value}")))
}
