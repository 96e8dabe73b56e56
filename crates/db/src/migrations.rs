use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::{connect, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "credential",
        "idx_credential_active_pair",
        "idx_credential_user_status",
        "idx_credential_expires_at",
    ];

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let credential_count = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = 'credential'",
        )
        .fetch_one(&pool)
        .await
        .expect("check credential table")
        .get::<i64, _>("count");

        assert_eq!(credential_count, 1);
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let credential_count = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = 'credential'",
        )
        .fetch_one(&pool)
        .await
        .expect("check credential table removed")
        .get::<i64, _>("count");

        assert_eq!(credential_count, 0);
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let after_down_signature = managed_schema_signature(&pool).await;
        assert!(
            after_down_signature.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");

        let after_second_up_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            after_second_up_signature, initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    #[tokio::test]
    async fn active_pair_index_rejects_second_active_row() {
        let pool = connect("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let insert = "INSERT INTO credential (
                id, user_id, service, service_name,
                ciphertext, salt, iv, auth_tag, integrity_hash,
                algorithm, kdf, iterations, fingerprint, status,
                expires_at, created_at, updated_at, usage_count
             ) VALUES (?, 'u1', 'github', 'GitHub', 'c', 's', 'i', 't', 'h',
                'AES-256-GCM', 'PBKDF2-HMAC-SHA256', 100000, ?, ?,
                '2030-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00',
                '2026-01-01T00:00:00+00:00', 0)";

        sqlx::query(insert)
            .bind("id-1")
            .bind("fp-1")
            .bind("active")
            .execute(&pool)
            .await
            .expect("first active row");

        let second_active =
            sqlx::query(insert).bind("id-2").bind("fp-2").bind("active").execute(&pool).await;
        assert!(second_active.is_err(), "two active rows per (user, service) must be rejected");

        // A revoked sibling does not trip the partial index.
        sqlx::query(insert)
            .bind("id-3")
            .bind("fp-3")
            .bind("revoked")
            .execute(&pool)
            .await
            .expect("revoked row alongside active");
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
