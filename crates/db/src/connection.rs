use std::cmp;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

pub type DbPool = sqlx::SqlitePool;

/// Pool tuned for credential rows: WAL keeps readers unblocked during an
/// upsert transaction, and secure_delete scrubs freed pages so superseded
/// ciphertext does not linger in the file.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    // Busy waiting is capped below the acquire timeout so a locked file
    // surfaces as a pool error, not a silent stall.
    let busy_timeout_ms = cmp::min(timeout_secs.max(1), 30) * 1_000;

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA secure_delete = ON").execute(&mut *conn).await?;
                sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms}"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}
