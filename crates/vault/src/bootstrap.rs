use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;
use tracing::{info, warn};

use keyvault_core::config::{AppConfig, ConfigError, LoadOptions};
use keyvault_core::envelope::EnvelopeCipher;
use keyvault_core::registry::ServiceRegistry;
use keyvault_db::repositories::SqlCredentialStore;
use keyvault_db::{connect, migrations, DbPool};

use crate::cache_only::CacheOnlyVault;
use crate::vault::{DurableVault, Vault, VaultTuning};

/// The assembled vault plus the resources it owns. `db_pool` is `None` in
/// cache-only mode.
pub struct VaultRuntime {
    pub config: AppConfig,
    pub vault: Arc<dyn Vault>,
    pub db_pool: Option<DbPool>,
}

impl VaultRuntime {
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.db_pool {
            pool.close().await;
        }
        info!(event_name = "system.shutdown.complete", "vault runtime shut down");
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub fn init_logging(config: &AppConfig) {
    use keyvault_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<VaultRuntime, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Storage mode is decided here, once. Everything downstream holds a
/// `dyn Vault` and never asks again.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<VaultRuntime, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting vault bootstrap");

    let registry = ServiceRegistry::builtin();
    let cipher = EnvelopeCipher::with_iterations(
        config.vault.master_secret.clone(),
        config.vault.kdf_iterations,
    );

    let Some(database_url) = config.database.url.clone() else {
        warn!(
            event_name = "system.bootstrap.cache_only",
            "no database configured; credentials will not survive a restart"
        );
        let vault = CacheOnlyVault::new(
            registry,
            Duration::seconds(config.vault.session_ttl_secs as i64),
            config.vault.max_cached_users,
        );
        return Ok(VaultRuntime { config, vault: Arc::new(vault), db_pool: None });
    };

    let db_pool = connect(
        &database_url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let store = Arc::new(SqlCredentialStore::new(db_pool.clone()));
    let tuning = VaultTuning::from_config(&config.vault);
    let vault = DurableVault::new(store, cipher, registry, tuning);

    info!(event_name = "system.bootstrap.ready", mode = "durable", "vault ready");
    Ok(VaultRuntime { config, vault: Arc::new(vault), db_pool: Some(db_pool) })
}
