use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::DEFAULT_KDF_ITERATIONS;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub vault: VaultConfig,
    pub logging: LoggingConfig,
}

/// Durable backing store. A missing `url` selects cache-only mode: the
/// vault runs without durability and says so through its status surface.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct VaultConfig {
    pub master_secret: SecretString,
    pub kdf_iterations: u32,
    pub cache_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub default_expiry_days: i64,
    pub store_timeout_secs: u64,
    pub max_cached_users: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub master_secret: Option<String>,
    pub cache_ttl_secs: Option<u64>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig { url: None, max_connections: 5, timeout_secs: 30 },
            vault: VaultConfig {
                master_secret: String::new().into(),
                kdf_iterations: DEFAULT_KDF_ITERATIONS,
                cache_ttl_secs: 300,
                session_ttl_secs: 86_400,
                default_expiry_days: 30,
                store_timeout_secs: 5,
                max_cached_users: 1024,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("keyvault.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = Some(url);
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(vault) = patch.vault {
            if let Some(master_secret_value) = vault.master_secret {
                self.vault.master_secret = secret_value(master_secret_value);
            }
            if let Some(kdf_iterations) = vault.kdf_iterations {
                self.vault.kdf_iterations = kdf_iterations;
            }
            if let Some(cache_ttl_secs) = vault.cache_ttl_secs {
                self.vault.cache_ttl_secs = cache_ttl_secs;
            }
            if let Some(session_ttl_secs) = vault.session_ttl_secs {
                self.vault.session_ttl_secs = session_ttl_secs;
            }
            if let Some(default_expiry_days) = vault.default_expiry_days {
                self.vault.default_expiry_days = default_expiry_days;
            }
            if let Some(store_timeout_secs) = vault.store_timeout_secs {
                self.vault.store_timeout_secs = store_timeout_secs;
            }
            if let Some(max_cached_users) = vault.max_cached_users {
                self.vault.max_cached_users = max_cached_users;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("KEYVAULT_DATABASE_URL") {
            self.database.url = Some(value);
        }
        if let Some(value) = read_env("KEYVAULT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("KEYVAULT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("KEYVAULT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("KEYVAULT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("KEYVAULT_MASTER_SECRET") {
            self.vault.master_secret = secret_value(value);
        }
        if let Some(value) = read_env("KEYVAULT_KDF_ITERATIONS") {
            self.vault.kdf_iterations = parse_u32("KEYVAULT_KDF_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("KEYVAULT_CACHE_TTL_SECS") {
            self.vault.cache_ttl_secs = parse_u64("KEYVAULT_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("KEYVAULT_SESSION_TTL_SECS") {
            self.vault.session_ttl_secs = parse_u64("KEYVAULT_SESSION_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("KEYVAULT_DEFAULT_EXPIRY_DAYS") {
            self.vault.default_expiry_days = parse_i64("KEYVAULT_DEFAULT_EXPIRY_DAYS", &value)?;
        }
        if let Some(value) = read_env("KEYVAULT_STORE_TIMEOUT_SECS") {
            self.vault.store_timeout_secs = parse_u64("KEYVAULT_STORE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("KEYVAULT_MAX_CACHED_USERS") {
            self.vault.max_cached_users =
                parse_u64("KEYVAULT_MAX_CACHED_USERS", &value)? as usize;
        }

        let log_level =
            read_env("KEYVAULT_LOGGING_LEVEL").or_else(|| read_env("KEYVAULT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("KEYVAULT_LOGGING_FORMAT").or_else(|| read_env("KEYVAULT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = Some(database_url);
        }
        if let Some(master_secret) = overrides.master_secret {
            self.vault.master_secret = secret_value(master_secret);
        }
        if let Some(cache_ttl_secs) = overrides.cache_ttl_secs {
            self.vault.cache_ttl_secs = cache_ttl_secs;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_vault(&self.vault)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("keyvault.toml"), PathBuf::from("config/keyvault.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    if let Some(url) = &database.url {
        let url = url.trim();
        let sqlite_url =
            url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
        if !sqlite_url {
            return Err(ConfigError::Validation(
                "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                    .to_string(),
            ));
        }
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_vault(vault: &VaultConfig) -> Result<(), ConfigError> {
    let master_secret = vault.master_secret.expose_secret();
    if master_secret.trim().is_empty() {
        return Err(ConfigError::Validation(
            "vault.master_secret is required. Set it in keyvault.toml or via KEYVAULT_MASTER_SECRET"
                .to_string(),
        ));
    }
    if master_secret.len() < 16 {
        return Err(ConfigError::Validation(
            "vault.master_secret must be at least 16 characters".to_string(),
        ));
    }

    // Floor, not a recommendation: weaker derivation refuses to start.
    if vault.kdf_iterations < 10_000 {
        return Err(ConfigError::Validation(
            "vault.kdf_iterations must be at least 10000".to_string(),
        ));
    }

    if vault.cache_ttl_secs == 0 || vault.cache_ttl_secs > 3_600 {
        return Err(ConfigError::Validation(
            "vault.cache_ttl_secs must be in range 1..=3600".to_string(),
        ));
    }

    if vault.session_ttl_secs < 60 || vault.session_ttl_secs > 604_800 {
        return Err(ConfigError::Validation(
            "vault.session_ttl_secs must be in range 60..=604800".to_string(),
        ));
    }

    if vault.default_expiry_days < 1 || vault.default_expiry_days > 365 {
        return Err(ConfigError::Validation(
            "vault.default_expiry_days must be in range 1..=365".to_string(),
        ));
    }

    if vault.store_timeout_secs == 0 || vault.store_timeout_secs > 60 {
        return Err(ConfigError::Validation(
            "vault.store_timeout_secs must be in range 1..=60".to_string(),
        ));
    }

    if vault.max_cached_users == 0 {
        return Err(ConfigError::Validation(
            "vault.max_cached_users must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    vault: Option<VaultPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct VaultPatch {
    master_secret: Option<String>,
    kdf_iterations: Option<u32>,
    cache_ttl_secs: Option<u64>,
    session_ttl_secs: Option<u64>,
    default_expiry_days: Option<i64>,
    store_timeout_secs: Option<u64>,
    max_cached_users: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_VAULT_MASTER_SECRET", "interpolated-master-secret");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("keyvault.toml");
            fs::write(
                &path,
                r#"
[vault]
master_secret = "${TEST_VAULT_MASTER_SECRET}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.vault.master_secret.expose_secret() == "interpolated-master-secret",
                "master secret should be loaded from environment",
            )
        })();

        clear_vars(&["TEST_VAULT_MASTER_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KEYVAULT_MASTER_SECRET", "a-long-enough-test-secret");
        env::set_var("KEYVAULT_LOG_LEVEL", "warn");
        env::set_var("KEYVAULT_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warn log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["KEYVAULT_MASTER_SECRET", "KEYVAULT_LOG_LEVEL", "KEYVAULT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KEYVAULT_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("KEYVAULT_MASTER_SECRET", "master-secret-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("keyvault.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[vault]
master_secret = "master-secret-from-file"
cache_ttl_secs = 120

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url.as_deref() == Some("sqlite://from-override.db"),
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.vault.master_secret.expose_secret() == "master-secret-from-env",
                "env master secret should win over file and defaults",
            )?;
            ensure(config.vault.cache_ttl_secs == 120, "file cache ttl should win over default")
        })();

        clear_vars(&["KEYVAULT_DATABASE_URL", "KEYVAULT_MASTER_SECRET"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        clear_vars(&["KEYVAULT_MASTER_SECRET"]);

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("vault.master_secret")
        );
        ensure(has_message, "validation failure should mention vault.master_secret")
    }

    #[test]
    fn weak_kdf_iteration_floor_is_enforced() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KEYVAULT_MASTER_SECRET", "a-long-enough-test-secret");
        env::set_var("KEYVAULT_KDF_ITERATIONS", "500");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected kdf validation failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(error, ConfigError::Validation(ref message) if message.contains("kdf_iterations")),
                "validation failure should mention kdf_iterations",
            )
        })();

        clear_vars(&["KEYVAULT_MASTER_SECRET", "KEYVAULT_KDF_ITERATIONS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KEYVAULT_MASTER_SECRET", "super-secret-master-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("super-secret-master-value"),
                "debug output should not contain the master secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["KEYVAULT_MASTER_SECRET"]);
        result
    }

    #[test]
    fn missing_database_url_selects_cache_only_mode() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KEYVAULT_MASTER_SECRET", "a-long-enough-test-secret");
        clear_vars(&["KEYVAULT_DATABASE_URL"]);

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(config.database.url.is_none(), "default config should have no database url")
        })();

        clear_vars(&["KEYVAULT_MASTER_SECRET"]);
        result
    }
}
