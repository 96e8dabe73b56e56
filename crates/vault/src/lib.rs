pub mod bootstrap;
pub mod cache_only;
pub mod vault;

pub use bootstrap::{bootstrap, bootstrap_with_config, init_logging, BootstrapError, VaultRuntime};
pub use cache_only::CacheOnlyVault;
pub use vault::{
    CapabilitySet, DurableVault, MissingService, Vault, VaultMode, VaultStatus, VaultTuning,
};
