pub mod cache;
pub mod config;
pub mod domain;
pub mod envelope;
pub mod errors;
pub mod registry;

pub use chrono;

pub use cache::SessionCache;
pub use domain::credential::{Credential, CredentialId, CredentialStatus};
pub use envelope::{CipherError, EnvelopeCipher, KeyBundle};
pub use errors::SubmitError;
pub use registry::{ServiceDescriptor, ServiceKind, ServiceRegistry};
