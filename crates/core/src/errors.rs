use thiserror::Error;

use crate::envelope::CipherError;
use crate::registry::ServiceKind;

/// Failures a caller can see from `submit`. Validation failures are data,
/// not exceptions, so an integration layer cannot swallow them by accident.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("api key for `{service}` does not match the expected format")]
    InvalidFormat { service: ServiceKind },
    #[error("durable credential store is unavailable")]
    StoreUnavailable,
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("background key derivation task failed")]
    Worker,
}
