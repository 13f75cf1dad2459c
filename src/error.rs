use crate::business::BusinessError;
use crate::channel::DeliveryError;
use crate::config::ConfigError;
use crate::listener::ListenerError;
use crate::store::StoreError;

/// Any error this crate's services can return.
///
/// Only [`Error::Business`] reaches clients with its own code; see
/// [`crate::business::translate`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Business(#[from] BusinessError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn as_business(&self) -> Option<&BusinessError> {
        match self {
            Error::Business(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
