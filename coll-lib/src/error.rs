use crate::api::CollId;

pub type Result<T> = std::result::Result<T, CollLibError>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CollLibError {
    /// Transient back-pressure from the transport. Never reported to the user
    /// of a collective: the send is retried by `progress`.
    #[error("no resources available")]
    NoResource,
    #[error("out of memory")]
    NoMemory,
    #[error("InvalidParam: {0}")]
    InvalidParam(&'static str),
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
    #[error("ConfigError: {0}")]
    Config(String),
    #[error("TransportError: {0}")]
    Transport(String),
    #[error("exceeded the max concurrent collectives (slot of {coll_id} is busy)")]
    SlotBusy { coll_id: CollId },
    #[error("CollLibError: {0}")]
    Custom(&'static str),
}

impl CollLibError {
    pub fn is_no_resource(&self) -> bool {
        matches!(self, CollLibError::NoResource)
    }
}
