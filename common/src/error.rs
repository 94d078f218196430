use thiserror::Error;

/// A textual request parameter that could not be turned into a bounded value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid `{field}`: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: ValidationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationReason {
    #[error("value is required")]
    Missing,
    #[error("not a decimal or 0x-prefixed hex number")]
    Malformed,
    #[error("must be between 0 and 255")]
    OutOfRange,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: ValidationReason) -> Self {
        Self { field, reason }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("failed to encode record `{key}`: {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransmitError {
    #[error("IR transmitter is disabled")]
    Disabled,
    #[error("IR driver failure: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("station configuration rejected: {0}")]
    Configuration(String),
    #[error("station driver failure: {0}")]
    Driver(String),
}
