//! Error taxonomy shared by every Scape crate.
//!
//! Lookup and validation failures propagate to the caller. Timeouts are not
//! errors: a request that never gets an answer resolves to a sentinel reply.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScapeError {
    #[error("device {service}:{id} not found")]
    DeviceNotFound { service: String, id: String },

    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("function {function} not found on service {service}")]
    FunctionNotFound { service: String, function: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid cipher: {0}")]
    InvalidCipher(String),

    #[error("cannot link to other linked device")]
    CannotLinkToLinkedDevice,

    #[error("device cannot be linked to itself")]
    SelfLink,

    #[error("device {service}:{id} uses linked encryption and cannot be reconfigured")]
    LinkedDeviceReadOnly { service: String, id: String },

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("not authorized for device {0}")]
    Unauthorized(String),

    #[error("request {0} was cancelled")]
    Cancelled(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScapeError {
    pub fn device_not_found(service: &str, id: &str) -> Self {
        ScapeError::DeviceNotFound {
            service: service.to_string(),
            id: id.to_string(),
        }
    }

    pub fn function_not_found(service: &str, function: &str) -> Self {
        ScapeError::FunctionNotFound {
            service: service.to_string(),
            function: function.to_string(),
        }
    }
}
