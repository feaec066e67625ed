//! Error types for fleetrelay
//!
//! Low-level failures are normalized once, at the device/mesh executor
//! boundary, into stable machine codes. `Error::code()` exposes the code for
//! classification; variants without a code classify as unknown.

use thiserror::Error;

/// Result type alias using fleetrelay Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stable machine codes shared across the relay
pub mod codes {
    // Setup family: misconfiguration, not retryable
    pub const MESH_INTERFACE_NOT_CONFIGURED: &str = "MESH_INTERFACE_NOT_CONFIGURED";
    pub const DEVICE_NODES_NOT_CONFIGURED: &str = "DEVICE_NODES_NOT_CONFIGURED";
    pub const DEVICE_NODES_INVALID_JSON: &str = "DEVICE_NODES_INVALID_JSON";
    pub const DEVICE_NODE_NOT_FOUND: &str = "DEVICE_NODE_NOT_FOUND";
    pub const ROUTER_NOT_RESOLVED: &str = "router_not_resolved";
    pub const MISSING_IP_OR_MAC: &str = "missing_ip_or_mac";

    // Auth family: credential/permission failures, not retryable
    pub const DEVICE_AUTH_FAILED: &str = "DEVICE_AUTH_FAILED";
    pub const DEVICE_PERMISSION_DENIED: &str = "DEVICE_PERMISSION_DENIED";

    // Transient family: retryable with backoff
    pub const MESH_COMMAND_FAILED: &str = "MESH_COMMAND_FAILED";
    pub const MESH_LIST_PEERS_FAILED: &str = "MESH_LIST_PEERS_FAILED";
    pub const DEVICE_TIMEOUT: &str = "DEVICE_TIMEOUT";
    pub const DEVICE_UNREACHABLE: &str = "DEVICE_UNREACHABLE";
    pub const DEVICE_CONNECTION_RESET: &str = "DEVICE_CONNECTION_RESET";
    pub const DEVICE_DNS_NOT_FOUND: &str = "DEVICE_DNS_NOT_FOUND";
    pub const DEVICE_PROTOCOL_ERROR: &str = "DEVICE_PROTOCOL_ERROR";

    // Inconsistent family: malformed/contradictory inbound events
    pub const EVENT_INVALID_SCHEMA: &str = "EVENT_INVALID_SCHEMA";
    pub const EVENT_INCONSISTENT: &str = "EVENT_INCONSISTENT";

    // Fallbacks
    pub const DEVICE_UNKNOWN_ERROR: &str = "DEVICE_UNKNOWN_ERROR";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// Fleetrelay error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Device error [{code}]: {message}")]
    Device { code: String, message: String },

    #[error("Mesh error [{code}]: {message}")]
    Mesh { code: String, message: String },

    #[error("Event error [{code}]: {message}")]
    Event { code: String, message: String },

    #[error("Device node table is not configured")]
    NodesNotConfigured,

    #[error("Device node table is invalid: {0}")]
    NodesInvalid(String),

    #[error("Device node not found: {bus_id}")]
    NodeNotFound { bus_id: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a device error carrying a stable code
    pub fn device(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Device {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a mesh error carrying a stable code
    pub fn mesh(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mesh {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build an inbound-event error carrying a stable code
    pub fn event(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Event {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable machine code, when this error carries one
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Device { code, .. } | Error::Mesh { code, .. } | Error::Event { code, .. } => {
                Some(code)
            }
            Error::NodesNotConfigured => Some(codes::DEVICE_NODES_NOT_CONFIGURED),
            Error::NodesInvalid(_) => Some(codes::DEVICE_NODES_INVALID_JSON),
            Error::NodeNotFound { .. } => Some(codes::DEVICE_NODE_NOT_FOUND),
            _ => None,
        }
    }
}
