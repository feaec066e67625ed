//! Error classification for health tracking and retry policy
//!
//! Classification happens once at the orchestration boundary and is never
//! re-derived downstream. The companion normalizer maps raw transport
//! failures onto the same stable code vocabulary before classification.

use crate::error::{codes, Error};

const SETUP_CODES: &[&str] = &[
    codes::MESH_INTERFACE_NOT_CONFIGURED,
    codes::DEVICE_NODES_NOT_CONFIGURED,
    codes::DEVICE_NODES_INVALID_JSON,
    codes::DEVICE_NODE_NOT_FOUND,
    codes::ROUTER_NOT_RESOLVED,
    codes::MISSING_IP_OR_MAC,
];

const AUTH_CODES: &[&str] = &[codes::DEVICE_AUTH_FAILED, codes::DEVICE_PERMISSION_DENIED];

const TRANSIENT_CODES: &[&str] = &[
    codes::MESH_COMMAND_FAILED,
    codes::MESH_LIST_PEERS_FAILED,
    codes::DEVICE_TIMEOUT,
    codes::DEVICE_UNREACHABLE,
    codes::DEVICE_CONNECTION_RESET,
    codes::DEVICE_DNS_NOT_FOUND,
    codes::DEVICE_PROTOCOL_ERROR,
];

const INCONSISTENT_CODES: &[&str] = &[codes::EVENT_INVALID_SCHEMA, codes::EVENT_INCONSISTENT];

const SETUP_CIRCUIT_MS: i64 = 10 * 60 * 1000;
const AUTH_CIRCUIT_MS: i64 = 15 * 60 * 1000;

/// Closed error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Setup,
    Auth,
    Transient,
    Inconsistent,
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Setup => write!(f, "setup"),
            ErrorClass::Auth => write!(f, "auth"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Inconsistent => write!(f, "inconsistent"),
            ErrorClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of classifying an error
#[derive(Debug, Clone)]
pub struct Classification {
    pub class: ErrorClass,
    pub code: String,
    pub retryable: bool,
    /// How long the device circuit should stay open, for setup/auth failures
    pub open_circuit_ms: Option<i64>,
}

/// Classify an error by its stable code. Rules are checked in order; the
/// first match wins. Errors without a code classify as unknown.
pub fn classify(err: &Error) -> Classification {
    let code = match err.code() {
        Some(c) => c,
        None => return unknown(codes::UNKNOWN_ERROR),
    };

    if SETUP_CODES.contains(&code) {
        return Classification {
            class: ErrorClass::Setup,
            code: code.to_string(),
            retryable: false,
            open_circuit_ms: Some(SETUP_CIRCUIT_MS),
        };
    }
    if AUTH_CODES.contains(&code) {
        return Classification {
            class: ErrorClass::Auth,
            code: code.to_string(),
            retryable: false,
            open_circuit_ms: Some(AUTH_CIRCUIT_MS),
        };
    }
    if TRANSIENT_CODES.contains(&code) {
        return Classification {
            class: ErrorClass::Transient,
            code: code.to_string(),
            retryable: true,
            open_circuit_ms: None,
        };
    }
    if INCONSISTENT_CODES.contains(&code) {
        return Classification {
            class: ErrorClass::Inconsistent,
            code: code.to_string(),
            retryable: false,
            open_circuit_ms: None,
        };
    }

    unknown(code)
}

fn unknown(code: &str) -> Classification {
    Classification {
        class: ErrorClass::Unknown,
        code: code.to_string(),
        retryable: false,
        open_circuit_ms: None,
    }
}

/// Map a raw device transport failure onto a stable code.
///
/// Codes already in the setup family pass through unchanged; everything else
/// is matched by message substring, falling back to `DEVICE_UNKNOWN_ERROR`.
pub fn normalize_device_code(existing_code: Option<&str>, message: &str) -> &'static str {
    match existing_code {
        Some(codes::DEVICE_NODES_NOT_CONFIGURED) => return codes::DEVICE_NODES_NOT_CONFIGURED,
        Some(codes::DEVICE_NODES_INVALID_JSON) => return codes::DEVICE_NODES_INVALID_JSON,
        Some(codes::DEVICE_NODE_NOT_FOUND) => return codes::DEVICE_NODE_NOT_FOUND,
        _ => {}
    }

    let msg = message.to_lowercase();

    if msg.contains("invalid user")
        || (msg.contains("password") && msg.contains("invalid"))
        || msg.contains("authentication failed")
        || msg.contains("login failure")
        || msg.contains("not logged in")
    {
        return codes::DEVICE_AUTH_FAILED;
    }
    if msg.contains("permission denied")
        || msg.contains("not enough permissions")
        || msg.contains("forbidden")
    {
        return codes::DEVICE_PERMISSION_DENIED;
    }

    if msg.contains("timeout") || msg.contains("timed out") {
        return codes::DEVICE_TIMEOUT;
    }
    if msg.contains("failed to lookup") || msg.contains("name resolution") || msg.contains("dns") {
        return codes::DEVICE_DNS_NOT_FOUND;
    }
    if msg.contains("reset") {
        return codes::DEVICE_CONNECTION_RESET;
    }
    if msg.contains("refused") || msg.contains("unreach") {
        return codes::DEVICE_UNREACHABLE;
    }

    if msg.contains("protocol")
        || msg.contains("bad response")
        || msg.contains("malformed")
        || msg.contains("parse")
    {
        return codes::DEVICE_PROTOCOL_ERROR;
    }

    codes::DEVICE_UNKNOWN_ERROR
}

/// Normalize a transport-level io error from a device connection
pub fn normalize_io_error(err: &std::io::Error) -> &'static str {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => codes::DEVICE_TIMEOUT,
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => codes::DEVICE_CONNECTION_RESET,
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted | ErrorKind::NotConnected => {
            codes::DEVICE_UNREACHABLE
        }
        _ => normalize_device_code(None, &err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_code_is_unknown() {
        let err = Error::Internal("boom".to_string());
        let cls = classify(&err);
        assert_eq!(cls.class, ErrorClass::Unknown);
        assert_eq!(cls.code, codes::UNKNOWN_ERROR);
        assert!(!cls.retryable);
        assert!(cls.open_circuit_ms.is_none());
    }

    #[test]
    fn test_setup_codes_open_long_circuit() {
        let err = Error::NodeNotFound {
            bus_id: "HOTSPOT-01".to_string(),
        };
        let cls = classify(&err);
        assert_eq!(cls.class, ErrorClass::Setup);
        assert!(!cls.retryable);
        assert_eq!(cls.open_circuit_ms, Some(10 * 60 * 1000));
    }

    #[test]
    fn test_auth_codes_open_longer_circuit() {
        let err = Error::device(codes::DEVICE_AUTH_FAILED, "invalid user name or password");
        let cls = classify(&err);
        assert_eq!(cls.class, ErrorClass::Auth);
        assert!(!cls.retryable);
        assert_eq!(cls.open_circuit_ms, Some(15 * 60 * 1000));
    }

    #[test]
    fn test_transient_codes_are_retryable_without_circuit() {
        for code in [
            codes::DEVICE_TIMEOUT,
            codes::DEVICE_UNREACHABLE,
            codes::MESH_LIST_PEERS_FAILED,
        ] {
            let cls = classify(&Error::device(code, "x"));
            assert_eq!(cls.class, ErrorClass::Transient);
            assert!(cls.retryable);
            assert!(cls.open_circuit_ms.is_none());
        }
    }

    #[test]
    fn test_inconsistent_codes() {
        let cls = classify(&Error::event(codes::EVENT_INVALID_SCHEMA, "missing field"));
        assert_eq!(cls.class, ErrorClass::Inconsistent);
        assert!(!cls.retryable);
    }

    #[test]
    fn test_unrecognized_code_is_unknown() {
        let cls = classify(&Error::device("SOMETHING_ELSE", "x"));
        assert_eq!(cls.class, ErrorClass::Unknown);
        assert_eq!(cls.code, "SOMETHING_ELSE");
    }

    #[test]
    fn test_normalizer_auth_strings() {
        assert_eq!(
            normalize_device_code(None, "Invalid user name or password"),
            codes::DEVICE_AUTH_FAILED
        );
        assert_eq!(
            normalize_device_code(None, "not enough permissions (9)"),
            codes::DEVICE_PERMISSION_DENIED
        );
    }

    #[test]
    fn test_normalizer_network_strings() {
        assert_eq!(
            normalize_device_code(None, "connection timed out"),
            codes::DEVICE_TIMEOUT
        );
        assert_eq!(
            normalize_device_code(None, "connection reset by peer"),
            codes::DEVICE_CONNECTION_RESET
        );
        assert_eq!(
            normalize_device_code(None, "network unreachable"),
            codes::DEVICE_UNREACHABLE
        );
        assert_eq!(
            normalize_device_code(None, "failed to lookup address information"),
            codes::DEVICE_DNS_NOT_FOUND
        );
    }

    #[test]
    fn test_normalizer_protocol_and_fallback() {
        assert_eq!(
            normalize_device_code(None, "malformed reply sentence"),
            codes::DEVICE_PROTOCOL_ERROR
        );
        assert_eq!(
            normalize_device_code(None, "something odd"),
            codes::DEVICE_UNKNOWN_ERROR
        );
    }

    #[test]
    fn test_normalizer_preserves_setup_codes() {
        assert_eq!(
            normalize_device_code(Some(codes::DEVICE_NODE_NOT_FOUND), "connection timed out"),
            codes::DEVICE_NODE_NOT_FOUND
        );
    }
}
