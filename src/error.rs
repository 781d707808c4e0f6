//! Error types for iSCSI target operations

use thiserror::Error;

/// iSCSI target errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Digest mismatch: {0}")]
    Digest(String),
}

/// Result type for SCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;

/// Turn an RFC 3720 Login Response status class/detail pair into a
/// human-readable, actionable message. Used by clients and tools that
/// surface login failures to an operator rather than just a hex code.
pub fn decode_login_status(status_class: u8, status_detail: u8) -> String {
    match (status_class, status_detail) {
        (0x00, 0x00) => "Login success".to_string(),
        (0x01, 0x01) => {
            "Target moved temporarily: retry the login against the TargetAddress given in the redirect, the portal may come back".to_string()
        }
        (0x01, 0x02) => {
            "Target moved permanently: update your initiator's configuration to use the new TargetAddress".to_string()
        }
        (0x02, 0x00) => "Authentication failure: the initiator could not be authenticated".to_string(),
        (0x02, 0x01) => {
            "Authentication failed: check the username and password/CHAP secret configured on the initiator".to_string()
        }
        (0x02, 0x02) => {
            "Authorization failure: the initiator is not permitted to access this target, check the ACL (e.g. tgtadm --op bind --lld iscsi)".to_string()
        }
        (0x02, 0x03) => {
            "Target not found: the TargetName doesn't exist on this portal, run discovery (SendTargets) to list what's available".to_string()
        }
        (0x02, 0x04) => "Target removed: this target has been removed and is no longer available".to_string(),
        (0x02, 0x05) => {
            "Unsupported version: the initiator requested an iSCSI protocol version this target does not support".to_string()
        }
        (0x02, 0x06) => {
            "Too many connections: the session has reached its MaxConnections limit, close an existing connection first".to_string()
        }
        (0x02, 0x07) => {
            "Missing parameter: a required login parameter was not supplied (InitiatorName and TargetName are both required)".to_string()
        }
        (0x02, 0x08) => {
            "Cannot include in session: the connection could not be added to the requested session".to_string()
        }
        (0x02, 0x09) => {
            "Session type not supported: this target does not support the requested SessionType, check TargetName vs. discovery".to_string()
        }
        (0x02, 0x0A) => "Session does not exist: the TSIH given does not match any session on this target".to_string(),
        (0x02, 0x0B) => {
            "Invalid request during login: the PDU sequence or parameters were invalid for the current login stage".to_string()
        }
        (0x03, 0x00) => "Target error: an unexpected target-side condition prevented the login from completing".to_string(),
        (0x03, 0x01) => {
            "Service unavailable: the target is temporarily unable to accept logins (e.g. shutting down), wait and retry".to_string()
        }
        (0x03, 0x02) => "Out of resources: the target could not allocate the resources needed for this login".to_string(),
        (class, detail) => format!(
            "Unknown or unrecognized login status 0x{:02x}{:02x} (see RFC 3720 section 10.13.5)",
            class, detail
        ),
    }
}
