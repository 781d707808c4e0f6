//! Authentication method negotiation.
//!
//! Only `AuthMethod=None` is supported; CHAP/SRP negotiation is out of
//! scope. This module exists so the security-negotiation stage of login
//! has a typed place to live rather than being inlined into session.rs.

use crate::error::ScsiResult;

/// Authentication configuration for a target.
#[derive(Debug, Clone, Default)]
pub enum AuthConfig {
    /// No authentication required; initiators negotiate `AuthMethod=None`.
    #[default]
    None,
}

impl AuthConfig {
    pub fn auth_method(&self) -> &str {
        match self {
            AuthConfig::None => "None",
        }
    }
}

/// Validate the initiator's `AuthMethod` offer against `config`. Returns
/// the method to echo back, or an error if the initiator didn't offer
/// `None`.
pub fn negotiate(config: &AuthConfig, offered: Option<&str>) -> ScsiResult<&'static str> {
    let AuthConfig::None = config;
    match offered {
        None => Ok("None"),
        Some(methods) if methods.split(',').any(|m| m.trim() == "None") => Ok("None"),
        Some(_) => Err(crate::error::IscsiError::Auth(
            "AUTH_FAILURE: only AuthMethod=None is supported".to_string(),
        )),
    }
}
