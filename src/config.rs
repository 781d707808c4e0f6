//! Target configuration: listen address, negotiation defaults, and the
//! backend retry policy. Kept separate from [`crate::target::IscsiTargetBuilder`]
//! so it can be loaded from TOML in tests and demos without dragging the
//! builder's generic device parameter along.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{IscsiError, ScsiResult};

/// Negotiation defaults and tunables issued by the target at login.
#[derive(Debug, Clone)]
pub struct NegotiationDefaults {
    pub max_recv_data_segment_length: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub default_time2wait: u32,
    pub default_time2retain: u32,
    pub max_outstanding_r2t: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u32,
    pub max_connections: u32,
    pub target_portal_group_tag: u32,
}

impl Default for NegotiationDefaults {
    fn default() -> Self {
        Self {
            max_recv_data_segment_length: 4096,
            max_burst_length: 4096,
            first_burst_length: 4096,
            default_time2wait: 1,
            default_time2retain: 0,
            max_outstanding_r2t: 1,
            initial_r2t: true,
            immediate_data: true,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            max_connections: 1,
            target_portal_group_tag: 1,
        }
    }
}

/// Retry policy for backend-transient failures (NBD reconnects). Replaces
/// the original's hardcoded infinite-retry-with-1s-sleep loop with an
/// injectable policy; the default preserves that behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            max_attempts: Some(1),
            backoff: Duration::from_millis(0),
        }
    }

    /// Whether another attempt is permitted after `attempts_so_far` failed
    /// attempts (0-based).
    pub fn should_retry(&self, attempts_so_far: u32) -> bool {
        match self.max_attempts {
            None => true,
            Some(max) => attempts_so_far + 1 < max,
        }
    }
}

/// Full target configuration.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub bind_addr: SocketAddr,
    pub target_name: String,
    pub range_lock_count: usize,
    pub negotiation: NegotiationDefaults,
    pub retry_policy: RetryPolicy,
    /// Cap on concurrent TCP connections across the whole target. `None`
    /// means unlimited. Exceeding it rejects login with
    /// TOO_MANY_CONNECTIONS (0x0206).
    pub max_connections: Option<usize>,
    /// Cap on sessions that have reached Full Feature Phase. `None` means
    /// unlimited. Exceeding it rejects login with OUT_OF_RESOURCES (0x0302).
    pub max_sessions: Option<usize>,
    /// Initiator IQN allow-list. `None` means any initiator is accepted.
    /// A non-matching InitiatorName is rejected with AUTHORIZATION_FAILURE
    /// (0x0202).
    pub allowed_initiators: Option<Vec<String>>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3260".parse().unwrap(),
            target_name: "iqn.2026-01.local:target".to_string(),
            range_lock_count: 128,
            negotiation: NegotiationDefaults::default(),
            retry_policy: RetryPolicy::default(),
            max_connections: None,
            max_sessions: None,
            allowed_initiators: None,
        }
    }
}

impl TargetConfig {
    pub fn validate(&self) -> ScsiResult<()> {
        if !self.target_name.starts_with("iqn.") {
            return Err(IscsiError::Config(format!(
                "target name must start with 'iqn.': {}",
                self.target_name
            )));
        }
        if self.range_lock_count == 0 {
            return Err(IscsiError::Config(
                "range_lock_count must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a subset of the target config from TOML, used by the demos and
    /// integration tests. Unspecified keys keep their default value.
    pub fn from_toml_str(s: &str) -> ScsiResult<Self> {
        let value: toml::Value = s
            .parse()
            .map_err(|e| IscsiError::Config(format!("invalid toml: {e}")))?;
        let mut cfg = TargetConfig::default();

        if let Some(addr) = value.get("bind_addr").and_then(|v| v.as_str()) {
            cfg.bind_addr = addr
                .parse()
                .map_err(|e| IscsiError::Config(format!("invalid bind_addr: {e}")))?;
        }
        if let Some(name) = value.get("target_name").and_then(|v| v.as_str()) {
            cfg.target_name = name.to_string();
        }
        if let Some(n) = value.get("range_lock_count").and_then(|v| v.as_integer()) {
            cfg.range_lock_count = n as usize;
        }
        if let Some(n) = value
            .get("max_recv_data_segment_length")
            .and_then(|v| v.as_integer())
        {
            cfg.negotiation.max_recv_data_segment_length = n as u32;
        }
        if let Some(n) = value.get("max_burst_length").and_then(|v| v.as_integer()) {
            cfg.negotiation.max_burst_length = n as u32;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_negotiation_table() {
        let d = NegotiationDefaults::default();
        assert_eq!(d.max_recv_data_segment_length, 4096);
        assert_eq!(d.max_burst_length, 4096);
        assert_eq!(d.first_burst_length, 4096);
        assert_eq!(d.default_time2wait, 1);
        assert_eq!(d.default_time2retain, 0);
        assert!(d.initial_r2t);
        assert!(d.immediate_data);
        assert_eq!(d.max_outstanding_r2t, 1);
        assert_eq!(d.error_recovery_level, 0);
        assert_eq!(d.max_connections, 1);
        assert_eq!(d.target_portal_group_tag, 1);
    }

    #[test]
    fn rejects_bad_target_name() {
        let mut cfg = TargetConfig::default();
        cfg.target_name = "not-an-iqn".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_policy_bounded() {
        let p = RetryPolicy {
            max_attempts: Some(3),
            backoff: Duration::from_millis(1),
        };
        assert!(p.should_retry(0));
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
    }

    #[test]
    fn from_toml_overrides_defaults() {
        let cfg = TargetConfig::from_toml_str(
            r#"
            bind_addr = "127.0.0.1:3260"
            target_name = "iqn.2026-01.local:disk0"
            range_lock_count = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.target_name, "iqn.2026-01.local:disk0");
        assert_eq!(cfg.range_lock_count, 4);
    }
}
