use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

// 64 * T1, same bound as INVITE Timer B
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 32_000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 32_000;
// Proxy INVITE Timer C
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 180_000;

pub const DEFAULT_DTMF_DURATION_MS: u64 = 100;
pub const DEFAULT_DTMF_INTER_TONE_GAP_MS: u64 = 70;

/// Per-client settings shared by every call session.
///
/// Timeouts are optional; `None` waits forever for the correlated reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub domain: String,
    pub via_host: String,
    pub via_transport: String,
    pub refer_domain: String,
    pub user_agent: String,
    pub stun_servers: Vec<String>,
    pub request_timeout_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
    pub transfer_timeout_ms: Option<u64>,
    pub dtmf_duration_ms: u64,
    pub dtmf_inter_tone_gap_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            domain: "sip.ringcentral.com".to_string(),
            via_host: format!("{}.invalid", Uuid::new_v4()),
            via_transport: "WSS".to_string(),
            refer_domain: "sip.ringcentral.com".to_string(),
            user_agent: format!("rs_webphone/{}", env!("CARGO_PKG_VERSION")),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            request_timeout_ms: Some(DEFAULT_REQUEST_TIMEOUT_MS),
            command_timeout_ms: Some(DEFAULT_COMMAND_TIMEOUT_MS),
            transfer_timeout_ms: Some(DEFAULT_TRANSFER_TIMEOUT_MS),
            dtmf_duration_ms: DEFAULT_DTMF_DURATION_MS,
            dtmf_inter_tone_gap_ms: DEFAULT_DTMF_INTER_TONE_GAP_MS,
        }
    }
}

impl SessionConfig {
    pub fn new(domain: &str) -> Self {
        SessionConfig {
            domain: domain.to_string(),
            refer_domain: domain.to_string(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_via_host(mut self, host: &str) -> Self {
        self.via_host = host.to_string();
        self
    }

    pub fn with_refer_domain(mut self, domain: &str) -> Self {
        self.refer_domain = domain.to_string();
        self
    }

    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_ms.map(Duration::from_millis)
    }

    pub fn dtmf_duration(&self) -> Duration {
        Duration::from_millis(self.dtmf_duration_ms)
    }

    pub fn dtmf_inter_tone_gap(&self) -> Duration {
        Duration::from_millis(self.dtmf_inter_tone_gap_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert!(config.via_host.ends_with(".invalid"));
        assert_eq!(config.via_transport, "WSS");
        assert_eq!(config.stun_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(32)));
        assert_eq!(config.dtmf_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SessionConfig::from_json(
            r#"{"domain":"sip.example.com","command_timeout_ms":null}"#,
        )
        .unwrap();
        assert_eq!(config.domain, "sip.example.com");
        assert_eq!(config.command_timeout(), None);
        assert_eq!(config.transfer_timeout(), Some(Duration::from_secs(180)));
    }

    #[test]
    fn test_builder_setters() {
        let config = SessionConfig::new("pbx.example.com")
            .with_via_host("client.invalid")
            .with_request_timeout(None)
            .with_transfer_timeout(Some(Duration::from_millis(250)));
        assert_eq!(config.refer_domain, "pbx.example.com");
        assert_eq!(config.via_host, "client.invalid");
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.transfer_timeout_ms, Some(250));
    }
}
