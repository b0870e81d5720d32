// Core error types
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::MediaError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("SDP error: {0}")]
    Sdp(String),

    /// Local capture could not be obtained; the session stays uninitialized.
    #[error("Failed to acquire local media: {0}")]
    MediaAcquisition(#[source] MediaError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: CallState, to: CallState },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Call session {0} is disposed")]
    Disposed(CallId),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    pub fn transport(message: impl Into<String>) -> Self {
        SessionError::Transport(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

// Common SIP types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Subscribe,
    Notify,
    Info,
    Refer,
    Message,
    Update,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Update => "UPDATE",
        }
    }
}

impl FromStr for SipMethod {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            "CANCEL" => Ok(SipMethod::Cancel),
            "OPTIONS" => Ok(SipMethod::Options),
            "REGISTER" => Ok(SipMethod::Register),
            "SUBSCRIBE" => Ok(SipMethod::Subscribe),
            "NOTIFY" => Ok(SipMethod::Notify),
            "INFO" => Ok(SipMethod::Info),
            "REFER" => Ok(SipMethod::Refer),
            "MESSAGE" => Ok(SipMethod::Message),
            "UPDATE" => Ok(SipMethod::Update),
            _ => Err(SessionError::Parse(format!("Unknown method: {}", s))),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Header name type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderName(pub String);

impl HeaderName {
    pub fn new(name: &str) -> Self {
        HeaderName(name.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Header names used by the call-control flows
impl HeaderName {
    pub const VIA: &'static str = "via";
    pub const FROM: &'static str = "from";
    pub const TO: &'static str = "to";
    pub const CALL_ID: &'static str = "call-id";
    pub const CSEQ: &'static str = "cseq";
    pub const CONTACT: &'static str = "contact";
    pub const MAX_FORWARDS: &'static str = "max-forwards";
    pub const CONTENT_TYPE: &'static str = "content-type";
    pub const CONTENT_LENGTH: &'static str = "content-length";
    pub const USER_AGENT: &'static str = "user-agent";
    pub const EVENT: &'static str = "event";
    pub const SUBSCRIPTION_STATE: &'static str = "subscription-state";
    pub const REFER_TO: &'static str = "refer-to";
    pub const REFERRED_BY: &'static str = "referred-by";
}

// Via header parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub protocol: String,
    pub version: String,
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub branch: String,
}

impl ViaHeader {
    pub fn new(transport: &str, host: &str, branch: &str) -> Self {
        ViaHeader {
            protocol: "SIP".to_string(),
            version: "2.0".to_string(),
            transport: transport.to_uppercase(),
            host: host.to_string(),
            port: None,
            branch: branch.to_string(),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.trim().splitn(2, char::is_whitespace);
        let sent_protocol = parts
            .next()
            .ok_or_else(|| SessionError::Parse("Invalid Via header".to_string()))?;
        let rest = parts
            .next()
            .ok_or_else(|| SessionError::Parse("Invalid Via header".to_string()))?;

        let protocol_parts: Vec<&str> = sent_protocol.split('/').collect();
        if protocol_parts.len() != 3 {
            return Err(SessionError::Parse("Invalid Via protocol".to_string()));
        }

        let mut params = rest.trim().split(';');
        let sent_by = params.next().unwrap_or_default().trim();
        let (host, port) = match sent_by.rfind(':') {
            Some(colon_pos) if !sent_by.ends_with(']') => (
                sent_by[..colon_pos].to_string(),
                sent_by[colon_pos + 1..].parse().ok(),
            ),
            _ => (sent_by.to_string(), None),
        };

        let branch = params
            .find_map(|param| param.trim().strip_prefix("branch="))
            .unwrap_or_default()
            .to_string();

        Ok(ViaHeader {
            protocol: protocol_parts[0].to_string(),
            version: protocol_parts[1].to_string(),
            transport: protocol_parts[2].to_string(),
            host,
            port,
            branch,
        })
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} {}", self.protocol, self.version, self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if !self.branch.is_empty() {
            write!(f, ";branch={}", self.branch)?;
        }
        Ok(())
    }
}

// CSeq header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeqHeader {
    pub sequence: u32,
    pub method: SipMethod,
}

impl CSeqHeader {
    pub fn new(sequence: u32, method: SipMethod) -> Self {
        CSeqHeader { sequence, method }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(SessionError::Parse("Invalid CSeq header".to_string()));
        }

        let sequence = parts[0]
            .parse()
            .map_err(|_| SessionError::Parse("Invalid CSeq number".to_string()))?;
        let method = parts[1].parse()?;

        Ok(CSeqHeader { sequence, method })
    }

    /// Same sequence number, different method token (INVITE -> ACK).
    pub fn with_method(&self, method: SipMethod) -> Self {
        CSeqHeader {
            sequence: self.sequence,
            method,
        }
    }
}

impl fmt::Display for CSeqHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sequence, self.method)
    }
}

// RFC 3261 magic cookie + unique suffix
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

pub fn generate_call_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn generate_tag() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..10].to_string()
}

/// Pulls the bare `user@host` out of a name-addr such as
/// `"Bob" <sip:bob@example.com>;tag=abc`.
pub fn extract_address(peer: &str) -> &str {
    let inner = match (peer.find('<'), peer.find('>')) {
        (Some(start), Some(end)) if start < end => &peer[start + 1..end],
        _ => peer.split(';').next().unwrap_or(peer),
    };
    let inner = inner.trim();
    inner
        .strip_prefix("sips:")
        .or_else(|| inner.strip_prefix("sip:"))
        .unwrap_or(inner)
}

// Call ID type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(pub String);

impl CallId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

// Call states, ordered along the only permitted direction of travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallState {
    Init,
    Ringing,
    Answered,
    Disposed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Init => "init",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Disposed => "disposed",
        }
    }

    /// Forward-only: any later state, and `Disposed` from anything non-terminal.
    pub fn can_advance_to(&self, next: CallState) -> bool {
        *self != CallState::Disposed && next > *self
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Events published on a session's own bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ringing,
    Answered,
    Disposed,
    TransferCompleted { target: String },
}
