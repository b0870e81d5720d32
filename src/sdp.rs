use std::fmt;
use std::str::FromStr;

use crate::{Result, SessionError};

// Session origin (o=)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: u64,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

impl fmt::Display for SessionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.username,
            self.session_id,
            self.session_version,
            self.network_type,
            self.address_type,
            self.address
        )
    }
}

// Media direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    fn from_attribute(value: &str) -> Option<Self> {
        match value {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

/// One SDP line. Only the lines the session rewrites are typed; everything
/// else is carried through untouched so re-offers stay byte-compatible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpLine {
    Origin(SessionOrigin),
    Direction(MediaDirection),
    Media(String),
    Other { kind: char, value: String },
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpLine::Origin(origin) => write!(f, "o={}", origin),
            SdpLine::Direction(direction) => write!(f, "a={}", direction.as_str()),
            SdpLine::Media(value) => write!(f, "m={}", value),
            SdpLine::Other { kind, value } => write!(f, "{}={}", kind, value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    lines: Vec<SdpLine>,
}

impl SessionDescription {
    pub fn parse(sdp: &str) -> Result<Self> {
        SdpParser::parse(sdp)
    }

    pub fn origin(&self) -> Option<&SessionOrigin> {
        self.lines.iter().find_map(|line| match line {
            SdpLine::Origin(origin) => Some(origin),
            _ => None,
        })
    }

    pub fn session_version(&self) -> u64 {
        self.origin().map_or(0, |origin| origin.session_version)
    }

    pub fn set_session_version(&mut self, version: u64) {
        for line in &mut self.lines {
            if let SdpLine::Origin(origin) = line {
                origin.session_version = version;
            }
        }
    }

    /// Rewrites every `from` direction attribute to `to`; returns how many changed.
    pub fn replace_direction(&mut self, from: MediaDirection, to: MediaDirection) -> usize {
        let mut replaced = 0;
        for line in &mut self.lines {
            if let SdpLine::Direction(direction) = line {
                if *direction == from {
                    *direction = to;
                    replaced += 1;
                }
            }
        }
        replaced
    }

    pub fn directions(&self) -> impl Iterator<Item = MediaDirection> + '_ {
        self.lines.iter().filter_map(|line| match line {
            SdpLine::Direction(direction) => Some(*direction),
            _ => None,
        })
    }

    pub fn media_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, SdpLine::Media(_)))
            .count()
    }

    pub fn to_sdp(&self) -> String {
        let mut sdp = String::new();
        for line in &self.lines {
            sdp.push_str(&line.to_string());
            sdp.push_str("\r\n");
        }
        sdp
    }
}

impl FromStr for SessionDescription {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        SessionDescription::parse(s)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sdp())
    }
}

// SDP Parser
pub struct SdpParser;

impl SdpParser {
    pub fn parse(sdp: &str) -> Result<SessionDescription> {
        let mut lines = Vec::new();
        let mut has_origin = false;

        for line in sdp.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            // <type>=<value> where type is a single ASCII character
            let (kind, value) = match line.split_once('=') {
                Some((key, value)) if key.len() == 1 && key.is_ascii() => {
                    (char::from(key.as_bytes()[0]), value)
                }
                _ => return Err(SessionError::Sdp(format!("Malformed line: {}", line))),
            };

            let parsed = match kind {
                'o' => {
                    has_origin = true;
                    SdpLine::Origin(Self::parse_origin(value)?)
                }
                'm' => SdpLine::Media(value.to_string()),
                'a' => match MediaDirection::from_attribute(value) {
                    Some(direction) => SdpLine::Direction(direction),
                    None => SdpLine::Other {
                        kind,
                        value: value.to_string(),
                    },
                },
                _ => SdpLine::Other {
                    kind,
                    value: value.to_string(),
                },
            };
            lines.push(parsed);
        }

        if !has_origin {
            return Err(SessionError::Sdp("Missing origin line".to_string()));
        }

        Ok(SessionDescription { lines })
    }

    fn parse_origin(value: &str) -> Result<SessionOrigin> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(SessionError::Sdp("Invalid origin line".to_string()));
        }

        Ok(SessionOrigin {
            username: parts[0].to_string(),
            session_id: parts[1].to_string(),
            session_version: parts[2]
                .parse()
                .map_err(|_| SessionError::Sdp("Invalid session version".to_string()))?,
            network_type: parts[3].to_string(),
            address_type: parts[4].to_string(),
            address: parts[5].to_string(),
        })
    }
}
