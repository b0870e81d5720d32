use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{CSeqHeader, HeaderName, Result, SessionError, SipMethod, ViaHeader, generate_tag};

// SIP Message structure
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: HeaderMap,
    pub body: Option<MessageBody>,
}

// Start line variants
#[derive(Debug, Clone)]
pub enum StartLine {
    Request(RequestLine),
    Response(StatusLine),
}

// Request line
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
}

// Status line
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request(req) => write!(f, "{} {} {}", req.method, req.uri, req.version),
            StartLine::Response(resp) => {
                write!(f, "{} {} {}", resp.version, resp.status_code, resp.reason_phrase)
            }
        }
    }
}

// Header storage, case-insensitive lookup, insertion order kept
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    headers: HashMap<HeaderName, Vec<String>>,
    order: Vec<HeaderName>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap::default()
    }

    pub fn add(&mut self, name: HeaderName, value: String) {
        let values = self.headers.entry(name.clone()).or_default();
        values.push(value);
        if values.len() == 1 {
            self.order.push(name);
        }
    }

    pub fn set(&mut self, name: HeaderName, value: String) {
        self.headers.insert(name.clone(), vec![value]);
        if !self.order.contains(&name) {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        let header_name = HeaderName::new(name);
        self.headers.get(&header_name).and_then(|v| v.first())
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        let header_name = HeaderName::new(name);
        self.headers
            .get(&header_name)
            .map(|values| values.as_slice())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        let header_name = HeaderName::new(name);
        self.headers.contains_key(&header_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &Vec<String>)> {
        self.order
            .iter()
            .filter_map(move |name| self.headers.get(name).map(|values| (name, values)))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

// Message body
#[derive(Debug, Clone)]
pub struct MessageBody {
    pub content_type: String,
    pub content: Vec<u8>,
}

impl MessageBody {
    pub fn new(content_type: String, content: Vec<u8>) -> Self {
        MessageBody {
            content_type,
            content,
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.content)
            .map_err(|_| SessionError::Parse("Invalid UTF-8 in body".to_string()))
    }
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start_line, StartLine::Response(_))
    }

    pub fn method(&self) -> Option<SipMethod> {
        match &self.start_line {
            StartLine::Request(req) => Some(req.method),
            _ => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request(req) => Some(&req.uri),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response(resp) => Some(resp.status_code),
            _ => None,
        }
    }

    /// The start line as text, e.g. `NOTIFY sip:alice@example.com SIP/2.0`.
    pub fn subject(&self) -> String {
        self.start_line.to_string()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn get_via(&self) -> Option<ViaHeader> {
        self.headers
            .get(HeaderName::VIA)
            .and_then(|v| ViaHeader::parse(v).ok())
    }

    pub fn get_from(&self) -> Option<&String> {
        self.headers.get(HeaderName::FROM)
    }

    pub fn get_to(&self) -> Option<&String> {
        self.headers.get(HeaderName::TO)
    }

    pub fn get_call_id(&self) -> Option<&String> {
        self.headers.get(HeaderName::CALL_ID)
    }

    pub fn get_cseq(&self) -> Option<CSeqHeader> {
        self.headers
            .get(HeaderName::CSEQ)
            .and_then(|v| CSeqHeader::parse(v).ok())
    }

    /// Body as text; empty when absent or not UTF-8.
    pub fn body_str(&self) -> &str {
        self.body
            .as_ref()
            .and_then(|body| body.as_str().ok())
            .unwrap_or_default()
    }

    pub fn set_body(&mut self, content_type: String, content: Vec<u8>) {
        let len = content.len();
        self.body = Some(MessageBody::new(content_type.clone(), content));
        self.headers
            .set(HeaderName::new(HeaderName::CONTENT_TYPE), content_type);
        self.headers
            .set(HeaderName::new(HeaderName::CONTENT_LENGTH), len.to_string());
    }

    /// Response to `request` carrying its Via, From, To, Call-ID and CSeq.
    pub fn response_to(request: &SipMessage, status_code: u16) -> SipMessage {
        let mut headers = HeaderMap::new();

        for via in request.headers.get_all(HeaderName::VIA) {
            headers.add(HeaderName::new(HeaderName::VIA), via.clone());
        }

        if let Some(from) = request.get_from() {
            headers.set(HeaderName::new(HeaderName::FROM), from.clone());
        }

        if let Some(to) = request.get_to() {
            // Final responses must carry a To tag
            let to_value = if status_code >= 200 && !to.contains("tag=") {
                format!("{};tag={}", to, generate_tag())
            } else {
                to.clone()
            };
            headers.set(HeaderName::new(HeaderName::TO), to_value);
        }

        if let Some(call_id) = request.get_call_id() {
            headers.set(HeaderName::new(HeaderName::CALL_ID), call_id.clone());
        }

        if let Some(cseq) = request.headers.get(HeaderName::CSEQ) {
            headers.set(HeaderName::new(HeaderName::CSEQ), cseq.clone());
        }

        headers.set(HeaderName::new(HeaderName::CONTENT_LENGTH), "0".to_string());

        SipMessage {
            start_line: StartLine::Response(StatusLine {
                version: "SIP/2.0".to_string(),
                status_code,
                reason_phrase: reason_phrase(status_code).to_string(),
            }),
            headers,
            body: None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.start_line)?;

        for (name, values) in self.headers.iter() {
            for value in values {
                write!(f, "{}: {}\r\n", format_header_name(name.as_str()), value)?;
            }
        }

        f.write_str("\r\n")?;

        if let Some(ref body) = self.body {
            f.write_str(&String::from_utf8_lossy(&body.content))?;
        }

        Ok(())
    }
}

impl FromStr for SipMessage {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        SipParser::parse(s.as_bytes()).map(|(message, _)| message)
    }
}

// Format header name with proper capitalization
fn format_header_name(name: &str) -> String {
    match name {
        "via" => "Via",
        "from" => "From",
        "to" => "To",
        "call-id" => "Call-ID",
        "cseq" => "CSeq",
        "contact" => "Contact",
        "content-type" => "Content-Type",
        "content-length" => "Content-Length",
        "max-forwards" => "Max-Forwards",
        "user-agent" => "User-Agent",
        "event" => "Event",
        "subscription-state" => "Subscription-State",
        "refer-to" => "Refer-To",
        "referred-by" => "Referred-By",
        _ => name,
    }
    .to_string()
}

// SIP Message Parser
pub struct SipParser;

impl SipParser {
    pub fn parse(data: &[u8]) -> Result<(SipMessage, usize)> {
        let mut parser = MessageParser::new(data);
        parser.parse()
    }
}

struct MessageParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageParser<'a> {
    fn new(data: &'a [u8]) -> Self {
        MessageParser { data, pos: 0 }
    }

    fn parse(&mut self) -> Result<(SipMessage, usize)> {
        let start_line = self.parse_start_line()?;

        let mut headers = HeaderMap::new();
        let body_start = self.parse_headers(&mut headers)?;

        // Missing Content-Length on a stream transport means "rest of frame"
        let content_length = headers
            .get(HeaderName::CONTENT_LENGTH)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(self.data.len() - body_start);

        if body_start + content_length > self.data.len() {
            return Err(SessionError::Parse("Truncated message body".to_string()));
        }

        let body = if content_length > 0 {
            let content_type = headers
                .get(HeaderName::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".to_string());

            let content = self.data[body_start..body_start + content_length].to_vec();
            Some(MessageBody::new(content_type, content))
        } else {
            None
        };

        Ok((
            SipMessage {
                start_line,
                headers,
                body,
            },
            body_start + content_length,
        ))
    }

    fn parse_start_line(&mut self) -> Result<StartLine> {
        let line = self.read_line()?;
        let parts: Vec<&str> = line.splitn(3, ' ').collect();

        if parts.len() < 3 {
            return Err(SessionError::Parse("Invalid start line".to_string()));
        }

        if parts[0].starts_with("SIP/") {
            let status_code = parts[1]
                .parse()
                .map_err(|_| SessionError::Parse("Invalid status code".to_string()))?;

            Ok(StartLine::Response(StatusLine {
                version: parts[0].to_string(),
                status_code,
                reason_phrase: parts[2].to_string(),
            }))
        } else {
            Ok(StartLine::Request(RequestLine {
                method: parts[0].parse()?,
                uri: parts[1].to_string(),
                version: parts[2].to_string(),
            }))
        }
    }

    fn parse_headers(&mut self, headers: &mut HeaderMap) -> Result<usize> {
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                return Ok(self.pos);
            }

            // Header folding
            let mut full_line = line.to_string();
            while self.peek_char() == Some(' ') || self.peek_char() == Some('\t') {
                let continuation = self.read_line()?;
                full_line.push(' ');
                full_line.push_str(continuation.trim());
            }

            if let Some(colon_pos) = full_line.find(':') {
                let name = full_line[..colon_pos].trim();
                let value = full_line[colon_pos + 1..].trim();

                headers.add(HeaderName::new(name), value.to_string());
            } else {
                return Err(SessionError::Parse(format!("Invalid header: {}", full_line)));
            }
        }
    }

    fn read_line(&mut self) -> Result<&'a str> {
        let start = self.pos;

        while self.pos < self.data.len() {
            if self.pos + 1 < self.data.len()
                && self.data[self.pos] == b'\r'
                && self.data[self.pos + 1] == b'\n'
            {
                let line = std::str::from_utf8(&self.data[start..self.pos])
                    .map_err(|_| SessionError::Parse("Invalid UTF-8 in header".to_string()))?;
                self.pos += 2;
                return Ok(line);
            }
            self.pos += 1;
        }

        Err(SessionError::Parse("Unexpected end of data".to_string()))
    }

    fn peek_char(&self) -> Option<char> {
        self.data.get(self.pos).map(|b| *b as char)
    }
}

// SIP Message Builder
#[derive(Default)]
pub struct SipMessageBuilder {
    method: Option<SipMethod>,
    uri: Option<String>,
    status_code: Option<u16>,
    headers: HeaderMap,
    body: Option<MessageBody>,
}

impl SipMessageBuilder {
    pub fn new() -> Self {
        SipMessageBuilder::default()
    }

    pub fn request(mut self, method: SipMethod, uri: &str) -> Self {
        self.method = Some(method);
        self.uri = Some(uri.to_string());
        self
    }

    pub fn response(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Replaces any existing value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(HeaderName::new(name), value.to_string());
        self
    }

    /// Appends, keeping earlier values (multiple Via).
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(HeaderName::new(name), value.to_string());
        self
    }

    pub fn body(mut self, content_type: &str, content: Vec<u8>) -> Self {
        self.body = Some(MessageBody::new(content_type.to_string(), content));
        self
    }

    pub fn build(mut self) -> Result<SipMessage> {
        let start_line = if let (Some(method), Some(uri)) = (self.method, self.uri) {
            StartLine::Request(RequestLine {
                method,
                uri,
                version: "SIP/2.0".to_string(),
            })
        } else if let Some(status_code) = self.status_code {
            StartLine::Response(StatusLine {
                version: "SIP/2.0".to_string(),
                status_code,
                reason_phrase: reason_phrase(status_code).to_string(),
            })
        } else {
            return Err(SessionError::InvalidState(
                "Must specify either request or response".to_string(),
            ));
        };

        if let Some(ref body) = self.body {
            self.headers.set(
                HeaderName::new(HeaderName::CONTENT_TYPE),
                body.content_type.clone(),
            );
            self.headers.set(
                HeaderName::new(HeaderName::CONTENT_LENGTH),
                body.content.len().to_string(),
            );
        } else if !self.headers.contains(HeaderName::CONTENT_LENGTH) {
            self.headers
                .set(HeaderName::new(HeaderName::CONTENT_LENGTH), "0".to_string());
        }

        if matches!(start_line, StartLine::Request(_))
            && !self.headers.contains(HeaderName::MAX_FORWARDS)
        {
            self.headers
                .set(HeaderName::new(HeaderName::MAX_FORWARDS), "70".to_string());
        }

        Ok(SipMessage {
            start_line,
            headers: self.headers,
            body: self.body,
        })
    }
}

// Response reason phrases
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",

        200 => "OK",
        202 => "Accepted",

        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",

        500 => "Server Internal Error",
        503 => "Service Unavailable",

        603 => "Decline",

        _ => "Unknown",
    }
}
