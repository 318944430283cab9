//! HTTP/1.1 Upgrade handshake (RFC 6455 Section 4).
//!
//! Server side: parse and validate the client's upgrade request, answer
//! with `101 Switching Protocols` or an explicit rejection. Client side
//! (used by the probe): build a request and parse the server's answer.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::extensions::ExtensionOffer;

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers that must not appear twice in an upgrade request.
const SINGLETON_HEADERS: [&str; 5] = [
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
];

/// Computes the Sec-WebSocket-Accept value for a client key.
///
/// # Example
///
/// ```
/// use wsconform::protocol::handshake::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh Sec-WebSocket-Key (16 random bytes, base64).
///
/// # Errors
///
/// Returns `Error::Io` if the OS random source is unavailable.
pub fn generate_key() -> Result<String> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).map_err(|e| Error::Io(e.to_string()))?;
    Ok(BASE64.encode(nonce))
}

/// Check the Origin header against an allow-list.
///
/// An empty list accepts any origin, including none at all.
///
/// # Errors
///
/// Returns `Error::OriginNotAllowed` if the list is non-empty and the origin
/// is missing or not listed.
pub fn validate_origin(origin: Option<&str>, allowed: &[String]) -> Result<()> {
    if allowed.is_empty() {
        return Ok(());
    }
    match origin {
        Some(o) if allowed.iter().any(|a| a == o) => Ok(()),
        other => Err(Error::OriginNotAllowed {
            origin: other.unwrap_or("(none)").to_string(),
        }),
    }
}

/// Lower-cased header map of one HTTP message head.
#[derive(Debug, Default)]
struct Headers(HashMap<String, String>);

impl Headers {
    fn parse<'a>(lines: impl Iterator<Item = &'a str>, singletons: &[&str]) -> Result<Self> {
        let mut map = HashMap::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            if singletons.contains(&name.as_str()) && map.contains_key(&name) {
                return Err(Error::InvalidHandshake(format!("Duplicate header: {name}")));
            }
            let value = value.trim();
            // Repeated list headers are one comma-separated list (RFC 7230 3.2.2).
            map.entry(name)
                .and_modify(|v: &mut String| {
                    v.push_str(", ");
                    v.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        Ok(Self(map))
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn require(&self, name: &str, display: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::InvalidHandshake(format!("Missing {display} header")))
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check `Upgrade: websocket` and a `Connection` header naming upgrade.
    fn check_upgrade(&self) -> Result<()> {
        let upgrade = self.require("upgrade", "Upgrade")?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Upgrade header: {upgrade}"
            )));
        }
        let connection = self.require("connection", "Connection")?;
        let names_upgrade = connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        if !names_upgrade {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Connection header: {connection}"
            )));
        }
        Ok(())
    }
}

/// A client's upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Raw request target, path plus query (e.g. `/echo?x=1`).
    pub resource: String,
    /// The Host header value.
    pub host: String,
    /// The Sec-WebSocket-Key header value.
    pub key: String,
    /// The Sec-WebSocket-Version header value.
    pub version: u8,
    /// The Origin header value.
    pub origin: Option<String>,
    /// Sec-WebSocket-Protocol values in client preference order.
    pub protocols: Vec<String>,
    /// Raw Sec-WebSocket-Extensions entries in client order.
    pub extensions: Vec<String>,
}

impl HandshakeRequest {
    /// Parse an upgrade request from the raw message head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the request is not UTF-8, the
    /// request line is not `GET <target> HTTP/1.1`, a singleton header is
    /// duplicated, or a required header (`Host`, `Upgrade`, `Connection`,
    /// `Sec-WebSocket-Key`, `Sec-WebSocket-Version`) is missing or wrong.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)?;
        let mut lines = text.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("Empty request".into()))?;
        let (method, resource, http_version) = match request_line
            .split_whitespace()
            .collect::<Vec<_>>()
            .as_slice()
        {
            [method, resource, version] => (*method, *resource, *version),
            _ => return Err(Error::InvalidHandshake("Invalid request line".into())),
        };
        if method != "GET" {
            return Err(Error::InvalidHandshake(format!(
                "Expected GET method, got {method}"
            )));
        }
        if http_version != "HTTP/1.1" {
            return Err(Error::InvalidHandshake(format!(
                "Expected HTTP/1.1, got {http_version}"
            )));
        }

        let headers = Headers::parse(lines, &SINGLETON_HEADERS)?;
        headers.check_upgrade()?;

        let host = headers.require("host", "Host")?.to_string();
        let key = headers
            .require("sec-websocket-key", "Sec-WebSocket-Key")?
            .to_string();
        let version_str = headers.require("sec-websocket-version", "Sec-WebSocket-Version")?;
        let version = version_str
            .parse()
            .map_err(|_| Error::InvalidHandshake(format!("Invalid version: {version_str}")))?;

        Ok(Self {
            resource: resource.to_string(),
            host,
            key,
            version,
            origin: headers.get("origin").map(str::to_string),
            protocols: headers.list("sec-websocket-protocol"),
            extensions: headers.list("sec-websocket-extensions"),
        })
    }

    /// Parse with an upper bound on the message head size.
    ///
    /// # Errors
    ///
    /// - `Error::HandshakeTooLarge` if `data` is longer than `max_size`
    /// - anything [`HandshakeRequest::parse`] returns
    pub fn parse_with_limit(data: &[u8], max_size: usize) -> Result<Self> {
        if data.len() > max_size {
            return Err(Error::HandshakeTooLarge {
                size: data.len(),
                max: max_size,
            });
        }
        Self::parse(data)
    }

    /// Validate the semantic rules of RFC 6455 Section 4.2.1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the version is not 13, the key
    /// does not decode to exactly 16 bytes, the Host header is empty, or the
    /// resource is not an absolute path.
    pub fn validate(&self) -> Result<()> {
        if self.version != 13 {
            return Err(Error::InvalidHandshake(format!(
                "Unsupported WebSocket version: {} (expected 13)",
                self.version
            )));
        }

        let decoded = BASE64.decode(&self.key).map_err(|_| {
            Error::InvalidHandshake("Invalid Sec-WebSocket-Key: not valid Base64".into())
        })?;
        if decoded.len() != 16 {
            return Err(Error::InvalidHandshake(format!(
                "Sec-WebSocket-Key must be 16 bytes, got {}",
                decoded.len()
            )));
        }

        if self.host.is_empty() {
            return Err(Error::InvalidHandshake("Host header cannot be empty".into()));
        }
        if !self.resource.starts_with('/') {
            return Err(Error::InvalidHandshake(format!(
                "Resource must be an absolute path: {}",
                self.resource
            )));
        }
        Ok(())
    }

    /// Resource path without the query string.
    #[must_use]
    pub fn path(&self) -> &str {
        self.resource
            .split_once('?')
            .map_or(self.resource.as_str(), |(path, _)| path)
    }

    /// Query string without the leading `?`, if any.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.resource.split_once('?').map(|(_, query)| query)
    }

    /// Parse the Sec-WebSocket-Extensions entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if an entry has an empty name.
    pub fn extension_offers(&self) -> Result<Vec<ExtensionOffer>> {
        self.extensions
            .iter()
            .map(|entry| ExtensionOffer::parse(entry))
            .collect()
    }

    /// Build a client upgrade request.
    ///
    /// `extensions` is sent verbatim as the Sec-WebSocket-Extensions value.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHeaderValue` if any value contains CR or LF.
    pub fn client_request(
        host: &str,
        resource: &str,
        key: &str,
        extensions: Option<&str>,
    ) -> Result<Vec<u8>> {
        validate_header_value("Host", host)?;
        validate_header_value("Request-Target", resource)?;
        let mut head = format!(
            "GET {resource} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n"
        );
        if let Some(ext) = extensions {
            validate_header_value("Sec-WebSocket-Extensions", ext)?;
            head.push_str(&format!("Sec-WebSocket-Extensions: {ext}\r\n"));
        }
        head.push_str("\r\n");
        Ok(head.into_bytes())
    }
}

fn validate_header_value(header: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        return Err(Error::InvalidHeaderValue {
            header: header.to_string(),
            reason: "contains CR or LF characters".to_string(),
        });
    }
    Ok(())
}

/// A `101 Switching Protocols` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// The Sec-WebSocket-Accept value.
    pub accept: String,
    /// The selected subprotocol.
    pub protocol: Option<String>,
    /// Accepted extensions, one Sec-WebSocket-Extensions entry each.
    pub extensions: Vec<String>,
}

impl HandshakeResponse {
    /// Answer a validated request with no subprotocol and no extensions.
    /// Callers fill `extensions` after negotiation.
    #[must_use]
    pub fn from_request(req: &HandshakeRequest) -> Self {
        Self {
            accept: compute_accept_key(&req.key),
            protocol: None,
            extensions: Vec::new(),
        }
    }

    /// Serialize the response head.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHeaderValue` if the protocol or an extension
    /// entry contains CR or LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.extend_from_slice(b"Upgrade: websocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Accept: {}\r\n", self.accept).as_bytes());

        if let Some(proto) = &self.protocol {
            validate_header_value("Sec-WebSocket-Protocol", proto)?;
            buf.extend_from_slice(format!("Sec-WebSocket-Protocol: {proto}\r\n").as_bytes());
        }
        if !self.extensions.is_empty() {
            let joined = self.extensions.join(", ");
            validate_header_value("Sec-WebSocket-Extensions", &joined)?;
            buf.extend_from_slice(format!("Sec-WebSocket-Extensions: {joined}\r\n").as_bytes());
        }

        buf.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Parse the server's answer on the client side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScenarioRejected`] if the server answered with a
    /// non-101 status, and [`Error::InvalidHandshake`] for a malformed 101.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)?;
        let mut lines = text.lines();

        let status_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("Empty response".into()))?;
        let mut parts = status_line.splitn(3, ' ');
        let status = match (parts.next(), parts.next()) {
            (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code
                .parse::<u16>()
                .map_err(|_| Error::InvalidHandshake(format!("Bad status line: {status_line}")))?,
            _ => {
                return Err(Error::InvalidHandshake(format!(
                    "Bad status line: {status_line}"
                )));
            }
        };
        if status != 101 {
            return Err(Error::ScenarioRejected {
                status,
                reason: parts.next().unwrap_or_default().to_string(),
            });
        }

        let headers = Headers::parse(lines, &[])?;
        headers.check_upgrade()?;
        let accept = headers
            .require("sec-websocket-accept", "Sec-WebSocket-Accept")?
            .to_string();

        Ok(Self {
            accept,
            protocol: headers.get("sec-websocket-protocol").map(str::to_string),
            extensions: headers.list("sec-websocket-extensions"),
        })
    }
}

/// A refused upgrade: any non-101 answer with a short plain-text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRejection {
    /// HTTP status code.
    pub status: u16,
    /// Body text.
    pub body: String,
}

impl HandshakeRejection {
    /// Create a rejection with the given status and body.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Build the rejection that matches a handshake-stage error, if any.
    #[must_use]
    pub fn from_error(err: &Error) -> Option<Self> {
        let status = err.http_status()?;
        let body = match err {
            Error::ScenarioRejected { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        Some(Self::new(status, body))
    }

    /// Standard reason phrase for the status code.
    #[must_use]
    pub const fn reason_phrase(&self) -> &'static str {
        match self.status {
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            _ => "Error",
        }
    }

    /// Serialize the complete HTTP response.
    pub fn write(&self, buf: &mut Vec<u8>) {
        let body = self.body.replace(['\r', '\n'], " ");
        buf.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n\
                 Content-Type: text/plain; charset=utf-8\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 \r\n\
                 {}",
                self.status,
                self.reason_phrase(),
                body.len(),
                body
            )
            .as_bytes(),
        );
    }
}
