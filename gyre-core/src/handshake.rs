//! HTTP/1.1 upgrade handshake (RFC 6455 section 4.2)
//!
//! The server side only: parse the client's request head, decide whether it
//! asks for an upgrade, validate it, and build the response that either
//! switches protocols or rejects the request.

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::*;
use crate::protocol::{http_header, http_value};
use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri};
use sha1::{Digest, Sha1};

/// Parsed client request head
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Request method; an upgrade must be GET
    pub method: Method,
    /// Request target as sent, path and query
    pub uri: Uri,
    /// Minor HTTP version (1 for HTTP/1.1)
    pub version: u8,
    /// Header names are stored lowercase
    pub headers: HeaderMap,
}

impl HandshakeRequest {
    /// Parse a request head from the start of `buf`.
    ///
    /// Returns `Ok(None)` while the head is incomplete, otherwise the request
    /// and the number of bytes it occupied. Bytes past that offset belong to
    /// the connection's next protocol.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw_headers);

        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEADER_SIZE {
                    return Err(ProtocolError::HeadTooLarge { max: MAX_HEADER_SIZE }.into());
                }
                return Ok(None);
            }
            Err(e) => return Err(ProtocolError::MalformedRequest(e.to_string()).into()),
        };
        if head_len > MAX_HEADER_SIZE {
            return Err(ProtocolError::HeadTooLarge { max: MAX_HEADER_SIZE }.into());
        }

        let malformed = |what: &str| Error::from(ProtocolError::MalformedRequest(what.to_string()));

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| malformed("method"))?;
        let uri = req
            .path
            .and_then(|p| p.parse::<Uri>().ok())
            .ok_or_else(|| malformed("request target"))?;
        let version = req.version.unwrap_or(1);

        let mut headers = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| malformed("header name"))?;
            let value =
                HeaderValue::from_bytes(header.value).map_err(|_| malformed("header value"))?;
            headers.append(name, value);
        }

        Ok(Some((
            Self {
                method,
                uri,
                version,
                headers,
            },
            head_len,
        )))
    }

    /// First value of a header, if it is valid visible ASCII
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the client asked for a WebSocket upgrade at all.
    ///
    /// Only the `Upgrade` header is consulted; a request without it is plain
    /// traffic for the connection's raw framing.
    pub fn is_upgrade(&self) -> bool {
        self.header(http_header::UPGRADE)
            .map(|v| has_token(v, http_value::WEBSOCKET))
            .unwrap_or(false)
    }

    /// Validate an upgrade request and return its `Sec-WebSocket-Key`.
    pub fn validate(&self) -> Result<&str> {
        if self.method != Method::GET {
            return Err(ProtocolError::InvalidMethod(self.method.to_string()).into());
        }
        if self.version < 1 {
            return Err(ProtocolError::MalformedRequest("HTTP/1.0 cannot upgrade".into()).into());
        }

        let upgrade = self
            .header(http_header::UPGRADE)
            .ok_or(ProtocolError::MissingHeader(http_header::UPGRADE))?;
        if !has_token(upgrade, http_value::WEBSOCKET) {
            return Err(ProtocolError::InvalidHeaderValue {
                header: http_header::UPGRADE,
                value: upgrade.to_string(),
            }
            .into());
        }

        let connection = self
            .header(http_header::CONNECTION)
            .ok_or(ProtocolError::MissingHeader(http_header::CONNECTION))?;
        if !has_token(connection, http_header::UPGRADE) {
            return Err(ProtocolError::InvalidHeaderValue {
                header: http_header::CONNECTION,
                value: connection.to_string(),
            }
            .into());
        }

        let key = self
            .header(http_header::SEC_WEBSOCKET_KEY)
            .ok_or(ProtocolError::MissingHeader(http_header::SEC_WEBSOCKET_KEY))?;
        if !validate_key(key) {
            return Err(ProtocolError::InvalidHeaderValue {
                header: http_header::SEC_WEBSOCKET_KEY,
                value: key.to_string(),
            }
            .into());
        }

        let version = self
            .header(http_header::SEC_WEBSOCKET_VERSION)
            .ok_or(ProtocolError::MissingHeader(http_header::SEC_WEBSOCKET_VERSION))?;
        if version.trim() != WEBSOCKET_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version.to_string()).into());
        }

        Ok(key)
    }
}

/// Response to an upgrade request. Handlers may edit it before it is written.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    /// 101 on success; anything else rejects the upgrade
    pub status: StatusCode,
    /// Headers written after the status line
    pub headers: HeaderMap,
    /// Body sent with a rejection. Ignored for 101.
    pub body: Bytes,
}

impl HandshakeResponse {
    /// `101 Switching Protocols` for a validated client key
    pub fn accept(client_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::UPGRADE,
            HeaderValue::from_static(http_value::WEBSOCKET),
        );
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static(http_value::UPGRADE),
        );
        let accept = HeaderValue::from_str(&compute_accept_key(client_key)).map_err(|_| {
            ProtocolError::InvalidHeaderValue {
                header: http_header::SEC_WEBSOCKET_KEY,
                value: client_key.to_string(),
            }
        })?;
        headers.insert(http::header::SEC_WEBSOCKET_ACCEPT, accept);

        Ok(Self {
            status: StatusCode::SWITCHING_PROTOCOLS,
            headers,
            body: Bytes::new(),
        })
    }

    /// Error response that closes the connection
    pub fn reject(status: StatusCode, reason: impl Into<String>) -> Self {
        let body = Bytes::from(reason.into());
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static(http_value::CLOSE),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Self {
            status,
            headers,
            body,
        }
    }

    /// Whether writing this response completes the upgrade
    pub fn is_switching(&self) -> bool {
        self.status == StatusCode::SWITCHING_PROTOCOLS
    }

    /// Serialize as an HTTP/1.1 response head plus body
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(self.status.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
        buf.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Compute `Sec-WebSocket-Accept` from the client key
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_MAGIC.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// A key must be base64 of exactly sixteen bytes
pub fn validate_key(key: &str) -> bool {
    general_purpose::STANDARD
        .decode(key.trim())
        .map(|raw| raw.len() == WEBSOCKET_KEY_LEN)
        .unwrap_or(false)
}

/// Random client key, for tests and clients
pub fn generate_key() -> String {
    general_purpose::STANDARD.encode(rand::random::<[u8; WEBSOCKET_KEY_LEN]>())
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}
