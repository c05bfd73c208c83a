//! Minimal HTTP/1.1 message types for posting JSON documents.

use crate::endpoint::EndpointUrl;
use pw_core::WatchError;
use pw_core::WatchResult;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

const USER_AGENT: &str = concat!("portwatch/", env!("CARGO_PKG_VERSION"));

/// Outgoing `POST` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRequest {
    pub url: EndpointUrl,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl PostRequest {
    pub fn json(url: EndpointUrl, body: Vec<u8>) -> Self {
        let headers = vec![
            ("Host", url.authority()),
            ("User-Agent", USER_AGENT.to_owned()),
            ("Content-Type", JSON_CONTENT_TYPE.to_owned()),
            ("Content-Length", body.len().to_string()),
            ("Connection", "close".to_owned()),
        ];

        Self { url, headers, body }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(self.body.len() + 256);
        encoded.extend_from_slice(b"POST ");
        encoded.extend_from_slice(self.url.path_and_query().as_bytes());
        encoded.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            encoded.extend_from_slice(name.as_bytes());
            encoded.extend_from_slice(b": ");
            encoded.extend_from_slice(value.as_bytes());
            encoded.extend_from_slice(b"\r\n");
        }
        encoded.extend_from_slice(b"\r\n");
        encoded.extend_from_slice(&self.body);
        encoded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HttpStatusCode(u16);

impl HttpStatusCode {
    pub fn new(code: u16) -> WatchResult<Self> {
        if (100..=599).contains(&code) {
            return Ok(Self(code));
        }

        Err(WatchError::new(
            "net.http.status_invalid",
            format!("status code must be 100-599, got `{code}`"),
        ))
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_success(self) -> bool {
        (200..=299).contains(&self.0)
    }
}

/// Parses `HTTP/1.x <code> <reason>`.
pub fn parse_status_line(line: &str) -> WatchResult<HttpStatusCode> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(WatchError::new(
            "net.http.status_line_invalid",
            format!("unsupported status line `{line}`"),
        ));
    }

    let code = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            WatchError::new(
                "net.http.status_line_invalid",
                format!("missing status code in `{line}`"),
            )
        })?;
    HttpStatusCode::new(code)
}
