/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use base64::prelude::*;
use bytes::BufMut;
use http::{HeaderMap, HeaderName, HeaderValue, Version};
use thiserror::Error;

/// Credentials carried in a `Proxy-Authorization` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum HttpAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
}

#[derive(Debug, Error)]
pub enum HttpAuthParseError {
    #[error("unsupported auth scheme")]
    UnsupportedScheme,
    #[error("invalid base64 encoding")]
    InvalidBase64Encoding,
    #[error("invalid credential format")]
    InvalidCredentialFormat,
}

impl HttpAuth {
    pub fn from_authorization(value: &str) -> Result<Self, HttpAuthParseError> {
        let Some(encoded) = value
            .strip_prefix("Basic ")
            .or_else(|| value.strip_prefix("basic "))
        else {
            return Err(HttpAuthParseError::UnsupportedScheme);
        };
        let decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|_| HttpAuthParseError::InvalidBase64Encoding)?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| HttpAuthParseError::InvalidCredentialFormat)?;
        match decoded.split_once(':') {
            Some((username, password)) => Ok(HttpAuth::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }),
            None => Err(HttpAuthParseError::InvalidCredentialFormat),
        }
    }
}

/// Write the `Connection` header for the next hop.
///
/// The peer's original spelling of the header name is kept when it sent one
/// (curl's `Proxy-Connection` stays `Proxy-Connection`), and any brokered
/// tokens (the upgrade pair) are re-listed after the lifetime signal.
pub fn write_connection_header(
    original_name: Option<&str>,
    close: bool,
    extra_tokens: &[HeaderName],
    buf: &mut Vec<u8>,
) {
    buf.put_slice(original_name.unwrap_or("Connection").as_bytes());
    if close {
        buf.put_slice(b": close");
    } else {
        buf.put_slice(b": keep-alive");
    }
    for token in extra_tokens {
        buf.put_slice(b", ");
        buf.put_slice(token.as_str().as_bytes());
    }
    buf.put_slice(b"\r\n");
}

/// Append the hop identification of RFC 7230 §5.7.1 for this proxy.
///
/// The alias shows up exactly once per hop, as an extra `Via` header value
/// after whatever upstream hops already recorded.
pub fn append_via(headers: &mut HeaderMap, version: Version, alias: &str) {
    let received_proto = match version {
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    };
    if let Ok(value) = HeaderValue::from_str(&format!("{received_proto} {alias}")) {
        headers.append(http::header::VIA, value);
    }
}

/// Header names that never cross a proxy hop (RFC 7230 §6.1).
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_parse() {
        // "user:pass"
        let auth = HttpAuth::from_authorization("Basic dXNlcjpwYXNz").unwrap();
        assert_eq!(
            auth,
            HttpAuth::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            }
        );
    }

    #[test]
    fn basic_auth_password_with_colon() {
        // "user:pa:ss"
        let auth = HttpAuth::from_authorization("Basic dXNlcjpwYTpzcw==").unwrap();
        assert_eq!(
            auth,
            HttpAuth::Basic {
                username: "user".to_string(),
                password: "pa:ss".to_string(),
            }
        );
    }

    #[test]
    fn reject_other_scheme() {
        assert!(HttpAuth::from_authorization("Digest abc").is_err());
    }

    #[test]
    fn via_appended() {
        let mut headers = HeaderMap::new();
        append_via(&mut headers, Version::HTTP_11, "gateway-1");
        append_via(&mut headers, Version::HTTP_10, "gateway-1");
        let values: Vec<_> = headers.get_all(http::header::VIA).iter().collect();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], "1.1 gateway-1");
        assert_eq!(values[1], "1.0 gateway-1");
    }

    #[test]
    fn connection_header_keeps_original_name_and_tokens() {
        let mut buf = Vec::new();
        write_connection_header(
            Some("Proxy-Connection"),
            false,
            &[HeaderName::from_static("upgrade")],
            &mut buf,
        );
        assert_eq!(buf, b"Proxy-Connection: keep-alive, upgrade\r\n");

        buf.clear();
        write_connection_header(None, true, &[], &mut buf);
        assert_eq!(buf, b"Connection: close\r\n");
    }
}
