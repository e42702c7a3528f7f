//! Upgrade-time admission checks for the two WebSocket endpoints.
//!
//! `/extension` is origin-gated: the upgrade must carry an `Origin` from
//! the configured allow-list (or any `chrome-extension://` origin when the
//! list is empty). `/cdp` is token-gated when a bearer token is configured;
//! otherwise it admits loopback peers and non-browser clients, which never
//! send an `Origin` header.

use std::net::IpAddr;

use rand::Rng;
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;

/// Prefix for generated bearer tokens.
const TOKEN_PREFIX: &str = "cdpr_";

/// Why a `/cdp` upgrade was refused. Maps onto HTTP 401/403.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    Unauthorized,
    BadOrigin,
}

/// Generate a bearer token: `cdpr_` + 32 random hex characters.
pub fn generate_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", TOKEN_PREFIX, hex)
}

/// Constant-time bearer-token comparison.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    expected
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .unwrap_u8()
        == 1
}

/// Split an origin into (scheme, host, optional port). Handles IPv6
/// bracket notation and tolerates a trailing slash.
fn parse_origin(origin: &str) -> Option<(&str, &str, Option<&str>)> {
    let (scheme, rest) = origin.split_once("://")?;
    if rest.is_empty() {
        return None;
    }
    if rest.starts_with('[') {
        let end_bracket = rest.find(']')?;
        let host = &rest[..end_bracket + 1];
        let after = &rest[end_bracket + 1..];
        if after.is_empty() || after == "/" {
            Some((scheme, host, None))
        } else if let Some(port_part) = after.strip_prefix(':') {
            Some((scheme, host, Some(port_part.trim_end_matches('/'))))
        } else {
            None
        }
    } else {
        let (host, port) = match rest.find(':') {
            Some(i) => (&rest[..i], Some(rest[i + 1..].trim_end_matches('/'))),
            None => (rest.trim_end_matches('/'), None),
        };
        if host.is_empty() {
            None
        } else {
            Some((scheme, host, port))
        }
    }
}

/// Admission rule for `/extension`: an `Origin` header is mandatory and
/// must satisfy the allow-list.
pub fn extension_origin_allowed(origin: Option<&str>, allow_list: &[String]) -> bool {
    let Some(origin) = origin else {
        return false;
    };
    if allow_list.is_empty() {
        let lower = origin.to_ascii_lowercase();
        return matches!(parse_origin(&lower), Some(("chrome-extension", _, _)));
    }
    let trimmed = origin.trim_end_matches('/');
    allow_list
        .iter()
        .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(trimmed))
}

/// Admission rule for `/cdp`.
pub fn check_client(
    auth: &AuthConfig,
    peer: IpAddr,
    origin: Option<&str>,
    presented_token: Option<&str>,
) -> Result<(), Denial> {
    if let Some(expected) = &auth.bearer_token {
        return match presented_token {
            Some(token) if token_matches(expected, token) => Ok(()),
            _ => Err(Denial::Unauthorized),
        };
    }
    // No token configured: loopback peers are trusted, and so are clients
    // that sent no Origin header (browsers always send one).
    if peer.is_loopback() || origin.is_none() {
        Ok(())
    } else {
        Err(Denial::BadOrigin)
    }
}
