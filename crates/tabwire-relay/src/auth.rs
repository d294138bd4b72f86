//! Bearer token minting and validation.
//!
//! Every relay instance mints one random token at construction. All JSON
//! endpoints and the `/cdp` WebSocket upgrade require it; `/extension` does
//! not (the extension runs in-browser and cannot receive the token, so it is
//! protected by the loopback bind and the single-slot policy instead).

use axum::http::HeaderMap;
use rand::rngs::OsRng;
use rand::RngCore;

/// Number of random bytes in a minted token (hex-encoded to twice this).
const TOKEN_BYTES: usize = 32;

/// Mint a new random bearer token.
pub fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Returns `true` if and only if both slices have the same length and
/// identical content. Every byte pair is examined regardless of where a
/// mismatch occurs.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Check a presented token against the instance token.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    !presented.is_empty() && constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

/// Extract a bearer token from request headers.
///
/// Returns the token portion of an `Authorization: Bearer <token>` header,
/// or `None` when the header is absent or malformed.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok())?;
    let token = auth.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Extract a token from either the Authorization header or a `?token=`
/// query parameter. The header takes precedence.
pub fn token_from_request(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(token) = bearer_from_headers(headers) {
        return Some(token);
    }
    query_token
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}
