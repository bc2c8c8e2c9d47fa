//! Session and fingerprint cookies
//!
//! The session cookie carries an opaque 32-character identifier signed with a
//! process-wide HMAC secret in the wire format `s:<id>.<sig>`. The secret is
//! generated on first use, persisted to `.sessionSecret` with mode 0600, and
//! never reread after the first successful load. The device cookie is a plain
//! 128-character random token that feeds the fingerprint hash.

use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use axum::http::{header, HeaderMap};

use crate::error::GuardResult;

/// Session cookie name
pub const SESSION_COOKIE: &str = "conn.sess.id";
/// Device cookie name
pub const DEVICE_COOKIE: &str = "conn.device.id";

/// Session cookie lifetime in seconds (30 days, sliding)
pub const SESSION_MAX_AGE: i64 = 30 * 24 * 3600;
/// Device cookie lifetime in seconds (365 days)
pub const DEVICE_MAX_AGE: i64 = 365 * 86400;

const SECRET_FILE: &str = ".sessionSecret";
const SESSION_ID_LEN: usize = 32;
const SECRET_LEN: usize = 128;
/// Device cookie token length
pub const DEVICE_TOKEN_LEN: usize = 128;

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

static SECRET: OnceLock<String> = OnceLock::new();

type HmacSha256 = Hmac<Sha256>;

/// Random URL-safe token of the given length.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn load_or_create_secret() -> GuardResult<String> {
    match std::fs::read_to_string(SECRET_FILE) {
        Ok(data) => {
            let secret = data.trim().to_string();
            if !secret.is_empty() {
                return Ok(secret);
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let secret = random_token(SECRET_LEN);
    std::fs::write(SECRET_FILE, &secret)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(SECRET_FILE, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(secret)
}

/// The process-wide signing secret, initialized exactly once.
fn session_secret() -> GuardResult<&'static str> {
    if let Some(secret) = SECRET.get() {
        return Ok(secret);
    }
    let secret = load_or_create_secret()?;
    // A racing initializer may win; both sides produced a persisted secret
    // and the stored one is what every later call observes.
    Ok(SECRET.get_or_init(|| secret))
}

fn sign(secret: &str, session_id: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(session_id.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Mint a fresh signed session identifier. Returns `(id, wire value)` where
/// the wire value is what goes into the cookie.
pub fn mint() -> GuardResult<(String, String)> {
    let secret = session_secret()?;
    let session_id = random_token(SESSION_ID_LEN);
    let signature = sign(secret, &session_id);
    let wire = format!("s:{session_id}.{signature}");
    Ok((session_id, wire))
}

/// Parse and verify a session cookie value. Returns the session identifier
/// only when the signature checks out; signature comparison is constant time.
pub fn parse(value: &str) -> Option<String> {
    let content = value.strip_prefix("s:")?;
    let (session_id, signature) = content.split_once('.')?;
    if session_id.is_empty() {
        return None;
    }

    let secret = session_secret().ok()?;
    let sig_bytes = URL_SAFE_NO_PAD.decode(signature).ok()?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(session_id.as_bytes());
    if mac.verify_slice(&sig_bytes).is_ok() {
        Some(session_id.to_string())
    } else {
        None
    }
}

/// Device fingerprint: SHA-256 hex over the UA-derived identity and the
/// device cookie token. Stable per device across sessions.
pub fn fingerprint(platform: &str, browser: &str, kind: &str, os: &str, token: &str) -> String {
    let info = format!("{platform}/{browser}/{kind}/{os}/{token}");
    hex(&Sha256::digest(info.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// `Set-Cookie` value with the attributes every guard cookie carries.
pub fn cookie_header(name: &str, value: &str, max_age: i64) -> String {
    format!("{name}={value}; Path=/; Max-Age={max_age}; HttpOnly; Secure; SameSite=Strict")
}

/// Read a named cookie out of the request `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        if let Some((key, value)) = pair.trim().split_once('=') {
            if key == name && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_charset_and_length() {
        let token = random_token(DEVICE_TOKEN_LEN);
        assert_eq!(token.len(), DEVICE_TOKEN_LEN);
        assert!(token.bytes().all(|b| CHARSET.contains(&b)));
    }

    #[test]
    fn test_session_round_trip() {
        let (id, wire) = mint().unwrap();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(wire.starts_with("s:"));
        assert_eq!(parse(&wire).as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let (_, wire) = mint().unwrap();
        let mut tampered = wire.clone();
        // flip the last signature character
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        assert_eq!(parse(&tampered), None);
    }

    #[test]
    fn test_malformed_values_rejected() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("no-prefix"), None);
        assert_eq!(parse("s:missing-dot"), None);
        assert_eq!(parse("s:.sig-without-id"), None);
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint("macOS", "Chrome", "Desktop", "macOS 14.3", "tok");
        let b = fingerprint("macOS", "Chrome", "Desktop", "macOS 14.3", "tok");
        let c = fingerprint("macOS", "Chrome", "Desktop", "macOS 14.3", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cookie_value_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "a=1; conn.sess.id=s:abc.def; b=2".parse().unwrap(),
        );
        assert_eq!(
            cookie_value(&headers, SESSION_COOKIE).as_deref(),
            Some("s:abc.def")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_cookie_header_attributes() {
        let cookie = cookie_header(SESSION_COOKIE, "v", SESSION_MAX_AGE);
        assert!(cookie.contains("Max-Age=2592000"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
    }
}
