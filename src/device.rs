//! Device resolution
//!
//! Turns an HTTP request into the stable client tuple the rest of the engine
//! works with: client IP (with proxy-header precedence and internal-network
//! classification), user-agent derived platform/browser/OS/device type, and
//! the session/fingerprint identity handled in [`crate::session`].

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use axum::http::HeaderMap;
use ipnetwork::IpNetwork;
use regex::Regex;

use crate::error::{GuardError, GuardResult};
use crate::DeviceKind;

/// Proxy headers consulted for the client IP, in precedence order.
const CLIENT_IP_HEADERS: [&str; 8] = [
    "cf-connecting-ip",
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "x-cluster-client-ip",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

/// Headers whose presence marks the request as proxied.
const PROXY_MARKER_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "x-forwarded-proto",
];

const INTERNAL_RANGES: [&str; 7] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
];

fn internal_networks() -> &'static Vec<IpNetwork> {
    static NETWORKS: OnceLock<Vec<IpNetwork>> = OnceLock::new();
    NETWORKS.get_or_init(|| {
        INTERNAL_RANGES
            .iter()
            .filter_map(|range| IpNetwork::from_str(range).ok())
            .collect()
    })
}

/// Whether an address lies in the RFC-1918 / loopback / link-local / ULA set.
pub fn is_internal(ip: IpAddr) -> bool {
    internal_networks().iter().any(|net| net.contains(ip))
}

fn is_internal_str(ip: &str) -> bool {
    IpAddr::from_str(ip.trim()).map(is_internal).unwrap_or(false)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Derive the client IP and internal classification for a request.
///
/// Headers win over the socket peer; for `X-Forwarded-For` the left-most
/// token is the client. A request with no parseable address anywhere fails
/// with [`GuardError::InvalidClientIp`].
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> GuardResult<(String, bool)> {
    for name in CLIENT_IP_HEADERS {
        if let Some(raw) = header_str(headers, name) {
            let candidate = raw.split(',').next().unwrap_or("").trim();
            if IpAddr::from_str(candidate).is_ok() {
                return Ok((candidate.to_string(), is_internal_request(headers, peer)));
            }
        }
    }

    if let Some(peer) = peer {
        return Ok((peer.to_string(), is_internal_request(headers, Some(peer))));
    }

    Err(GuardError::InvalidClientIp)
}

/// A request is internal when the direct peer itself is internal. Proxy
/// headers only count when the peer is internal and the forwarded chain is
/// internal end to end (with the last hop matching the peer).
fn is_internal_request(headers: &HeaderMap, peer: Option<IpAddr>) -> bool {
    let peer = match peer {
        Some(peer) => peer,
        None => return false,
    };

    if is_internal(peer) {
        return true;
    }

    if PROXY_MARKER_HEADERS
        .iter()
        .any(|name| headers.contains_key(*name))
    {
        return proxy_chain_trusted(headers, peer);
    }

    false
}

fn proxy_chain_trusted(headers: &HeaderMap, peer: IpAddr) -> bool {
    // an untrusted direct peer disqualifies the whole chain
    if !is_internal(peer) {
        return false;
    }

    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        return xff_chain_internal(xff, peer);
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return is_internal_str(real_ip);
    }

    false
}

fn xff_chain_internal(xff: &str, peer: IpAddr) -> bool {
    let hops: Vec<&str> = xff.split(',').map(str::trim).collect();
    let client = match hops.first() {
        Some(client) => *client,
        None => return false,
    };

    if !is_internal_str(client) {
        return false;
    }

    for hop in &hops[1..] {
        if !is_internal_str(hop) {
            return false;
        }
    }

    if hops.len() > 1 {
        let last = hops[hops.len() - 1];
        return IpAddr::from_str(last).map(|ip| ip == peer).unwrap_or(false);
    }

    true
}

// =============================================================================
// User-agent parsing
// =============================================================================

pub fn platform(user_agent: &str) -> &'static str {
    let ua = user_agent.to_lowercase();

    if ua.contains("android") {
        return "Android";
    }
    if ua.contains("iphone") || ua.contains("ipad") {
        return "iOS";
    }
    if ua.contains("windows") {
        return "Windows";
    }
    if ua.contains("macintosh") || ua.contains("mac os") {
        return "macOS";
    }
    if ua.contains("linux") {
        return "Linux";
    }

    "Unknown"
}

pub fn browser(user_agent: &str) -> &'static str {
    let ua = user_agent.to_lowercase();

    if ua.contains("chrome") && !ua.contains("edge") {
        return "Chrome";
    }
    if ua.contains("firefox") {
        return "Firefox";
    }
    if ua.contains("safari") && !ua.contains("chrome") {
        return "Safari";
    }
    if ua.contains("edge") {
        return "Edge";
    }
    if ua.contains("opera") {
        return "Opera";
    }

    "Unknown"
}

fn mobile_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(mobile|phone|android|iphone|ipod|blackberry|webos)")
            .expect("valid regex")
    })
}

fn tablet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(tablet|ipad|kindle|silk)").expect("valid regex"))
}

pub fn kind(user_agent: &str) -> DeviceKind {
    if mobile_regex().is_match(user_agent) {
        return DeviceKind::Mobile;
    }
    if tablet_regex().is_match(user_agent) {
        return DeviceKind::Tablet;
    }
    DeviceKind::Desktop
}

/// Versioned OS string where the UA carries one, platform name otherwise.
pub fn os(user_agent: &str) -> String {
    static IOS: OnceLock<Regex> = OnceLock::new();
    static ANDROID: OnceLock<Regex> = OnceLock::new();
    static MACOS: OnceLock<Regex> = OnceLock::new();

    let ua = user_agent.to_lowercase();

    let ios = IOS.get_or_init(|| Regex::new(r"os (\d+)_(\d+)").expect("valid regex"));
    if let Some(caps) = ios.captures(&ua) {
        return format!("iOS {}.{}", &caps[1], &caps[2]);
    }

    let android =
        ANDROID.get_or_init(|| Regex::new(r"android (\d+\.?\d*)").expect("valid regex"));
    if let Some(caps) = android.captures(&ua) {
        return format!("Android {}", &caps[1]);
    }

    if ua.contains("windows nt 10.0") {
        return "Windows 10/11".to_string();
    }
    if ua.contains("windows nt 6.3") {
        return "Windows 8.1".to_string();
    }
    if ua.contains("windows nt 6.1") {
        return "Windows 7".to_string();
    }

    let macos = MACOS.get_or_init(|| Regex::new(r"mac os x (\d+)_(\d+)").expect("valid regex"));
    if let Some(caps) = macos.captures(&ua) {
        return format!("macOS {}.{}", &caps[1], &caps[2]);
    }

    platform(user_agent).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    const CHROME_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) \
        AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";
    const SILK_TABLET: &str =
        "Mozilla/5.0 (Linux; Android 9; KFMAWI) AppleWebKit/537.36 Silk/94.2 Tablet";

    fn peer(ip: &str) -> Option<IpAddr> {
        Some(ip.parse().unwrap())
    }

    #[test]
    fn test_header_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("cf-connecting-ip", "198.51.100.9".parse().unwrap());

        let (ip, _) = client_ip(&headers, peer("10.0.0.1")).unwrap();
        assert_eq!(ip, "198.51.100.9");
    }

    #[test]
    fn test_xff_takes_leftmost_token() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());

        let (ip, _) = client_ip(&headers, peer("10.0.0.1")).unwrap();
        assert_eq!(ip, "203.0.113.7");
    }

    #[test]
    fn test_garbage_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());

        let (ip, _) = client_ip(&headers, peer("192.0.2.4")).unwrap();
        assert_eq!(ip, "192.0.2.4");
    }

    #[test]
    fn test_no_address_anywhere_is_an_error() {
        let headers = HeaderMap::new();
        assert!(matches!(
            client_ip(&headers, None),
            Err(GuardError::InvalidClientIp)
        ));
    }

    #[test]
    fn test_internal_classification() {
        assert!(is_internal("10.1.2.3".parse().unwrap()));
        assert!(is_internal("172.20.0.1".parse().unwrap()));
        assert!(is_internal("192.168.1.1".parse().unwrap()));
        assert!(is_internal("127.0.0.1".parse().unwrap()));
        assert!(is_internal("169.254.10.10".parse().unwrap()));
        assert!(is_internal("::1".parse().unwrap()));
        assert!(is_internal("fc00::1".parse().unwrap()));
        assert!(!is_internal("8.8.8.8".parse().unwrap()));
        assert!(!is_internal("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn test_internal_peer_marks_request_internal() {
        let headers = HeaderMap::new();
        let (_, internal) = client_ip(&headers, peer("192.168.1.50")).unwrap();
        assert!(internal);

        let (_, internal) = client_ip(&headers, peer("203.0.113.7")).unwrap();
        assert!(!internal);
    }

    #[test]
    fn test_external_peer_cannot_claim_internal_via_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "192.168.1.2".parse().unwrap());

        // peer is external, so the forwarded chain is not trusted
        let (ip, internal) = client_ip(&headers, peer("203.0.113.7")).unwrap();
        assert_eq!(ip, "192.168.1.2");
        assert!(!internal);
    }

    #[test]
    fn test_xff_chain_validation() {
        let peer_ip: IpAddr = "10.0.0.1".parse().unwrap();

        // all-internal chain terminating at the peer
        assert!(xff_chain_internal("192.168.1.2, 10.0.0.1", peer_ip));
        // last hop differs from the peer
        assert!(!xff_chain_internal("192.168.1.2, 10.0.0.2", peer_ip));
        // external hop mid-chain
        assert!(!xff_chain_internal("192.168.1.2, 8.8.8.8, 10.0.0.1", peer_ip));
        // external client
        assert!(!xff_chain_internal("8.8.8.8, 10.0.0.1", peer_ip));
        // single internal hop
        assert!(xff_chain_internal("192.168.1.2", peer_ip));
    }

    #[test]
    fn test_platform_and_browser() {
        assert_eq!(platform(CHROME_MAC), "macOS");
        assert_eq!(browser(CHROME_MAC), "Chrome");
        assert_eq!(platform(SAFARI_IPHONE), "iOS");
        assert_eq!(browser(SAFARI_IPHONE), "Safari");
        assert_eq!(platform(""), "Unknown");
        assert_eq!(browser(""), "Unknown");
    }

    #[test]
    fn test_device_kind() {
        assert_eq!(kind(CHROME_MAC), DeviceKind::Desktop);
        assert_eq!(kind(SAFARI_IPHONE), DeviceKind::Mobile);
        assert_eq!(kind(SILK_TABLET), DeviceKind::Mobile); // "Android" wins the mobile regex
        assert_eq!(kind("Mozilla/5.0 (iPad; CPU OS 17_0)"), DeviceKind::Tablet);
    }

    #[test]
    fn test_os_versions() {
        assert_eq!(os(SAFARI_IPHONE), "iOS 17.4");
        assert_eq!(os("Mozilla/5.0 (Linux; Android 14; Pixel 8)"), "Android 14");
        assert_eq!(os("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"), "Windows 10/11");
        assert_eq!(os(CHROME_MAC), "macOS 10.15");
        assert_eq!(os("curl/8.0"), "Unknown");
    }
}
