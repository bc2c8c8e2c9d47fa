//! End-to-end admission scenarios against the in-process store.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::{header, HeaderMap};

use ip_sentinel::store::MemoryStore;
use ip_sentinel::{FilePaths, GuardConfig, Guardian, Parameters};

const UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

fn temp_path(name: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "ip-sentinel-e2e-{}-{}-{}.json",
        name,
        std::process::id(),
        seq
    ))
}

fn test_config(params: Parameters) -> GuardConfig {
    GuardConfig {
        files: FilePaths {
            trust_list: Some(temp_path("trust")),
            deny_list: Some(temp_path("deny")),
            ..FilePaths::default()
        },
        params,
        ..GuardConfig::default()
    }
}

async fn guardian(params: Parameters) -> Guardian {
    Guardian::with_store(test_config(params), Arc::new(MemoryStore::new()))
        .await
        .expect("guardian assembles")
}

fn headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, UA.parse().unwrap());
    headers
}

fn peer(ip: &str) -> Option<IpAddr> {
    Some(ip.parse().unwrap())
}

/// Pull the session cookie wire value out of a verdict's Set-Cookie list.
fn session_cookie(set_cookies: &[String]) -> String {
    let cookie = set_cookies
        .iter()
        .find(|c| c.starts_with("conn.sess.id="))
        .expect("session cookie present");
    cookie
        .strip_prefix("conn.sess.id=")
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn trusted_ip_bypasses_everything() {
    let mut params = Parameters::default();
    params.rate_limit_normal = 3;
    let guard = guardian(params).await;

    guard.trust.add("10.1.1.1", "office").await.unwrap();

    // far past the rate limit, still admitted
    for _ in 0..10 {
        let verdict = guard.check(&headers(), peer("10.1.1.1")).await;
        assert!(verdict.success);
        assert_eq!(verdict.status_code, 200);
    }
}

#[tokio::test]
async fn denied_ip_gets_403() {
    let guard = guardian(Parameters::default()).await;

    guard.deny.add("1.2.3.4", "bad actor").await.unwrap();

    let verdict = guard.check(&headers(), peer("1.2.3.4")).await;
    assert!(!verdict.success);
    assert_eq!(verdict.status_code, 403);
    assert!(verdict.error.unwrap().contains("banned"));
}

#[tokio::test]
async fn blocked_ip_escalates_to_deny_after_repeated_requests() {
    let mut params = Parameters::default();
    params.block_to_deny = 3;
    let guard = guardian(params).await;

    guard.block.add("5.6.7.8", "probing").await.unwrap();

    // each request while blocked bumps the recurrence counter
    let mut banned_at = None;
    for attempt in 1..=3 {
        let verdict = guard.check(&headers(), peer("5.6.7.8")).await;
        if !verdict.success {
            assert_eq!(verdict.status_code, 403);
            assert!(verdict.error.unwrap().contains("banned"));
            banned_at = Some(attempt);
            break;
        }
    }

    assert_eq!(banned_at, Some(3));
    assert!(guard.deny.check("5.6.7.8").await);
}

#[tokio::test]
async fn normal_rate_limit_fires_at_threshold() {
    let mut params = Parameters::default();
    params.rate_limit_normal = 5;
    let guard = guardian(params).await;

    for _ in 0..4 {
        let verdict = guard.check(&headers(), peer("9.9.9.9")).await;
        assert!(verdict.success);
    }

    let verdict = guard.check(&headers(), peer("9.9.9.9")).await;
    assert!(!verdict.success);
    assert_eq!(verdict.status_code, 403);
    assert!(verdict.error.unwrap().contains("Normal"));
}

#[tokio::test]
async fn session_spread_over_ips_hits_suspicious_rate_limit() {
    let mut params = Parameters::default();
    params.score_suspicious = 20;
    params.rate_limit_suspicious = 1;
    let guard = guardian(params).await;

    // establish a session from the first IP
    let first = guard.check(&headers(), peer("203.0.113.1")).await;
    assert!(first.success);
    let wire = session_cookie(&first.set_cookies);

    let mut with_cookie = headers();
    with_cookie.insert(
        header::COOKIE,
        format!("conn.sess.id={wire}").parse().unwrap(),
    );

    // the same session from three more IPs stays under the threshold of 4
    for i in 2..=4 {
        let verdict = guard
            .check(&with_cookie, peer(&format!("203.0.113.{i}")))
            .await;
        assert!(verdict.success, "IP #{i} should still be admitted");
    }

    // the fifth distinct IP trips session_multi_ip (25 points >= 20) and the
    // suspicious-tier rate limit rejects the request
    let verdict = guard.check(&with_cookie, peer("203.0.113.5")).await;
    assert!(!verdict.success);
    assert!(verdict.error.unwrap().contains("Suspicious"));
}

#[tokio::test]
async fn session_cookie_round_trips_and_slides() {
    let guard = guardian(Parameters::default()).await;

    let first = guard.check(&headers(), peer("198.51.100.7")).await;
    assert!(first.success);
    let wire = session_cookie(&first.set_cookies);
    assert!(wire.starts_with("s:"));

    let mut with_cookie = headers();
    with_cookie.insert(
        header::COOKIE,
        format!("conn.sess.id={wire}").parse().unwrap(),
    );

    // a verified cookie is renewed with the same value (sliding expiry)
    let second = guard.check(&with_cookie, peer("198.51.100.7")).await;
    assert!(second.success);
    assert_eq!(session_cookie(&second.set_cookies), wire);

    // a tampered cookie is replaced with a fresh identity
    let mut tampered = headers();
    tampered.insert(
        header::COOKIE,
        format!("conn.sess.id={wire}x").parse().unwrap(),
    );
    let third = guard.check(&tampered, peer("198.51.100.7")).await;
    assert!(third.success);
    assert_ne!(session_cookie(&third.set_cookies), format!("{wire}x"));
}

#[tokio::test]
async fn runaway_score_blocks_the_ip() {
    let mut params = Parameters::default();
    // a flood of 404s alone pushes the uncapped total past 100
    params.score_not_found_404 = 60;
    let guard = guardian(params).await;

    let first = guard.check(&headers(), peer("203.0.113.66")).await;
    assert!(first.success);
    let wire = session_cookie(&first.set_cookies);

    let mut with_cookie = headers();
    with_cookie.insert(
        header::COOKIE,
        format!("conn.sess.id={wire}").parse().unwrap(),
    );

    // 13 recorded 404s is beyond 1.5x the threshold of 8
    for _ in 0..13 {
        guard
            .not_found_404(&with_cookie, peer("203.0.113.66"))
            .await
            .unwrap();
    }

    let verdict = guard.check(&with_cookie, peer("203.0.113.66")).await;
    assert!(!verdict.success);
    assert_eq!(verdict.status_code, 403);
    assert!(verdict.error.unwrap().contains("blocked"));

    // score >= 100 implies a live block entry
    assert!(guard.block.is_blocked("203.0.113.66").await);
}

#[tokio::test]
async fn unresolvable_client_is_an_internal_error() {
    let guard = guardian(Parameters::default()).await;

    let verdict = guard.check(&headers(), None).await;
    assert!(!verdict.success);
    assert_eq!(verdict.status_code, 500);
}
