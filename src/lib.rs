//! ip-sentinel: HTTP request-admission guard
//!
//! For each incoming request the guard decides allow / deny (403) /
//! internal-error while incrementally learning which clients are abusive.
//! Decisions combine three IP lists (trust / deny / temporary block), a
//! per-request device derivation (signed session cookie, fingerprint, IP,
//! geolocation) and a multi-signal risk score computed over short windows of
//! history in a shared Redis-compatible store.
//!
//! # Decision flow
//! ```text
//! request ──► device resolver ──► trust? ──► deny? ──► block escalation?
//!                                                           │
//!              ┌────────────────────────────────────────────┘
//!              ▼
//!         risk scorer (basic | geo | behavior | fingerprint, concurrent)
//!              │
//!              ▼
//!         rate-limit tier (normal | suspicious | dangerous) ──► verdict
//! ```
//!
//! The embedding application wires [`Guardian::check`] in as middleware (see
//! [`middleware`]) and reports 404s / failed logins through the public hooks
//! so the scorer can see them.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub mod block;
pub mod config;
pub mod counters;
pub mod device;
pub mod error;
pub mod geo;
pub mod list;
pub mod middleware;
pub mod notify;
pub mod score;
pub mod session;
pub mod store;

pub use config::{EmailConfig, FilePaths, GuardConfig, Parameters, StoreConfig};
pub use error::{GuardError, GuardResult};
pub use score::{RiskFlag, ScoreOutcome};

use block::BlockList;
use geo::GeoResolver;
use list::{DenyList, TrustList};
use notify::Mailer;
use store::{RedisStore, Store};

// =============================================================================
// Core Types
// =============================================================================

/// Device class derived from the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Desktop => "Desktop",
            DeviceKind::Mobile => "Mobile",
            DeviceKind::Tablet => "Tablet",
        }
    }
}

/// List membership and classification flags resolved for a request
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeviceFlags {
    pub trust: bool,
    pub ban: bool,
    pub block: bool,
    pub internal: bool,
    pub mobile: bool,
    pub tablet: bool,
    pub desktop: bool,
}

/// Client IP with its per-request counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpInfo {
    pub address: String,
    pub is_private: bool,
    pub level: u8,
    pub request_count: i64,
    pub block_count: i64,
}

/// Everything the engine derives about the requesting client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub platform: String,
    pub browser: String,
    pub os: String,
    pub kind: DeviceKind,
    pub accept_language: String,
    pub referer: String,
    pub session_id: String,
    pub fingerprint: String,
    pub ip: IpInfo,
    pub flags: DeviceFlags,
}

/// List entry for trust / deny / block. `count` and `last` are only
/// meaningful for block entries (recidivism tracking).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpEntry {
    pub ip: String,
    pub reason: String,
    pub added_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<i64>,
}

/// Admission verdict for one request
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub success: bool,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Renewed cookies to echo on the response (sliding session)
    #[serde(skip)]
    pub set_cookies: Vec<String>,
}

impl CheckResult {
    fn allow(set_cookies: Vec<String>) -> Self {
        Self {
            success: true,
            status_code: 200,
            error: None,
            set_cookies,
        }
    }

    fn forbid(message: String, set_cookies: Vec<String>) -> Self {
        Self {
            success: false,
            status_code: 403,
            error: Some(message),
            set_cookies,
        }
    }

    fn internal_error(message: &str) -> Self {
        Self {
            success: false,
            status_code: 500,
            error: Some(message.to_string()),
            set_cookies: Vec::new(),
        }
    }
}

// =============================================================================
// Guardian
// =============================================================================

/// The request-admission engine.
pub struct Guardian {
    pub(crate) params: Arc<Parameters>,
    pub(crate) store: Arc<dyn Store>,
    pub trust: TrustList,
    pub deny: DenyList,
    pub block: BlockList,
    pub(crate) geo: Option<Arc<GeoResolver>>,
}

impl Guardian {
    /// Connect to the configured store and assemble the engine.
    pub async fn new(config: GuardConfig) -> GuardResult<Self> {
        let store = RedisStore::connect(&config.store).await?;
        Self::with_store(config, Arc::new(store)).await
    }

    /// Assemble the engine on an externally provided store implementation.
    pub async fn with_store(config: GuardConfig, store: Arc<dyn Store>) -> GuardResult<Self> {
        let params = Arc::new(config.params.normalized());

        let mailer = config.email.clone().map(Mailer::new);

        let trust = TrustList::new(config.files.trust_list_path(), store.clone());
        if let Err(err) = trust.load().await {
            warn!("failed to load trust list: {}", err);
        }

        let deny_hook = mailer.map(|mailer| {
            Box::new(move |entry: &IpEntry| mailer.notify(&entry.ip, &entry.reason))
                as Box<dyn Fn(&IpEntry) + Send + Sync>
        });
        let deny = DenyList::new(config.files.deny_list_path(), store.clone(), deny_hook);
        if let Err(err) = deny.load().await {
            warn!("failed to load deny list: {}", err);
        }

        let block = BlockList::new(
            store.clone(),
            Duration::from_secs(params.block_ttl_min_secs),
            Duration::from_secs(params.block_ttl_max_secs),
        );

        let geo = GeoResolver::open(
            config.files.city_db.as_deref(),
            config.files.country_db.as_deref(),
        )
        .map(Arc::new);

        info!(
            "guard ready (geo: {}, rate limits: {}/{}/{})",
            geo.is_some(),
            params.rate_limit_normal,
            params.rate_limit_suspicious,
            params.rate_limit_dangerous
        );

        Ok(Self {
            params,
            store,
            trust,
            deny,
            block,
            geo,
        })
    }

    /// Admit or reject one request.
    ///
    /// `peer` is the socket peer address; proxy headers take precedence over
    /// it when deriving the client IP. The returned cookies must be echoed on
    /// the response whatever the verdict.
    pub async fn check(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> CheckResult {
        let (device, cookies) = match self.resolve_device(headers, peer).await {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("failed to resolve device: {}", err);
                return CheckResult::internal_error("Failed to resolve device");
            }
        };
        let ip = device.ip.address.clone();

        // 1. Trusted IPs bypass everything
        if device.flags.trust {
            return CheckResult::allow(cookies);
        }

        // 2. Deny list
        if device.flags.ban {
            return CheckResult::forbid(format!("IP {ip} is banned"), cookies);
        }

        // 3. Blocked and still hammering: escalate to the deny list
        if device.flags.block && device.ip.block_count >= self.params.block_to_deny {
            if let Err(err) = self
                .deny
                .add(&ip, "Kept requesting while blocked")
                .await
            {
                warn!("failed to escalate {} to the deny list: {}", ip, err);
            }
            return CheckResult::forbid(format!("IP {ip} is banned"), cookies);
        }

        // 4. Dynamic risk score; the scorer blocks the IP itself at >= 100
        let outcome = score::dynamic_score(self, &device).await;
        if outcome.is_block {
            return CheckResult::forbid(format!("IP {ip} is blocked"), cookies);
        }

        // 5-7. Tiered rate limits, strictest class first
        if outcome.is_dangerous && device.ip.request_count >= self.params.rate_limit_dangerous {
            return CheckResult::forbid(
                format!("IP {ip} reached rate limit (Dangerous)"),
                cookies,
            );
        }
        if outcome.is_suspicious && device.ip.request_count >= self.params.rate_limit_suspicious {
            return CheckResult::forbid(
                format!("IP {ip} reached rate limit (Suspicious)"),
                cookies,
            );
        }
        if device.ip.request_count >= self.params.rate_limit_normal {
            return CheckResult::forbid(format!("IP {ip} reached rate limit (Normal)"), cookies);
        }

        // 8. Admitted
        CheckResult::allow(cookies)
    }

    /// Report a 404 response for this request's session.
    pub async fn not_found_404(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> GuardResult<()> {
        let (device, _) = self.resolve_device(headers, peer).await?;
        counters::record_not_found(&*self.store, &device.session_id).await?;
        Ok(())
    }

    /// Report a failed login for this request's session.
    pub async fn login_failure(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> GuardResult<()> {
        let (device, _) = self.resolve_device(headers, peer).await?;
        counters::record_login_failure(&*self.store, &device.session_id).await?;
        Ok(())
    }

    /// Derive the device tuple and the cookies to echo back.
    async fn resolve_device(
        &self,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> GuardResult<(Device, Vec<String>)> {
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let (address, internal) = device::client_ip(headers, peer)?;

        let trust = self.trust.check(&address).await;
        let ban = self.deny.check(&address).await;
        let block = self.block.is_blocked(&address).await;

        let request_count = counters::request_count_in_minute(&*self.store, &address)
            .await
            .unwrap_or(1);
        let block_count = if block {
            counters::block_recurrence(&*self.store, &address)
                .await
                .unwrap_or(0)
        } else {
            0
        };

        let mut cookies = Vec::with_capacity(2);

        // session cookie: verify and slide, or mint fresh
        let existing = session::cookie_value(headers, session::SESSION_COOKIE)
            .and_then(|raw| session::parse(&raw).map(|id| (raw, id)));
        let session_id = match existing {
            Some((raw, id)) => {
                cookies.push(session::cookie_header(
                    session::SESSION_COOKIE,
                    &raw,
                    session::SESSION_MAX_AGE,
                ));
                id
            }
            None => {
                let (id, wire) = session::mint()?;
                cookies.push(session::cookie_header(
                    session::SESSION_COOKIE,
                    &wire,
                    session::SESSION_MAX_AGE,
                ));
                id
            }
        };

        // device cookie: reuse the token or mint one
        let token = session::cookie_value(headers, session::DEVICE_COOKIE)
            .unwrap_or_else(|| session::random_token(session::DEVICE_TOKEN_LEN));
        cookies.push(session::cookie_header(
            session::DEVICE_COOKIE,
            &token,
            session::DEVICE_MAX_AGE,
        ));

        let platform = device::platform(user_agent);
        let browser = device::browser(user_agent);
        let os = device::os(user_agent);
        let kind = device::kind(user_agent);
        let fingerprint = session::fingerprint(platform, browser, kind.as_str(), &os, &token);

        let device = Device {
            platform: platform.to_string(),
            browser: browser.to_string(),
            os,
            kind,
            accept_language: headers
                .get(header::ACCEPT_LANGUAGE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            referer: headers
                .get(header::REFERER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            session_id,
            fingerprint,
            ip: IpInfo {
                address,
                is_private: internal,
                level: if internal { 1 } else { 0 },
                request_count,
                block_count,
            },
            flags: DeviceFlags {
                trust,
                ban,
                block,
                internal,
                mobile: kind == DeviceKind::Mobile,
                tablet: kind == DeviceKind::Tablet,
                desktop: kind == DeviceKind::Desktop,
            },
        };

        Ok((device, cookies))
    }
}
