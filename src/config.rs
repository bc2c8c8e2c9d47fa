//! Configuration
//!
//! Plain structs with serde support. Defaults are carried by the `Default`
//! impls; `Parameters::normalized` maps any non-positive configured value
//! back to its default so partial configs behave predictably.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

/// Hook producing a custom notification subject or body from `(ip, reason)`.
pub type NoticeHook = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Top-level guard configuration
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub store: StoreConfig,
    pub email: Option<EmailConfig>,
    pub files: FilePaths,
    pub params: Parameters,
}

/// Connection settings for the shared key-value store
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            password: String::new(),
            db: 0,
        }
    }
}

impl StoreConfig {
    /// Connection URL, with defaults applied for empty host / zero port.
    pub fn url(&self) -> String {
        let host = if self.host.is_empty() { "localhost" } else { &self.host };
        let port = if self.port == 0 { 6379 } else { self.port };
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", host, port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, host, port, self.db)
        }
    }
}

/// SMTP notification settings
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    /// Custom subject hook; empty output falls back to the default subject.
    #[serde(skip)]
    pub subject: Option<NoticeHook>,
    /// Custom body hook; empty output falls back to the default body.
    #[serde(skip)]
    pub body: Option<NoticeHook>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: Vec::new(),
            cc: Vec::new(),
            subject: None,
            body: None,
        }
    }
}

/// File locations: list snapshots and optional GeoIP databases
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilePaths {
    pub city_db: Option<PathBuf>,
    pub country_db: Option<PathBuf>,
    pub trust_list: Option<PathBuf>,
    pub deny_list: Option<PathBuf>,
}

impl FilePaths {
    pub fn trust_list_path(&self) -> PathBuf {
        self.trust_list
            .clone()
            .unwrap_or_else(|| PathBuf::from("./whiteList.json"))
    }

    pub fn deny_list_path(&self) -> PathBuf {
        self.deny_list
            .clone()
            .unwrap_or_else(|| PathBuf::from("./blackList.json"))
    }
}

/// Thresholds and score weights for the decision engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// ISO country codes treated as high risk
    pub high_risk_countries: Vec<String>,
    /// Block recurrences within an hour before escalation to the deny list
    pub block_to_deny: i64,
    /// Minimum block TTL in seconds
    pub block_ttl_min_secs: u64,
    /// Maximum block TTL in seconds
    pub block_ttl_max_secs: u64,
    pub rate_limit_normal: i64,
    pub rate_limit_suspicious: i64,
    pub rate_limit_dangerous: i64,
    /// Max distinct IPs per session
    pub session_multi_ip: i64,
    /// Max distinct fingerprints per IP
    pub ip_multi_device: i64,
    /// Max distinct IPs per fingerprint
    pub device_multi_ip: i64,
    /// Max login failures per session
    pub login_failure: i64,
    /// Max 404 responses per session
    pub not_found_404: i64,
    /// Score at which a client counts as suspicious
    pub score_suspicious: i64,
    /// Score at which a client counts as dangerous
    pub score_dangerous: i64,
    pub score_session_multi_ip: i64,
    pub score_ip_multi_device: i64,
    pub score_device_multi_ip: i64,
    pub score_fp_multi_session: i64,
    pub score_geo_high_risk: i64,
    pub score_geo_hopping: i64,
    pub score_geo_frequent_switch: i64,
    pub score_geo_rapid_change: i64,
    pub score_interval_request: i64,
    pub score_frequency_request: i64,
    pub score_long_connection: i64,
    pub score_login_failure: i64,
    pub score_not_found_404: i64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            high_risk_countries: Vec::new(),
            block_to_deny: 8,
            block_ttl_min_secs: 3600,
            block_ttl_max_secs: 30 * 24 * 3600,
            rate_limit_normal: 100,
            rate_limit_suspicious: 50,
            rate_limit_dangerous: 20,
            session_multi_ip: 4,
            ip_multi_device: 8,
            device_multi_ip: 4,
            login_failure: 4,
            not_found_404: 8,
            score_suspicious: 50,
            score_dangerous: 80,
            score_session_multi_ip: 25,
            score_ip_multi_device: 20,
            score_device_multi_ip: 15,
            score_fp_multi_session: 50,
            score_geo_high_risk: 30,
            score_geo_hopping: 15,
            score_geo_frequent_switch: 20,
            score_geo_rapid_change: 25,
            score_interval_request: 25,
            score_frequency_request: 25,
            score_long_connection: 15,
            score_login_failure: 15,
            score_not_found_404: 15,
        }
    }
}

impl Parameters {
    /// Replace every non-positive value with its default.
    pub fn normalized(mut self) -> Self {
        let d = Parameters::default();

        fn fix(value: &mut i64, fallback: i64) {
            if *value <= 0 {
                *value = fallback;
            }
        }

        fix(&mut self.block_to_deny, d.block_to_deny);
        if self.block_ttl_min_secs == 0 {
            self.block_ttl_min_secs = d.block_ttl_min_secs;
        }
        if self.block_ttl_max_secs == 0 {
            self.block_ttl_max_secs = d.block_ttl_max_secs;
        }
        fix(&mut self.rate_limit_normal, d.rate_limit_normal);
        fix(&mut self.rate_limit_suspicious, d.rate_limit_suspicious);
        fix(&mut self.rate_limit_dangerous, d.rate_limit_dangerous);
        fix(&mut self.session_multi_ip, d.session_multi_ip);
        fix(&mut self.ip_multi_device, d.ip_multi_device);
        fix(&mut self.device_multi_ip, d.device_multi_ip);
        fix(&mut self.login_failure, d.login_failure);
        fix(&mut self.not_found_404, d.not_found_404);
        fix(&mut self.score_suspicious, d.score_suspicious);
        fix(&mut self.score_dangerous, d.score_dangerous);
        fix(&mut self.score_session_multi_ip, d.score_session_multi_ip);
        fix(&mut self.score_ip_multi_device, d.score_ip_multi_device);
        fix(&mut self.score_device_multi_ip, d.score_device_multi_ip);
        fix(&mut self.score_fp_multi_session, d.score_fp_multi_session);
        fix(&mut self.score_geo_high_risk, d.score_geo_high_risk);
        fix(&mut self.score_geo_hopping, d.score_geo_hopping);
        fix(&mut self.score_geo_frequent_switch, d.score_geo_frequent_switch);
        fix(&mut self.score_geo_rapid_change, d.score_geo_rapid_change);
        fix(&mut self.score_interval_request, d.score_interval_request);
        fix(&mut self.score_frequency_request, d.score_frequency_request);
        fix(&mut self.score_long_connection, d.score_long_connection);
        fix(&mut self.score_login_failure, d.score_login_failure);
        fix(&mut self.score_not_found_404, d.score_not_found_404);

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_url() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.url(), "redis://localhost:6379/0");

        let cfg = StoreConfig {
            host: "cache.internal".into(),
            port: 6380,
            password: "secret".into(),
            db: 2,
        };
        assert_eq!(cfg.url(), "redis://:secret@cache.internal:6380/2");
    }

    #[test]
    fn test_normalized_restores_defaults() {
        let mut params = Parameters::default();
        params.rate_limit_normal = 0;
        params.block_to_deny = -1;
        params.score_geo_high_risk = 0;

        let params = params.normalized();
        assert_eq!(params.rate_limit_normal, 100);
        assert_eq!(params.block_to_deny, 8);
        assert_eq!(params.score_geo_high_risk, 30);
    }

    #[test]
    fn test_partial_json_config() {
        let cfg: GuardConfig =
            serde_json::from_str(r#"{"params": {"rate_limit_normal": 10}}"#).unwrap();
        assert_eq!(cfg.params.rate_limit_normal, 10);
        // untouched fields keep their defaults
        assert_eq!(cfg.params.block_to_deny, 8);
        assert_eq!(cfg.store.port, 6379);
    }
}
