//! Dynamic risk scoring
//!
//! Four sub-evaluators (`basic`, `geo`, `behavior`, `fingerprint`) run as
//! concurrent tasks publishing their partial results onto a joining channel.
//! The coordinator merges flags, points and detail, applies a corroboration
//! bonus when more than four distinct signals fired, caps the score at 100
//! and auto-blocks the IP when the uncapped total reaches 100.
//!
//! A failed sub-evaluator is logged and contributes nothing; the admission
//! decision always gets whatever the remaining evaluators produced.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Parameters;
use crate::counters;
use crate::error::GuardResult;
use crate::geo::{self, GeoResolver};
use crate::store::{keys, Store};
use crate::{Device, Guardian};

const HOUR_TTL: Duration = Duration::from_secs(3600);
const MINUTE_TTL: Duration = Duration::from_secs(60);
const SESSION_START_TTL: Duration = Duration::from_secs(15 * 60);
const INTERVAL_CAP: usize = 10;

/// Score granted when more than four distinct signals corroborate.
const CORROBORATION_BONUS: i64 = 25;
/// Sample floor below which interval statistics are meaningless.
const MIN_INTERVAL_SAMPLES: usize = 5;
/// Milliseconds under which a request interval counts as "too fast".
const TOO_FAST_MS: i64 = 500;

/// A triggered heuristic, attached to every risk decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiskFlag {
    SessionMultiIp,
    IpMultiDevice,
    DeviceMultiIp,
    NotFound404,
    LoginFailure,
    FpMultiSession,
    GeoHighRisk,
    GeoHopping,
    GeoFrequentSwitch,
    RapidGeoChange,
    IntervalRequest,
    TooFrequentRequests,
    ExtremelyRegular,
    ModerateLongConnection,
    LongConnection,
    ExtremelyLongConnection,
}

impl RiskFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::SessionMultiIp => "session_multi_ip",
            RiskFlag::IpMultiDevice => "ip_multi_device",
            RiskFlag::DeviceMultiIp => "device_multi_ip",
            RiskFlag::NotFound404 => "not_found_404",
            RiskFlag::LoginFailure => "login_failure",
            RiskFlag::FpMultiSession => "fp_multi_session",
            RiskFlag::GeoHighRisk => "geo_high_risk",
            RiskFlag::GeoHopping => "geo_hopping",
            RiskFlag::GeoFrequentSwitch => "geo_frequent_switching",
            RiskFlag::RapidGeoChange => "rapid_geo_change",
            RiskFlag::IntervalRequest => "interval_request",
            RiskFlag::TooFrequentRequests => "too_frequent_requests",
            RiskFlag::ExtremelyRegular => "extremely_regular",
            RiskFlag::ModerateLongConnection => "moderate_long_connection",
            RiskFlag::LongConnection => "long_connection",
            RiskFlag::ExtremelyLongConnection => "extremely_long_connection",
        }
    }
}

impl std::fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RiskFlag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Partial result of one sub-evaluator.
#[derive(Debug, Default)]
pub(crate) struct SubScore {
    pub(crate) flags: Vec<RiskFlag>,
    pub(crate) points: i64,
    pub(crate) detail: Map<String, Value>,
}

impl SubScore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a triggered flag with its points and supporting detail.
    pub(crate) fn hit(&mut self, flag: RiskFlag, points: i64, detail: Value) {
        self.flags.push(flag);
        self.points += points;
        self.detail.insert(flag.as_str().to_string(), detail);
    }

    fn merge(&mut self, other: SubScore) {
        self.flags.extend(other.flags);
        self.points += other.points;
        self.detail.extend(other.detail);
    }
}

/// Final scoring verdict for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreOutcome {
    pub is_block: bool,
    pub is_suspicious: bool,
    pub is_dangerous: bool,
    pub flags: Vec<RiskFlag>,
    pub score: i64,
    pub detail: Map<String, Value>,
}

fn total_with_bonus(sub: &SubScore) -> i64 {
    let mut total = sub.points;
    if sub.detail.len() > 4 {
        total += CORROBORATION_BONUS;
    }
    total
}

/// Run all applicable sub-evaluators for a device and combine their results.
pub(crate) async fn dynamic_score(guardian: &Guardian, device: &Device) -> ScoreOutcome {
    let device = Arc::new(device.clone());
    let (tx, mut rx) = mpsc::channel::<(&'static str, GuardResult<SubScore>)>(4);

    {
        let store = guardian.store.clone();
        let params = guardian.params.clone();
        let device = device.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = eval_basic(store, params, device).await;
            let _ = tx.send(("basic", result)).await;
        });
    }

    if let Some(resolver) = &guardian.geo {
        if !device.flags.internal {
            let resolver = resolver.clone();
            let store = guardian.store.clone();
            let params = guardian.params.clone();
            let device = device.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let now_ms = Utc::now().timestamp_millis();
                let result = eval_geo(resolver, store, params, device, now_ms).await;
                let _ = tx.send(("geo", result)).await;
            });
        }
    }

    {
        let store = guardian.store.clone();
        let params = guardian.params.clone();
        let device = device.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let now_ms = Utc::now().timestamp_millis();
            let result = eval_behavior(store, params, device, now_ms).await;
            let _ = tx.send(("behavior", result)).await;
        });
    }

    {
        let store = guardian.store.clone();
        let params = guardian.params.clone();
        let device = device.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let now_ms = Utc::now().timestamp_millis();
            let result = eval_fingerprint(store, params, device, now_ms).await;
            let _ = tx.send(("fingerprint", result)).await;
        });
    }

    drop(tx);

    let mut merged = SubScore::new();
    while let Some((name, result)) = rx.recv().await {
        match result {
            Ok(sub) => merged.merge(sub),
            Err(err) => warn!("{} risk evaluator failed: {}", name, err),
        }
    }

    let raw = total_with_bonus(&merged);
    let score = raw.min(100);

    if raw >= 100 {
        if let Err(err) = guardian
            .block
            .add(&device.ip.address, "Score greater than 100")
            .await
        {
            warn!("failed to block {}: {}", device.ip.address, err);
        }
    }

    ScoreOutcome {
        is_block: score >= 100,
        is_suspicious: score >= guardian.params.score_suspicious,
        is_dangerous: score >= guardian.params.score_dangerous,
        flags: merged.flags,
        score,
        detail: merged.detail,
    }
}

/// Two-tier rule shared by every cardinality signal: exceeding the threshold
/// scores the base points, exceeding 1.5x the threshold doubles them.
fn two_tier(out: &mut SubScore, flag: RiskFlag, observed: i64, threshold: i64, points: i64) {
    let severe = (threshold as f64 * 1.5).floor() as i64;
    if observed > severe {
        out.hit(flag, points * 2, json!(observed));
    } else if observed > threshold {
        out.hit(flag, points, json!(observed));
    }
}

// =============================================================================
// Sub-evaluators
// =============================================================================

/// Cardinality abuse: session spread over IPs, IP spread over devices,
/// device spread over IPs, plus the 404 / login-failure tallies.
async fn eval_basic(
    store: Arc<dyn Store>,
    params: Arc<Parameters>,
    device: Arc<Device>,
) -> GuardResult<SubScore> {
    let mut out = SubScore::new();

    let probes = [
        (
            keys::session_ip(&device.session_id),
            device.ip.address.clone(),
            params.session_multi_ip,
            RiskFlag::SessionMultiIp,
            params.score_session_multi_ip,
        ),
        (
            keys::ip_device(&device.ip.address),
            device.fingerprint.clone(),
            params.ip_multi_device,
            RiskFlag::IpMultiDevice,
            params.score_ip_multi_device,
        ),
        (
            keys::device_fp(&device.fingerprint),
            device.ip.address.clone(),
            params.device_multi_ip,
            RiskFlag::DeviceMultiIp,
            params.score_device_multi_ip,
        ),
    ];

    for (key, member, threshold, flag, points) in probes {
        let card = store.sadd_card(&key, &member, HOUR_TTL).await?;
        two_tier(&mut out, flag, card, threshold, points);
    }

    let not_found = counters::read(&*store, &keys::not_found_404(&device.session_id)).await?;
    two_tier(
        &mut out,
        RiskFlag::NotFound404,
        not_found,
        params.not_found_404,
        params.score_not_found_404,
    );

    let failures = counters::read(&*store, &keys::login_failure(&device.session_id)).await?;
    two_tier(
        &mut out,
        RiskFlag::LoginFailure,
        failures,
        params.login_failure,
        params.score_login_failure,
    );

    Ok(out)
}

/// Location history heuristics; only runs when a geo database is configured
/// and the client is not internal.
async fn eval_geo(
    resolver: Arc<GeoResolver>,
    store: Arc<dyn Store>,
    params: Arc<Parameters>,
    device: Arc<Device>,
    now_ms: i64,
) -> GuardResult<SubScore> {
    let mut out = SubScore::new();

    let location = resolver.locate(&*store, &device.ip.address).await?;
    let entry = geo::history_entry(now_ms, &location);
    let raw = store
        .lpush_trim(
            &keys::geo_locations(&device.session_id),
            &entry,
            geo::HISTORY_CAP,
            geo::HISTORY_TTL,
        )
        .await?;

    let points = geo::parse_history(&raw);
    geo::evaluate(&points, now_ms, &params, &mut out);

    Ok(out)
}

/// Request-interval statistics and session-duration tiers.
async fn eval_behavior(
    store: Arc<dyn Store>,
    params: Arc<Parameters>,
    device: Arc<Device>,
    now_ms: i64,
) -> GuardResult<SubScore> {
    let mut out = SubScore::new();

    let last_key = keys::interval_last(&device.session_id);
    let start_key = keys::session_start(&device.session_id);

    let mut fetched = store
        .get_many(&[last_key.clone(), start_key.clone()])
        .await?
        .into_iter();
    let last = fetched.next().flatten();
    let start = fetched.next().flatten();

    if let Some(last) = last.and_then(|v| v.parse::<i64>().ok()) {
        let delta = now_ms - last;
        let raw = store
            .lpush_trim(
                &keys::interval(&device.session_id),
                &delta.to_string(),
                INTERVAL_CAP,
                HOUR_TTL,
            )
            .await?;

        let values: Vec<i64> = raw.iter().filter_map(|v| v.parse().ok()).collect();
        if values.len() >= MIN_INTERVAL_SAMPLES {
            let mean = values.iter().sum::<i64>() as f64 / values.len() as f64;
            let variance = values
                .iter()
                .map(|&v| (v as f64 - mean).powi(2))
                .sum::<f64>()
                / values.len() as f64;
            let too_fast = values.iter().filter(|&&v| v < TOO_FAST_MS).count();

            if variance < 1000.0 && mean > 500.0 && mean < 30000.0 {
                out.hit(
                    RiskFlag::IntervalRequest,
                    params.score_interval_request,
                    json!({ "avg": mean, "variance": variance }),
                );
            }

            if too_fast >= 16 {
                out.hit(
                    RiskFlag::TooFrequentRequests,
                    params.score_frequency_request,
                    json!({ "count": too_fast, "total": values.len() }),
                );
            }

            if variance < 100.0 && values.len() >= 8 {
                out.hit(
                    RiskFlag::ExtremelyRegular,
                    params.score_interval_request * 3 / 2,
                    json!(variance),
                );
            }
        }
    }

    match start.and_then(|v| v.parse::<i64>().ok()) {
        None => {
            store
                .set(&start_key, &now_ms.to_string(), Some(SESSION_START_TTL))
                .await?;
        }
        Some(start) => {
            store.expire(&start_key, SESSION_START_TTL).await?;

            let duration = now_ms - start;
            if duration > 4 * 3600 * 1000 {
                out.hit(
                    RiskFlag::ExtremelyLongConnection,
                    params.score_long_connection * 2,
                    json!(duration),
                );
            } else if duration > 2 * 3600 * 1000 {
                out.hit(
                    RiskFlag::LongConnection,
                    params.score_long_connection * 3 / 2,
                    json!(duration),
                );
            } else if duration > 3600 * 1000 {
                out.hit(
                    RiskFlag::ModerateLongConnection,
                    params.score_long_connection,
                    json!(duration),
                );
            }
        }
    }

    store
        .set(&last_key, &now_ms.to_string(), Some(HOUR_TTL))
        .await?;

    Ok(out)
}

/// Distinct sessions seen for one fingerprint within the current minute.
async fn eval_fingerprint(
    store: Arc<dyn Store>,
    params: Arc<Parameters>,
    device: Arc<Device>,
    now_ms: i64,
) -> GuardResult<SubScore> {
    let mut out = SubScore::new();

    let minute = now_ms / 60_000;
    let key = keys::fp_session(minute, &device.fingerprint);
    let sessions = store
        .sadd_card(&key, &device.session_id, MINUTE_TTL)
        .await?;

    if sessions > 2 {
        out.hit(
            RiskFlag::FpMultiSession,
            params.score_fp_multi_session,
            json!(sessions),
        );
    }

    Ok(out)
}
