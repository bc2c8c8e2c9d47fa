//! Geolocation analysis
//!
//! Resolves client IPs against optional MaxMind city/country databases
//! (results cached in the store for 24 h), keeps a short per-session location
//! history, and scores four travel heuristics over that history: presence in
//! a high-risk country, country hopping, frequent city switching and
//! physically impossible movement.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use maxminddb::geoip2;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::config::Parameters;
use crate::device::is_internal;
use crate::error::{GuardError, GuardResult};
use crate::score::{RiskFlag, SubScore};
use crate::store::{keys, Store};

const GEO_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
/// Location history cap per session
pub const HISTORY_CAP: usize = 10;
/// Location history TTL
pub const HISTORY_TTL: Duration = Duration::from_secs(24 * 3600);

const HOUR_MS: i64 = 3_600_000;
const HALF_HOUR_MS: i64 = 1_800_000;

/// Resolved location for an IP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    pub timestamp: i64,
    pub ip: String,
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_radius: u16,
    /// Whether the record came from the city database (full detail).
    pub is_detail: bool,
}

/// One parsed history entry (`ts:cc:city:lat:lon`).
#[derive(Debug, Clone, PartialEq)]
pub struct GeoPoint {
    pub ts_ms: i64,
    pub country_code: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

/// MaxMind-backed IP locator.
pub struct GeoResolver {
    city_db: Option<maxminddb::Reader<Vec<u8>>>,
    country_db: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoResolver {
    /// Open the configured databases. Each one is optional and failure to
    /// open is logged; `None` comes back only when no database is usable.
    pub fn open(city: Option<&Path>, country: Option<&Path>) -> Option<Self> {
        if city.is_none() && country.is_none() {
            return None;
        }

        let city_db = city.and_then(|path| match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Some(reader),
            Err(err) => {
                warn!("failed to open city database {:?}: {}", path, err);
                None
            }
        });
        let country_db = country.and_then(|path| match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Some(reader),
            Err(err) => {
                warn!("failed to open country database {:?}: {}", path, err);
                None
            }
        });

        if city_db.is_none() && country_db.is_none() {
            return None;
        }

        Some(Self { city_db, country_db })
    }

    /// Resolve an IP to a location, via the 24 h store cache. Internal IPs
    /// get a bare record without touching the databases.
    pub async fn locate(&self, store: &dyn Store, ip: &str) -> GuardResult<Location> {
        let parsed = IpAddr::from_str(ip)
            .map_err(|_| GuardError::GeoUnavailable(format!("invalid IP {ip}")))?;

        if is_internal(parsed) {
            return Ok(Location {
                ip: ip.to_string(),
                ..Location::default()
            });
        }

        let cache_key = keys::geo_ip(ip);
        if let Some(json) = store.get(&cache_key).await? {
            if let Ok(location) = serde_json::from_str::<Location>(&json) {
                return Ok(location);
            }
        }

        let mut location = self.query(parsed)?;
        location.ip = ip.to_string();

        match serde_json::to_string(&location) {
            Ok(json) => {
                if let Err(err) = store.set(&cache_key, &json, Some(GEO_CACHE_TTL)).await {
                    warn!("failed to cache location for {}: {}", ip, err);
                }
            }
            Err(err) => warn!("failed to serialize location for {}: {}", ip, err),
        }

        Ok(location)
    }

    fn query(&self, ip: IpAddr) -> GuardResult<Location> {
        if let Some(reader) = &self.city_db {
            if let Ok(record) = reader.lookup::<geoip2::City>(ip) {
                let mut location = Location::default();

                if let Some(country) = record.country {
                    location.country = name_en(country.names.as_ref());
                    location.country_code =
                        country.iso_code.unwrap_or_default().to_string();
                }
                if let Some(city) = record.city {
                    location.city = name_en(city.names.as_ref());
                }
                if let Some(loc) = record.location {
                    location.timezone = loc.time_zone.unwrap_or_default().to_string();
                    location.latitude = loc.latitude.unwrap_or_default();
                    location.longitude = loc.longitude.unwrap_or_default();
                    location.accuracy_radius = loc.accuracy_radius.unwrap_or_default();
                }
                location.is_detail = true;

                return Ok(location);
            }
        }

        if let Some(reader) = &self.country_db {
            if let Ok(record) = reader.lookup::<geoip2::Country>(ip) {
                let mut location = Location::default();
                if let Some(country) = record.country {
                    location.country = name_en(country.names.as_ref());
                    location.country_code =
                        country.iso_code.unwrap_or_default().to_string();
                }
                return Ok(location);
            }
        }

        Err(GuardError::GeoUnavailable(format!(
            "{ip} not found in any database"
        )))
    }
}

fn name_en(names: Option<&std::collections::BTreeMap<&str, &str>>) -> String {
    names
        .and_then(|names| names.get("en"))
        .map(|name| name.to_string())
        .unwrap_or_default()
}

/// Serialize a location for the per-session history list.
pub fn history_entry(now_ms: i64, location: &Location) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        now_ms, location.country_code, location.city, location.latitude, location.longitude
    )
}

/// Parse raw history entries, newest first. Malformed entries are skipped.
pub fn parse_history(raw: &[String]) -> Vec<GeoPoint> {
    let mut points = Vec::with_capacity(raw.len());

    for line in raw {
        let parts: Vec<&str> = line.splitn(5, ':').collect();
        if parts.len() < 5 {
            continue;
        }

        let ts_ms = match parts[0].parse::<i64>() {
            Ok(ts) => ts,
            Err(_) => continue,
        };
        let lat = match parts[3].parse::<f64>() {
            Ok(lat) => lat,
            Err(_) => continue,
        };
        let lon = match parts[4].parse::<f64>() {
            Ok(lon) => lon,
            Err(_) => continue,
        };

        points.push(GeoPoint {
            ts_ms,
            country_code: parts[1].to_string(),
            city: parts[2].to_string(),
            lat,
            lon,
        });
    }

    points
}

/// Run the four travel heuristics over a session's history.
pub(crate) fn evaluate(points: &[GeoPoint], now_ms: i64, params: &Parameters, out: &mut SubScore) {
    if points.is_empty() {
        return;
    }

    check_high_risk(points, params, out);
    check_hopping(points, now_ms, params, out);
    check_frequent_switch(points, now_ms, params, out);
    check_rapid_change(points, params, out);
}

fn check_high_risk(points: &[GeoPoint], params: &Parameters, out: &mut SubScore) {
    let risky: HashSet<&str> = params
        .high_risk_countries
        .iter()
        .map(String::as_str)
        .collect();
    if risky.is_empty() {
        return;
    }

    let hits: HashSet<&str> = points
        .iter()
        .filter(|p| risky.contains(p.country_code.as_str()))
        .map(|p| p.country_code.as_str())
        .collect();

    if !hits.is_empty() {
        out.hit(
            RiskFlag::GeoHighRisk,
            params.score_geo_high_risk,
            json!({ "count": hits.len(), "countries": hits.iter().collect::<Vec<_>>() }),
        );
    }
}

fn check_hopping(points: &[GeoPoint], now_ms: i64, params: &Parameters, out: &mut SubScore) {
    let recent: HashSet<&str> = points
        .iter()
        .filter(|p| p.ts_ms >= now_ms - HOUR_MS)
        .map(|p| p.country_code.as_str())
        .collect();

    // more than 4 countries within the hour
    if recent.len() > 4 {
        out.hit(
            RiskFlag::GeoHopping,
            params.score_geo_hopping,
            json!({ "count": recent.len(), "countries": recent.iter().collect::<Vec<_>>() }),
        );
    }
}

fn check_frequent_switch(points: &[GeoPoint], now_ms: i64, params: &Parameters, out: &mut SubScore) {
    let recent: Vec<&GeoPoint> = points
        .iter()
        .filter(|p| p.ts_ms >= now_ms - HOUR_MS)
        .collect();
    let cities: HashSet<&str> = recent.iter().map(|p| p.city.as_str()).collect();

    if cities.len() < 4 || recent.len() < 5 {
        return;
    }

    let switches = recent
        .windows(2)
        .filter(|pair| pair[0].city != pair[1].city)
        .count();

    if switches > 4 {
        out.hit(
            RiskFlag::GeoFrequentSwitch,
            params.score_geo_frequent_switch,
            json!({ "switches": switches, "cities": cities.iter().collect::<Vec<_>>() }),
        );
    }
}

fn check_rapid_change(points: &[GeoPoint], params: &Parameters, out: &mut SubScore) {
    if points.len() < 2 {
        return;
    }

    // list is newest-first
    let recent = &points[0];
    let prev = &points[1];

    let time_diff = recent.ts_ms - prev.ts_ms;
    if time_diff >= HOUR_MS {
        return;
    }

    let distance = haversine_km(prev.lat, prev.lon, recent.lat, recent.lon);
    let hours = time_diff as f64 / HOUR_MS as f64;
    let speed = distance / hours;

    // faster than airline speed, or a long jump inside half an hour
    if speed > 800.0 || (distance > 500.0 && time_diff < HALF_HOUR_MS) {
        out.hit(
            RiskFlag::RapidGeoChange,
            params.score_geo_rapid_change,
            json!({
                "from": format!("{}:{}", prev.country_code, prev.city),
                "to": format!("{}:{}", recent.country_code, recent.city),
                "time_ms": time_diff,
                "distance_km": distance,
                "speed_kmh": speed,
            }),
        );
    }
}

/// Great-circle distance in kilometres (R = 6371 km).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const R: f64 = 6371.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    R * c
}
