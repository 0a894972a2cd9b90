//! Route-table configuration and per-route chaos policy parsing.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Chance to fail a request before it is forwarded, integer 0-100.
pub const BEFORE_REQUEST_FAILURE_PERCENT: &str = "BeforeRequestFailurePercent";
/// Chance to corrupt or abort after the response exists, integer 0-100.
pub const AFTER_RESPONSE_FAILURE_PERCENT: &str = "AfterResponseFailurePercent";
/// Maximum injected delay before forwarding, non-negative duration.
pub const BEFORE_REQUEST_MAX_LATENCY: &str = "BeforeRequestMaxLatency";
/// Maximum injected delay after the response, non-negative duration.
pub const AFTER_RESPONSE_MAX_LATENCY: &str = "AfterResponseMaxLatency";

const RECOGNIZED_KEYS: [&str; 4] = [
    BEFORE_REQUEST_FAILURE_PERCENT,
    AFTER_RESPONSE_FAILURE_PERCENT,
    BEFORE_REQUEST_MAX_LATENCY,
    AFTER_RESPONSE_MAX_LATENCY,
];

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Global settings.
    pub settings: Settings,
    /// Static route registration table, resolved once at startup.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the route table, aggregating every error into one report.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut names = std::collections::HashSet::new();

        for route in &self.routes {
            if route.name.is_empty() {
                errors.push("route name cannot be empty".to_string());
            } else if !names.insert(&route.name) {
                errors.push(format!("duplicate route name: {}", route.name));
            }
            if route.upstream.is_empty() {
                errors.push(format!("route {}: upstream cannot be empty", route.name));
            }
            errors.extend(
                validate_chaos(&route.chaos)
                    .errors
                    .into_iter()
                    .map(|e| format!("route {}: {e}", route.name)),
            );
        }

        if !errors.is_empty() {
            bail!("invalid gateway configuration: {}", errors.join("; "));
        }
        Ok(())
    }
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Global kill switch.
    pub enabled: bool,
    /// Emit events and log faults without applying them.
    pub dry_run: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
        }
    }
}

/// One entry of the route registration table.
///
/// Path and method matching, and the forward itself, belong to the routing
/// engine; this table is what the gateway hands it at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Unique route name.
    pub name: String,
    /// Path prefix the routing engine matches on.
    pub path_prefix: String,
    /// Methods the route accepts; empty means all.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Upstream base URL the route forwards to.
    pub upstream: String,
    /// Raw chaos settings for the route, string key to string value.
    #[serde(default)]
    pub chaos: HashMap<String, String>,
}

/// Validated, immutable chaos policies for one route.
///
/// Built once when the route is constructed; read concurrently by every
/// request on the route without locking. Any subset of stages may be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteChaos {
    pub before_request_failure: Option<u8>,
    pub after_response_failure: Option<u8>,
    pub before_request_latency: Option<Duration>,
    pub after_response_latency: Option<Duration>,
}

impl RouteChaos {
    /// Number of active stages.
    pub fn active_stages(&self) -> usize {
        usize::from(self.before_request_failure.is_some())
            + usize::from(self.after_response_failure.is_some())
            + usize::from(self.before_request_latency.is_some())
            + usize::from(self.after_response_latency.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.active_stages() == 0
    }

    /// Short human-readable summary for startup logs.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(max) = self.before_request_latency {
            parts.push(format!("latency-before<={}ms", max.as_millis()));
        }
        if let Some(p) = self.before_request_failure {
            parts.push(format!("fail-before={p}%"));
        }
        if let Some(p) = self.after_response_failure {
            parts.push(format!("fail-after={p}%"));
        }
        if let Some(max) = self.after_response_latency {
            parts.push(format!("latency-after<={}ms", max.as_millis()));
        }
        parts.join(", ")
    }
}

/// Per-key parse state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting<T> {
    /// The key is not in the route's chaos map.
    Absent,
    /// Present with a value in range.
    Valid(T),
    /// Present but the value does not parse or is out of range.
    Invalid(String),
}

impl<T> Setting<T> {
    pub fn is_present(&self) -> bool {
        !matches!(self, Setting::Absent)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Setting::Valid(value) => Some(value),
            _ => None,
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            Setting::Invalid(error) => Some(error),
            _ => None,
        }
    }
}

/// Outcome of validating one route's chaos map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaosValidation {
    /// Whether any recognized chaos key is present, valid or not. A route
    /// carrying only invalid keys is still chaos-bearing and must fail
    /// loudly rather than silently pass through.
    pub matched: bool,
    /// Every invalid entry, collected in one pass.
    pub errors: Vec<String>,
}

/// Parse one failure-percent key: integer, inclusive 0-100.
pub fn parse_failure_percent(key: &str, values: &HashMap<String, String>) -> Setting<u8> {
    let Some(raw) = values.get(key) else {
        return Setting::Absent;
    };
    match raw.trim().parse::<i64>() {
        Ok(value) if (0..=100).contains(&value) => Setting::Valid(value as u8),
        _ => Setting::Invalid(format!(
            "invalid value for {key}: {raw} (expected an integer between 0 and 100)"
        )),
    }
}

/// Parse one max-latency key: non-negative duration, zero meaning no delay.
pub fn parse_max_latency(key: &str, values: &HashMap<String, String>) -> Setting<Duration> {
    let Some(raw) = values.get(key) else {
        return Setting::Absent;
    };
    match parse_duration(raw) {
        Ok(duration) => Setting::Valid(duration),
        Err(reason) => Setting::Invalid(format!("invalid value for {key}: {raw} ({reason})")),
    }
}

/// Parse a duration: `250ms`, `2s`, `1m`, or a bare integer in milliseconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    let (digits, unit_ms) = if let Some(rest) = trimmed.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = trimmed.strip_suffix('s') {
        (rest, 1_000)
    } else if let Some(rest) = trimmed.strip_suffix('m') {
        (rest, 60_000)
    } else {
        (trimmed, 1)
    };

    // Signed parse so a leading minus reads as a negative duration rather
    // than a generic parse failure.
    let value: i64 = digits
        .trim()
        .parse()
        .map_err(|_| "expected a duration such as 250ms, 2s, or 1m".to_string())?;
    if value < 0 {
        return Err("duration must not be negative".to_string());
    }
    (value as u64)
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| "duration is too large".to_string())
}

/// One-pass validation of a route's chaos map.
///
/// Never short-circuits: every invalid key ends up in the report. Keys the
/// gateway does not recognize are errors too (a typo must not silently
/// deactivate a stage) but do not count toward `matched`.
pub fn validate_chaos(values: &HashMap<String, String>) -> ChaosValidation {
    let before_failure = parse_failure_percent(BEFORE_REQUEST_FAILURE_PERCENT, values);
    let after_failure = parse_failure_percent(AFTER_RESPONSE_FAILURE_PERCENT, values);
    let before_latency = parse_max_latency(BEFORE_REQUEST_MAX_LATENCY, values);
    let after_latency = parse_max_latency(AFTER_RESPONSE_MAX_LATENCY, values);

    let matched = before_failure.is_present()
        || after_failure.is_present()
        || before_latency.is_present()
        || after_latency.is_present();

    let mut errors: Vec<String> = [
        before_failure.error(),
        after_failure.error(),
        before_latency.error(),
        after_latency.error(),
    ]
    .into_iter()
    .flatten()
    .map(str::to_string)
    .collect();

    let mut unknown: Vec<&str> = values
        .keys()
        .map(String::as_str)
        .filter(|key| !RECOGNIZED_KEYS.contains(key))
        .collect();
    unknown.sort_unstable();
    errors.extend(
        unknown
            .into_iter()
            .map(|key| format!("unrecognized chaos key: {key}")),
    );

    ChaosValidation { matched, errors }
}

/// Build the validated policy set for one route.
///
/// `Ok(None)` when no chaos key is present. Any invalid entry is fatal and
/// all of them are aggregated into the one error, so the route refuses to
/// activate instead of defaulting to "no chaos" or "always chaos".
pub fn build_chaos(values: &HashMap<String, String>) -> Result<Option<RouteChaos>> {
    let validation = validate_chaos(values);
    if !validation.errors.is_empty() {
        bail!("{}", validation.errors.join("; "));
    }
    if !validation.matched {
        return Ok(None);
    }

    Ok(Some(RouteChaos {
        before_request_failure: parse_failure_percent(BEFORE_REQUEST_FAILURE_PERCENT, values)
            .value(),
        after_response_failure: parse_failure_percent(AFTER_RESPONSE_FAILURE_PERCENT, values)
            .value(),
        before_request_latency: parse_max_latency(BEFORE_REQUEST_MAX_LATENCY, values).value(),
        after_response_latency: parse_max_latency(AFTER_RESPONSE_MAX_LATENCY, values).value(),
    }))
}
