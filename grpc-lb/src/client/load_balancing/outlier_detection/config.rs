/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Parsing and validation of the `outlier_detection_experimental` config.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::client::load_balancing::{
    LbConfig, LbPolicyBuilder, LbPolicyRegistry, ParsedJsonLbConfig,
};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_BASE_EJECTION_TIME: Duration = Duration::from_secs(30);
const DEFAULT_MAX_EJECTION_TIME: Duration = Duration::from_secs(300);
const DEFAULT_MAX_EJECTION_PERCENT: u32 = 10;

/// Error produced when an outlier detection config is rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JSON did not have the expected shape.
    #[error("malformed outlier detection config: {0}")]
    Json(#[from] serde_json::Error),
    /// One or more fields hold invalid values.
    #[error("invalid outlier detection config: {}", join(.0))]
    Invalid(Vec<FieldError>),
}

/// A validation failure for a single field, identified by its JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parameters of the success rate algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessRateEjection {
    /// Scaled by 1000: an endpoint is an outlier if its success rate is below
    /// `mean - stdev * (stdev_factor / 1000)`.
    pub stdev_factor: u32,
    pub enforcement_percentage: u32,
    pub minimum_hosts: u32,
    pub request_volume: u32,
}

impl Default for SuccessRateEjection {
    fn default() -> Self {
        Self {
            stdev_factor: 1900,
            enforcement_percentage: 100,
            minimum_hosts: 5,
            request_volume: 100,
        }
    }
}

/// Parameters of the failure percentage algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePercentageEjection {
    pub threshold: u32,
    pub enforcement_percentage: u32,
    pub minimum_hosts: u32,
    pub request_volume: u32,
}

impl Default for FailurePercentageEjection {
    fn default() -> Self {
        Self {
            threshold: 85,
            enforcement_percentage: 100,
            minimum_hosts: 5,
            request_volume: 50,
        }
    }
}

/// A validated outlier detection config.
#[derive(Clone)]
pub struct OutlierDetectionConfig {
    pub interval: Duration,
    pub base_ejection_time: Duration,
    pub max_ejection_time: Duration,
    pub max_ejection_percent: u32,
    pub success_rate_ejection: Option<SuccessRateEjection>,
    pub failure_percentage_ejection: Option<FailurePercentageEjection>,
    pub(super) child_policy: Arc<dyn LbPolicyBuilder>,
    pub(super) child_config: Option<LbConfig>,
}

impl OutlierDetectionConfig {
    /// Whether any ejection algorithm is configured.  Without one, calls are
    /// not counted and nothing is ever ejected.
    pub fn counting_enabled(&self) -> bool {
        self.success_rate_ejection.is_some() || self.failure_percentage_ejection.is_some()
    }

    /// The name of the child policy the config selected.
    pub fn child_policy_name(&self) -> &'static str {
        self.child_policy.name()
    }

    /// Parses and validates `config`, resolving `childPolicy` against
    /// `registry`.  Every invalid field is reported, not just the first.
    pub fn from_json(
        config: &ParsedJsonLbConfig,
        registry: &LbPolicyRegistry,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfig = config.convert_to()?;
        let mut errors = Vec::new();

        let interval = duration_field(&mut errors, "interval", raw.interval, DEFAULT_INTERVAL);
        if interval.is_zero() {
            errors.push(FieldError::new("interval", "value must be greater than 0"));
        }
        let base_ejection_time = duration_field(
            &mut errors,
            "baseEjectionTime",
            raw.base_ejection_time,
            DEFAULT_BASE_EJECTION_TIME,
        );
        let max_ejection_time = duration_field(
            &mut errors,
            "maxEjectionTime",
            raw.max_ejection_time,
            base_ejection_time.max(DEFAULT_MAX_EJECTION_TIME),
        );
        let max_ejection_percent = raw
            .max_ejection_percent
            .unwrap_or(DEFAULT_MAX_EJECTION_PERCENT);
        percent_field(&mut errors, "maxEjectionPercent", max_ejection_percent);

        let success_rate_ejection = raw.success_rate_ejection.map(|raw| {
            let defaults = SuccessRateEjection::default();
            let cfg = SuccessRateEjection {
                stdev_factor: raw.stdev_factor.unwrap_or(defaults.stdev_factor),
                enforcement_percentage: raw
                    .enforcement_percentage
                    .unwrap_or(defaults.enforcement_percentage),
                minimum_hosts: raw.minimum_hosts.unwrap_or(defaults.minimum_hosts),
                request_volume: raw.request_volume.unwrap_or(defaults.request_volume),
            };
            percent_field(
                &mut errors,
                "successRateEjection.enforcementPercentage",
                cfg.enforcement_percentage,
            );
            cfg
        });

        let failure_percentage_ejection = raw.failure_percentage_ejection.map(|raw| {
            let defaults = FailurePercentageEjection::default();
            let cfg = FailurePercentageEjection {
                threshold: raw.threshold.unwrap_or(defaults.threshold),
                enforcement_percentage: raw
                    .enforcement_percentage
                    .unwrap_or(defaults.enforcement_percentage),
                minimum_hosts: raw.minimum_hosts.unwrap_or(defaults.minimum_hosts),
                request_volume: raw.request_volume.unwrap_or(defaults.request_volume),
            };
            percent_field(&mut errors, "failurePercentageEjection.threshold", cfg.threshold);
            percent_field(
                &mut errors,
                "failurePercentageEjection.enforcementPercentage",
                cfg.enforcement_percentage,
            );
            cfg
        });

        let child = match raw.child_policy {
            None => {
                errors.push(FieldError::new("childPolicy", "field not present"));
                None
            }
            Some(list) => child_policy_field(&mut errors, list, registry),
        };

        match child {
            Some((child_policy, child_config)) if errors.is_empty() => Ok(Self {
                interval,
                base_ejection_time,
                max_ejection_time,
                max_ejection_percent,
                success_rate_ejection,
                failure_percentage_ejection,
                child_policy,
                child_config,
            }),
            _ => Err(ConfigError::Invalid(errors)),
        }
    }
}

impl Debug for OutlierDetectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutlierDetectionConfig")
            .field("interval", &self.interval)
            .field("base_ejection_time", &self.base_ejection_time)
            .field("max_ejection_time", &self.max_ejection_time)
            .field("max_ejection_percent", &self.max_ejection_percent)
            .field("success_rate_ejection", &self.success_rate_ejection)
            .field("failure_percentage_ejection", &self.failure_percentage_ejection)
            .field("child_policy", &self.child_policy.name())
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    interval: Option<String>,
    base_ejection_time: Option<String>,
    max_ejection_time: Option<String>,
    max_ejection_percent: Option<u32>,
    success_rate_ejection: Option<RawSuccessRateEjection>,
    failure_percentage_ejection: Option<RawFailurePercentageEjection>,
    child_policy: Option<Vec<Map<String, Value>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSuccessRateEjection {
    stdev_factor: Option<u32>,
    enforcement_percentage: Option<u32>,
    minimum_hosts: Option<u32>,
    request_volume: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFailurePercentageEjection {
    threshold: Option<u32>,
    enforcement_percentage: Option<u32>,
    minimum_hosts: Option<u32>,
    request_volume: Option<u32>,
}

fn duration_field(
    errors: &mut Vec<FieldError>,
    field: &str,
    value: Option<String>,
    default: Duration,
) -> Duration {
    match value.as_deref().map(parse_duration) {
        None => default,
        Some(Ok(d)) => d,
        Some(Err(msg)) => {
            errors.push(FieldError::new(field, msg));
            default
        }
    }
}

fn percent_field(errors: &mut Vec<FieldError>, field: &str, value: u32) {
    if value > 100 {
        errors.push(FieldError::new(field, "value must be <= 100"));
    }
}

// Entries are tried in order; the first one naming a registered policy is
// used and the rest are ignored.
fn child_policy_field(
    errors: &mut Vec<FieldError>,
    list: Vec<Map<String, Value>>,
    registry: &LbPolicyRegistry,
) -> Option<(Arc<dyn LbPolicyBuilder>, Option<LbConfig>)> {
    for (i, entry) in list.into_iter().enumerate() {
        if entry.len() != 1 {
            errors.push(FieldError::new(
                format!("childPolicy[{i}]"),
                format!("expected exactly one policy, found {}", entry.len()),
            ));
            return None;
        }
        let Some((name, value)) = entry.into_iter().next() else {
            continue;
        };
        let Some(builder) = registry.get_policy(&name) else {
            tracing::debug!(policy = %name, "skipping unregistered child policy");
            continue;
        };
        return match builder.parse_config(&ParsedJsonLbConfig::from_value(value)) {
            Ok(config) => Some((builder, config)),
            Err(e) => {
                errors.push(FieldError::new(
                    format!("childPolicy[{i}].{name}"),
                    e.to_string(),
                ));
                None
            }
        };
    }
    errors.push(FieldError::new("childPolicy", "no supported policy found"));
    None
}

/// Parses a duration in its protobuf JSON form: decimal seconds with up to
/// nine fractional digits and an `s` suffix, e.g. `"10s"` or `"0.25s"`.
pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    let Some(number) = s.strip_suffix('s') else {
        return Err(format!("invalid duration {s:?}: missing 's' suffix"));
    };
    if number.starts_with('-') {
        return Err(format!("invalid duration {s:?}: must not be negative"));
    }
    let (secs, frac) = match number.split_once('.') {
        Some((secs, frac)) => (secs, Some(frac)),
        None => (number, None),
    };
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid duration {s:?}"));
    }
    let secs: u64 = secs
        .parse()
        .map_err(|_| format!("invalid duration {s:?}: seconds out of range"))?;
    let nanos = match frac {
        None => 0,
        Some(frac) => {
            if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("invalid duration {s:?}"));
            }
            // Right-pad to nanosecond precision.
            let scale = 10u32.pow(9 - frac.len() as u32);
            frac.parse::<u32>()
                .map_err(|_| format!("invalid duration {s:?}"))?
                * scale
        }
    };
    Ok(Duration::new(secs, nanos))
}
