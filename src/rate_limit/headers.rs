//! Exchange-reported quota headers.
//!
//! Families are tried in a fixed order and the first one present wins:
//!
//! | Source | Headers |
//! |---|---|
//! | Binance | `x-mbx-used-weight-*`, `x-mbx-order-count-*` |
//! | Bybit | `x-bapi-limit`, `x-bapi-limit-status`, `x-bapi-limit-reset-timestamp` |
//! | Gate | `x-gate-ratelimit-limit`, `x-gate-ratelimit-requests-remain`, `x-gate-ratelimit-reset-timestamp` |
//! | Coinbase | `cb-ratelimit-limit`, `cb-ratelimit-remaining`, `cb-ratelimit-reset` |
//! | Generic | `x-ratelimit-limit`, `x-ratelimit-remaining`, `x-ratelimit-used`, `x-ratelimit-reset` |
//! | IETF draft | `ratelimit-limit`, `ratelimit-remaining`, `ratelimit-reset` |

use reqwest::header::HeaderMap;

use crate::clock::{Clock, SystemClock};
use crate::rate_limit::window::LimitConfig;

/// Which header family produced a [`RateLimitInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSource {
    Binance,
    Bybit,
    Gate,
    Coinbase,
    Generic,
    Ietf,
}

/// Normalized quota snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub exchange: String,
    pub limit: Option<u64>,
    pub used: Option<u64>,
    pub remaining: Option<u64>,
    /// When the window resets, epoch milliseconds
    pub reset_at_ms: Option<u64>,
    pub source: HeaderSource,
    /// The matched headers as received
    pub raw_headers: Vec<(String, String)>,
}

#[derive(Default)]
struct Fields {
    limit: Option<u64>,
    used: Option<u64>,
    remaining: Option<u64>,
    reset: Option<u64>,
    raw: Vec<(String, String)>,
}

/// How a family encodes its reset value.
#[derive(Clone, Copy)]
enum Reset {
    /// Absolute epoch time; seconds or milliseconds, guessed by magnitude.
    Epoch,
    /// Seconds from now, or an absolute epoch when the value is large.
    DeltaOrEpoch,
}

/// Parse quota headers using the system clock for relative reset values.
pub fn parse(exchange: &str, headers: &HeaderMap, spec_limit: Option<&LimitConfig>) -> Option<RateLimitInfo> {
    parse_at(exchange, headers, spec_limit, SystemClock.now_ms())
}

/// [`parse`] with an explicit current time.
pub fn parse_at(
    exchange: &str,
    headers: &HeaderMap,
    spec_limit: Option<&LimitConfig>,
    now_ms: u64,
) -> Option<RateLimitInfo> {
    let (source, fields, reset_style) = binance(headers)
        .map(|f| (HeaderSource::Binance, f, Reset::Epoch))
        .or_else(|| {
            family(headers, "x-bapi-limit", "", "x-bapi-limit-status", "x-bapi-limit-reset-timestamp")
                .map(|f| (HeaderSource::Bybit, f, Reset::Epoch))
        })
        .or_else(|| {
            family(
                headers,
                "x-gate-ratelimit-limit",
                "",
                "x-gate-ratelimit-requests-remain",
                "x-gate-ratelimit-reset-timestamp",
            )
            .map(|f| (HeaderSource::Gate, f, Reset::Epoch))
        })
        .or_else(|| {
            family(headers, "cb-ratelimit-limit", "", "cb-ratelimit-remaining", "cb-ratelimit-reset")
                .map(|f| (HeaderSource::Coinbase, f, Reset::Epoch))
        })
        .or_else(|| {
            family(
                headers,
                "x-ratelimit-limit",
                "x-ratelimit-used",
                "x-ratelimit-remaining",
                "x-ratelimit-reset",
            )
            .map(|f| (HeaderSource::Generic, f, Reset::DeltaOrEpoch))
        })
        .or_else(|| {
            family(headers, "ratelimit-limit", "", "ratelimit-remaining", "ratelimit-reset")
                .map(|f| (HeaderSource::Ietf, f, Reset::DeltaOrEpoch))
        })?;

    let limit = fields.limit.or(spec_limit.map(|l| l.max_weight));
    let used = fields
        .used
        .or_else(|| Some(limit?.saturating_sub(fields.remaining?)));
    let remaining = fields
        .remaining
        .or_else(|| Some(limit?.saturating_sub(fields.used?)));

    Some(RateLimitInfo {
        exchange: exchange.to_string(),
        limit,
        used,
        remaining,
        reset_at_ms: fields.reset.map(|value| reset_to_ms(value, reset_style, now_ms)),
        source,
        raw_headers: fields.raw,
    })
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
}

fn family(headers: &HeaderMap, limit: &str, used: &str, remaining: &str, reset: &str) -> Option<Fields> {
    let mut fields = Fields::default();
    for (name, slot) in [
        (limit, &mut fields.limit),
        (used, &mut fields.used),
        (remaining, &mut fields.remaining),
        (reset, &mut fields.reset),
    ] {
        if name.is_empty() {
            continue;
        }
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            fields.raw.push((name.to_string(), value.to_string()));
            *slot = header_u64(headers, name);
        }
    }
    (!fields.raw.is_empty()).then_some(fields)
}

/// Binance reports used weight per interval, e.g. `x-mbx-used-weight-1m`.
/// The one-minute window is preferred; otherwise the largest reported value.
fn binance(headers: &HeaderMap) -> Option<Fields> {
    let mut fields = Fields::default();
    let mut preferred = None;
    let mut largest: Option<u64> = None;

    for (name, value) in headers {
        let name = name.as_str();
        if !name.starts_with("x-mbx-used-weight") && !name.starts_with("x-mbx-order-count") {
            continue;
        }
        let Ok(text) = value.to_str() else {
            continue;
        };
        fields.raw.push((name.to_string(), text.to_string()));
        if name.starts_with("x-mbx-used-weight") {
            let parsed = header_u64(headers, name);
            if name == "x-mbx-used-weight-1m" {
                preferred = parsed;
            }
            largest = largest.max(parsed);
        }
    }

    if fields.raw.is_empty() {
        return None;
    }
    fields.raw.sort();
    fields.used = preferred.or(largest);
    Some(fields)
}

fn reset_to_ms(value: u64, style: Reset, now_ms: u64) -> u64 {
    const EPOCH_SECONDS_FLOOR: u64 = 1_000_000_000;
    const EPOCH_MILLIS_FLOOR: u64 = 1_000_000_000_000;
    match style {
        _ if value >= EPOCH_MILLIS_FLOOR => value,
        _ if value >= EPOCH_SECONDS_FLOOR => value * 1_000,
        Reset::Epoch => value * 1_000,
        Reset::DeltaOrEpoch => now_ms + value * 1_000,
    }
}
