//! Response handling and error normalization.
//!
//! Order of checks for every response that made it back over the wire:
//!
//! 1. HTML pages are `AccessRestricted`, whatever the status.
//! 2. The body is decoded as JSON when possible, even if labelled `text/plain`.
//! 3. 2xx responses are checked against the exchange's body-level error rule.
//! 4. Non-2xx responses map by status first (429, 418, 401, 403), then by the
//!    body's error code.
//!
//! Body-level and status-level errors share the same code table lookup, so the
//! only visible difference between them is the resulting [`ErrorKind`].

mod body_rule;
mod html;

use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::PrimitiveDateTime;
use time::macros::format_description;

use crate::clock::{Clock, SystemClock};
use crate::error::{ErrorCodeTable, ErrorKind, NormalizedError, classify_message};

pub use body_rule::{BodyError, ResponseErrorRule, RuleKind, common_error};
pub use html::{access_restricted, is_html};

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

/// A successful, normalized response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl Response {
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Text(text) => Some(text),
            ResponseBody::Json(_) => None,
        }
    }

    /// Deserialize a JSON body into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.body {
            ResponseBody::Json(value) => T::deserialize(value),
            ResponseBody::Text(text) => serde_json::from_str(text),
        }
    }
}

/// Parse a `Retry-After` value (delta seconds or HTTP-date) into milliseconds.
pub fn retry_after_ms(headers: &HeaderMap, now_ms: u64) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }
    if let Ok(seconds) = value.parse::<f64>() {
        return (seconds >= 0.0).then(|| (seconds * 1_000.0).round() as u64);
    }
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    let at = PrimitiveDateTime::parse(value, format).ok()?.assume_utc();
    let at_ms = u64::try_from(at.unix_timestamp()).ok()?.saturating_mul(1_000);
    Some(at_ms.saturating_sub(now_ms))
}

/// Per-exchange response handling.
#[derive(Debug, Clone, Copy)]
pub struct ErrorNormalizer<'a> {
    pub exchange: &'a str,
    pub error_codes: &'a ErrorCodeTable,
    pub rule: Option<&'a ResponseErrorRule>,
}

impl<'a> ErrorNormalizer<'a> {
    pub fn new(exchange: &'a str, error_codes: &'a ErrorCodeTable) -> Self {
        Self {
            exchange,
            error_codes,
            rule: None,
        }
    }

    pub fn with_rule(mut self, rule: Option<&'a ResponseErrorRule>) -> Self {
        self.rule = rule;
        self
    }

    /// Turn a raw response into a [`Response`] or a [`NormalizedError`].
    pub fn handle(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        body: String,
    ) -> Result<Response, NormalizedError> {
        self.handle_at(status, headers, body, SystemClock.now_ms())
    }

    /// [`ErrorNormalizer::handle`] with an explicit current time for
    /// `Retry-After` dates.
    pub fn handle_at(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        body: String,
        now_ms: u64,
    ) -> Result<Response, NormalizedError> {
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        if is_html(content_type, &body) {
            return Err(access_restricted(self.exchange, status.as_u16(), &body));
        }

        let decoded = match serde_json::from_str::<Value>(&body) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(body),
        };

        if status.is_success() {
            if let (Some(rule), ResponseBody::Json(value)) = (self.rule, &decoded) {
                if let Some(found) = rule.detect(value) {
                    return Err(self.resolve(found, ErrorKind::ExchangeError, value.clone()));
                }
            }
            return Ok(Response {
                status: status.as_u16(),
                headers,
                body: decoded,
            });
        }

        let (found, raw) = match &decoded {
            ResponseBody::Json(value) => {
                let found = match self.rule {
                    Some(rule) => rule.extract(value),
                    None => common_error(value),
                };
                (found, value.clone())
            }
            ResponseBody::Text(text) => (
                BodyError {
                    code: None,
                    message: (!text.trim().is_empty()).then(|| text.trim().to_string()),
                },
                Value::String(text.clone()),
            ),
        };

        let status_kind = match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => Some(ErrorKind::RateLimited {
                retry_after_ms: retry_after_ms(&headers, now_ms),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(ErrorKind::InvalidCredentials),
            _ => None,
        };

        let mut error = match status_kind {
            Some(kind) => {
                let mut error = self.resolve(found, kind.clone(), raw);
                error.kind = kind;
                error
            }
            None => self.resolve(found, ErrorKind::ExchangeError, raw),
        };
        if error.message.is_empty() {
            error.message = format!("HTTP {status}");
        }
        Err(error)
    }

    /// The shared code -> kind -> message pipeline.
    fn resolve(&self, found: BodyError, fallback: ErrorKind, raw: Value) -> NormalizedError {
        let BodyError { code, message } = found;
        let message = message.filter(|m| !m.trim().is_empty());

        let from_table = code
            .as_deref()
            .and_then(|c| self.error_codes.lookup(c))
            .or_else(|| message.as_deref().and_then(|m| self.error_codes.lookup(m)));

        let (kind, message) = match from_table {
            Some((kind, description)) => {
                let merged = match (message, description) {
                    (Some(m), Some(d)) if code.as_deref() == Some(m.as_str()) || m == d => d.to_string(),
                    (Some(m), Some(d)) => format!("{m} ({d})"),
                    (Some(m), None) => m,
                    (None, Some(d)) => d.to_string(),
                    (None, None) => String::new(),
                };
                (kind, merged)
            }
            None => {
                let kind = message
                    .as_deref()
                    .and_then(classify_message)
                    .unwrap_or(fallback);
                (kind, message.unwrap_or_default())
            }
        };

        let mut error = NormalizedError::new(self.exchange, kind, message).with_raw(raw);
        error.code = code;
        error
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorClass;

    const NOW: u64 = 1_445_412_480_000; // Wed, 21 Oct 2015 07:28:00 GMT

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn table() -> ErrorCodeTable {
        let mut table = ErrorCodeTable::new();
        table
            .insert("-2010", ErrorClass::InsufficientBalance, Some("Account has insufficient balance"))
            .insert("51008", ErrorClass::InsufficientBalance, None)
            .insert("EOrder:Unknown order", ErrorClass::OrderNotFound, Some("Order not found"));
        table
    }

    #[test]
    fn test_retry_after_forms() {
        assert_eq!(retry_after_ms(&headers(&[("retry-after", "5")]), NOW), Some(5_000));
        assert_eq!(retry_after_ms(&headers(&[("retry-after", "0.5")]), NOW), Some(500));
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after", "Wed, 21 Oct 2015 07:28:30 GMT")]), NOW),
            Some(30_000)
        );
        assert_eq!(retry_after_ms(&headers(&[("retry-after", "soon")]), NOW), None);
        assert_eq!(retry_after_ms(&HeaderMap::new(), NOW), None);
    }

    #[test]
    fn test_retry_after_http_date_in_the_past() {
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after", "Wed, 21 Oct 2015 07:27:00 GMT")]), NOW),
            Some(0)
        );
    }

    #[test]
    fn test_retry_after_out_of_range_saturates() {
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after", "99999999999999999")]), NOW),
            Some(u64::MAX)
        );
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after", "1e300")]), NOW),
            Some(u64::MAX)
        );
        assert_eq!(retry_after_ms(&headers(&[("retry-after", "-3")]), NOW), None);
    }

    #[test]
    fn test_429_with_retry_after() {
        let codes = table();
        let err = ErrorNormalizer::new("binance", &codes)
            .handle_at(
                StatusCode::TOO_MANY_REQUESTS,
                headers(&[("retry-after", "5")]),
                r#"{"code": -1003, "msg": "Too much request weight used"}"#.into(),
                NOW,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited { retry_after_ms: Some(5_000) });
        assert_eq!(err.code.as_deref(), Some("-1003"));
    }

    #[test]
    fn test_auth_statuses() {
        let codes = table();
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = ErrorNormalizer::new("okx", &codes)
                .handle_at(status, HeaderMap::new(), String::new(), NOW)
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidCredentials);
            assert!(!err.message.is_empty());
        }
    }

    #[test]
    fn test_code_table_merges_description() {
        let codes = table();
        let err = ErrorNormalizer::new("binance", &codes)
            .handle_at(
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                r#"{"code": -2010, "msg": "Order would trigger immediately."}"#.into(),
                NOW,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientBalance);
        assert_eq!(
            err.message,
            "Order would trigger immediately. (Account has insufficient balance)"
        );
        assert_eq!(err.raw.unwrap()["code"], -2010);
    }

    #[test]
    fn test_unknown_code_falls_back_to_message_then_generic() {
        let codes = table();
        let normalizer = ErrorNormalizer::new("x", &codes);
        let err = normalizer
            .handle_at(
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                r#"{"code": 7, "msg": "Invalid parameter: side"}"#.into(),
                NOW,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameters);

        let err = normalizer
            .handle_at(StatusCode::BAD_GATEWAY, HeaderMap::new(), "upstream".into(), NOW)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExchangeError);
        assert_eq!(err.message, "upstream");
    }

    #[test]
    fn test_html_even_on_success() {
        let codes = table();
        let err = ErrorNormalizer::new("bybit", &codes)
            .handle_at(
                StatusCode::OK,
                headers(&[("content-type", "text/html")]),
                "<html><title>Blocked</title></html>".into(),
                NOW,
            )
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AccessRestricted { .. }));
    }

    #[test]
    fn test_body_level_error_on_200() {
        let codes = table();
        let rule = ResponseErrorRule::new(RuleKind::SuccessCode, "code")
            .success_values(vec![json!("0")])
            .message_field("msg");
        let normalizer = ErrorNormalizer::new("okx", &codes).with_rule(Some(&rule));

        let err = normalizer
            .handle_at(
                StatusCode::OK,
                HeaderMap::new(),
                r#"{"code": "51008", "msg": "Order failed. Insufficient USDT balance", "data": []}"#.into(),
                NOW,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientBalance);
        assert_eq!(err.code.as_deref(), Some("51008"));

        let ok = normalizer
            .handle_at(
                StatusCode::OK,
                HeaderMap::new(),
                r#"{"code": "0", "msg": "", "data": [{"ccy": "BTC"}]}"#.into(),
                NOW,
            )
            .unwrap();
        assert_eq!(ok.json().unwrap()["data"][0]["ccy"], "BTC");
    }

    #[test]
    fn test_array_errors_resolve_by_message() {
        let codes = table();
        let rule = ResponseErrorRule::new(RuleKind::ErrorArrayNonEmpty, "error");
        let err = ErrorNormalizer::new("kraken", &codes)
            .with_rule(Some(&rule))
            .handle_at(
                StatusCode::OK,
                HeaderMap::new(),
                r#"{"error": ["EOrder:Unknown order"]}"#.into(),
                NOW,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OrderNotFound);
        assert_eq!(err.message, "Order not found");
    }

    #[test]
    fn test_text_plain_json_is_decoded() {
        let codes = table();
        let response = ErrorNormalizer::new("x", &codes)
            .handle_at(
                StatusCode::OK,
                headers(&[("content-type", "text/plain")]),
                r#"{"price": "1.5"}"#.into(),
                NOW,
            )
            .unwrap();
        #[derive(serde::Deserialize)]
        struct Ticker {
            price: String,
        }
        assert_eq!(response.deserialize::<Ticker>().unwrap().price, "1.5");

        let text = ErrorNormalizer::new("x", &codes)
            .handle_at(StatusCode::OK, HeaderMap::new(), "pong".into(), NOW)
            .unwrap();
        assert_eq!(text.text(), Some("pong"));
    }
}
