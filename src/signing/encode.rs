//! Request shaping helpers shared by the signing patterns and the unsigned path.

use std::collections::BTreeMap;

use reqwest::Method;
use serde_json::Value;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::signing::{Request, SigningError};

/// Render a parameter value the way exchanges expect it in a query string.
pub fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Stringify parameters, preserving key order (alphabetical for a `BTreeMap`).
pub fn param_pairs(params: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), param_string(v)))
        .collect()
}

/// URL-encode pairs as `k=v&k2=v2`.
pub fn query_string(pairs: &[(String, String)]) -> Result<String, SigningError> {
    Ok(serde_urlencoded::to_string(pairs)?)
}

/// Whether parameters travel in the query string for this method.
pub fn uses_query(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::DELETE | Method::HEAD)
}

/// `path` with `?query` appended when the query is non-empty.
pub fn path_with_query(path: &str, query: &str) -> String {
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    }
}

/// Join a base URL, a path and an optional query string.
pub fn join_url(base_url: &str, path: &str, query: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    path_with_query(&format!("{base}{path}"), query)
}

/// The query string and JSON body of a request under the usual convention:
/// query-string methods carry params in the URL, the rest send them as a JSON
/// object unless an explicit body was supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParts {
    pub query: String,
    pub body: Option<String>,
}

impl RequestParts {
    pub fn json(request: &Request) -> Result<Self, SigningError> {
        if uses_query(&request.method) {
            let query = query_string(&param_pairs(&request.params))?;
            let body = request.body.as_ref().map(serde_json::to_string).transpose()?;
            return Ok(Self { query, body });
        }

        let body = match &request.body {
            Some(body) => Some(serde_json::to_string(body)?),
            None if request.params.is_empty() => None,
            None => Some(serde_json::to_string(&request.params)?),
        };
        Ok(Self {
            query: String::new(),
            body,
        })
    }

    /// The body as signed: empty string when there is none.
    pub fn body_str(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }
}

/// Format epoch milliseconds as ISO-8601 with millisecond precision,
/// e.g. `2020-12-08T09:08:57.715Z`.
pub fn iso8601_ms(ms: u64) -> Result<String, SigningError> {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| SigningError::Timestamp(e.to_string()))?
        .format(format)
        .map_err(|e| SigningError::Timestamp(e.to_string()))
}
