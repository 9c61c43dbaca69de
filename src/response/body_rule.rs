//! Errors encoded in successful (2xx) response bodies.

use serde::Deserialize;
use serde_json::Value;

use crate::signing::encode::param_string;

/// How an exchange signals an error inside a 2xx body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// `field` holds a status code; anything outside `success_values` is an error
    SuccessCode,
    /// Any non-null `field` is an error
    ErrorFieldPresent,
    /// `field` is an array; non-empty means error
    ErrorArrayNonEmpty,
    /// `field` holds an error code; present and not in `success_values` means error
    ErrorCodeField,
    /// `field` is a boolean; `false` means error
    SuccessBoolFalse,
}

/// Declarative body-level error rule from an exchange spec.
///
/// ```rust
/// use exchange_pipeline::response::ResponseErrorRule;
/// use serde_json::json;
///
/// let rule: ResponseErrorRule = serde_json::from_value(json!({
///     "type": "success_code", "field": "code", "success_values": ["0"], "message_field": "msg"
/// })).unwrap();
/// let error = rule.detect(&json!({"code": "51008", "msg": "Insufficient balance"})).unwrap();
/// assert_eq!(error.code.as_deref(), Some("51008"));
/// assert!(rule.detect(&json!({"code": "0", "data": []})).is_none());
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseErrorRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Field inspected by the rule; dotted path or JSON pointer
    pub field: String,
    #[serde(default)]
    pub success_values: Vec<Value>,
    /// Where the error code lives when it is not `field` itself
    #[serde(default)]
    pub code_field: Option<String>,
    #[serde(default)]
    pub message_field: Option<String>,
}

/// Code and message pulled from an error body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyError {
    pub code: Option<String>,
    pub message: Option<String>,
}

impl ResponseErrorRule {
    pub fn new(kind: RuleKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            success_values: Vec::new(),
            code_field: None,
            message_field: None,
        }
    }

    pub fn success_values(mut self, values: Vec<Value>) -> Self {
        self.success_values = values;
        self
    }

    pub fn message_field(mut self, field: impl Into<String>) -> Self {
        self.message_field = Some(field.into());
        self
    }

    pub fn code_field(mut self, field: impl Into<String>) -> Self {
        self.code_field = Some(field.into());
        self
    }

    /// Return the error described by `body`, if any.
    pub fn detect(&self, body: &Value) -> Option<BodyError> {
        let value = lookup(body, &self.field)?;
        let failed = match self.kind {
            RuleKind::SuccessCode => !self.is_success_value(value, &["0"]),
            RuleKind::ErrorFieldPresent => !is_blank(value),
            RuleKind::ErrorArrayNonEmpty => value.as_array().is_some_and(|items| !items.is_empty()),
            RuleKind::ErrorCodeField => !self.is_success_value(value, &["0", ""]) && !value.is_null(),
            RuleKind::SuccessBoolFalse => value.as_bool() == Some(false),
        };
        failed.then(|| self.extract(body))
    }

    /// Code and message from an error body, without deciding whether it is one.
    pub fn extract(&self, body: &Value) -> BodyError {
        let field_value = lookup(body, &self.field);
        let code = match (&self.code_field, self.kind) {
            (Some(field), _) => lookup(body, field).and_then(scalar_string),
            (None, RuleKind::ErrorArrayNonEmpty) => field_value
                .and_then(Value::as_array)
                .and_then(|items| items.first())
                .and_then(scalar_string),
            (None, RuleKind::SuccessBoolFalse) => None,
            (None, RuleKind::ErrorFieldPresent) => field_value.and_then(|v| match v {
                Value::Object(map) => ["code", "error_code", "id"]
                    .iter()
                    .find_map(|k| map.get(*k))
                    .and_then(scalar_string),
                _ => None,
            }),
            (None, _) => field_value.and_then(scalar_string),
        };

        let message = self
            .message_field
            .as_deref()
            .and_then(|field| lookup(body, field))
            .and_then(scalar_string)
            .or_else(|| match (self.kind, field_value) {
                (RuleKind::ErrorArrayNonEmpty, Some(Value::Array(items))) => Some(
                    items
                        .iter()
                        .filter_map(scalar_string)
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
                (RuleKind::ErrorFieldPresent, Some(Value::String(text))) => Some(text.clone()),
                (RuleKind::ErrorFieldPresent, Some(Value::Object(map))) => ["message", "msg", "description"]
                    .iter()
                    .find_map(|k| map.get(*k))
                    .and_then(scalar_string),
                _ => None,
            })
            .or_else(|| common_message(body));

        BodyError { code, message }
    }

    fn is_success_value(&self, value: &Value, defaults: &[&str]) -> bool {
        let rendered = param_string(value);
        if self.success_values.is_empty() {
            defaults.contains(&rendered.as_str())
        } else {
            self.success_values.iter().any(|v| param_string(v) == rendered)
        }
    }
}

/// Best-effort code and message from an error body with no declared rule.
pub fn common_error(body: &Value) -> BodyError {
    let code = ["code", "error_code", "errorCode", "retCode", "ret_code", "label"]
        .iter()
        .find_map(|k| body.get(*k))
        .and_then(scalar_string);
    let message = common_message(body).or_else(|| {
        body.get("error")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(scalar_string).collect::<Vec<_>>().join("; "))
            .filter(|s| !s.is_empty())
    });
    BodyError { code, message }
}

fn common_message(body: &Value) -> Option<String> {
    ["msg", "message", "retMsg", "ret_msg", "error_description", "error", "reason"]
        .iter()
        .filter_map(|k| body.get(*k))
        .find_map(scalar_string)
        .filter(|s| !s.is_empty())
}

/// Dotted path (`result.code`) or JSON pointer (`/result/code`).
fn lookup<'a>(body: &'a Value, field: &str) -> Option<&'a Value> {
    if field.starts_with('/') {
        return body.pointer(field);
    }
    field.split('.').try_fold(body, |current, part| current.get(part))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_success_code() {
        let rule = ResponseErrorRule::new(RuleKind::SuccessCode, "code")
            .success_values(vec![json!(0)])
            .message_field("msg");
        assert!(rule.detect(&json!({"code": 0, "data": {}})).is_none());
        assert!(rule.detect(&json!({"code": "0"})).is_none());

        let error = rule.detect(&json!({"code": 10001, "msg": "params error"})).unwrap();
        assert_eq!(error.code.as_deref(), Some("10001"));
        assert_eq!(error.message.as_deref(), Some("params error"));
    }

    #[test]
    fn test_error_field_present() {
        let rule = ResponseErrorRule::new(RuleKind::ErrorFieldPresent, "error");
        assert!(rule.detect(&json!({"result": 1})).is_none());
        assert!(rule.detect(&json!({"error": null, "result": 1})).is_none());

        let error = rule
            .detect(&json!({"error": {"code": 10009, "message": "not enough funds"}}))
            .unwrap();
        assert_eq!(error.code.as_deref(), Some("10009"));
        assert_eq!(error.message.as_deref(), Some("not enough funds"));
    }

    #[test]
    fn test_error_array_non_empty() {
        let rule = ResponseErrorRule::new(RuleKind::ErrorArrayNonEmpty, "error");
        assert!(rule.detect(&json!({"error": [], "result": {}})).is_none());

        let error = rule
            .detect(&json!({"error": ["EOrder:Insufficient funds"]}))
            .unwrap();
        assert_eq!(error.code.as_deref(), Some("EOrder:Insufficient funds"));
        assert_eq!(error.message.as_deref(), Some("EOrder:Insufficient funds"));
    }

    #[test]
    fn test_error_code_field() {
        let rule = ResponseErrorRule::new(RuleKind::ErrorCodeField, "retCode").message_field("retMsg");
        assert!(rule.detect(&json!({"retCode": 0, "retMsg": "OK"})).is_none());
        let error = rule.detect(&json!({"retCode": 110007, "retMsg": "ab not enough"})).unwrap();
        assert_eq!(error.code.as_deref(), Some("110007"));
    }

    #[test]
    fn test_success_bool_false_with_nested_fields() {
        let rule = ResponseErrorRule::new(RuleKind::SuccessBoolFalse, "success")
            .code_field("error.code")
            .message_field("/error/message");
        assert!(rule.detect(&json!({"success": true})).is_none());
        let error = rule
            .detect(&json!({"success": false, "error": {"code": "ORDER_NOT_FOUND", "message": "gone"}}))
            .unwrap();
        assert_eq!(error.code.as_deref(), Some("ORDER_NOT_FOUND"));
        assert_eq!(error.message.as_deref(), Some("gone"));
    }

    #[test]
    fn test_missing_field_is_not_an_error() {
        let rule = ResponseErrorRule::new(RuleKind::SuccessCode, "code").success_values(vec![json!("0")]);
        assert!(rule.detect(&json!([1, 2, 3])).is_none());
        assert!(rule.detect(&json!({"data": 1})).is_none());
    }

    #[test]
    fn test_common_error() {
        let error = common_error(&json!({"code": -2010, "msg": "Account has insufficient balance"}));
        assert_eq!(error.code.as_deref(), Some("-2010"));
        assert_eq!(error.message.as_deref(), Some("Account has insufficient balance"));
    }
}
