//! Schema compilation and validation.
//!
//! A schema descriptor is a JSON object mapping each key to a field
//! descriptor such as `{"type": "number", "default": 25, "min": 10}`.
//! Compiling it yields a [`Schema`] that checks single values or whole
//! documents. Only declared fields are checked; unknown keys pass through.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use confsync_protocol::SettingsMap;

use crate::error::{StoreError, StoreResult};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+@\S+\.\S+$").expect("valid email pattern"));

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://(?:www\.)?[-a-zA-Z0-9@:%._+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b(?:[-a-zA-Z0-9()@:%_+.~#?&/=]*)$",
    )
    .expect("valid url pattern")
});

static NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?[0-9]\d*(\.\d+)?$").expect("valid numeric pattern"));

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: String) -> Self {
        Self {
            field: field.to_string(),
            message,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Constraints for `number` fields.
#[derive(Debug, Clone, Default)]
pub struct NumberRules {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub equal: Option<f64>,
    pub not_equal: Option<f64>,
    pub integer: bool,
    pub positive: bool,
    pub negative: bool,
}

/// Constraints for `string` fields. Lengths count characters.
#[derive(Debug, Clone)]
pub struct StringRules {
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub length: Option<usize>,
    pub pattern: Option<Regex>,
    pub empty: bool,
    pub alpha: bool,
    pub numeric: bool,
    pub alphanum: bool,
}

impl Default for StringRules {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
            length: None,
            pattern: None,
            empty: true,
            alpha: false,
            numeric: false,
            alphanum: false,
        }
    }
}

/// Type tag of a field together with its constraints.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Number(NumberRules),
    Boolean,
    String(StringRules),
    Enum(Vec<Value>),
    Email,
    Url,
    Uuid,
}

impl FieldKind {
    /// Check `value` against this kind, appending failures to `errors`.
    fn check(&self, field: &str, value: &Value, errors: &mut Vec<FieldError>) {
        match self {
            FieldKind::Number(rules) => check_number(rules, field, value, errors),
            FieldKind::Boolean => {
                if !value.is_boolean() {
                    errors.push(FieldError::new(
                        field,
                        format!("The '{field}' field must be a boolean."),
                    ));
                }
            }
            FieldKind::String(rules) => check_string(rules, field, value, errors),
            FieldKind::Enum(values) => {
                if !values.iter().any(|allowed| scalar_eq(allowed, value)) {
                    let allowed: Vec<String> = values.iter().map(Value::to_string).collect();
                    errors.push(FieldError::new(
                        field,
                        format!(
                            "The '{field}' field value does not match any of the allowed values ({}).",
                            allowed.join(", ")
                        ),
                    ));
                }
            }
            FieldKind::Email => check_format(field, value, errors, "e-mail", |s| {
                EMAIL_RE.is_match(s)
            }),
            FieldKind::Url => check_format(field, value, errors, "URL", |s| URL_RE.is_match(s)),
            FieldKind::Uuid => check_format(field, value, errors, "UUID", |s| {
                uuid::Uuid::parse_str(s).is_ok()
            }),
        }
    }
}

/// A compiled field descriptor.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub default: Value,
    /// Absent values are acceptable in whole-document checks.
    pub optional: bool,
    pub kind: FieldKind,
}

impl FieldSchema {
    /// Check one value, returning every failure.
    pub fn check(&self, field: &str, value: &Value) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        self.kind.check(field, value, &mut errors);
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Compiled, immutable schema.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: BTreeMap<String, FieldSchema>,
}

impl Schema {
    /// Compile a schema descriptor.
    ///
    /// Fails if the descriptor is not a non-empty object, if any field lacks
    /// a `default`, declares an unknown type, or if a default does not pass
    /// its own field's checks.
    pub fn compile(descriptor: &Value) -> StoreResult<Self> {
        let Some(entries) = descriptor.as_object() else {
            return Err(StoreError::InvalidSchema(
                "schema must be a JSON object".into(),
            ));
        };
        if entries.is_empty() {
            return Err(StoreError::InvalidSchema("schema must not be empty".into()));
        }

        let mut fields = BTreeMap::new();
        for (key, field) in entries {
            if key.trim().is_empty() {
                return Err(StoreError::InvalidSchema("field names must not be empty".into()));
            }
            let compiled = compile_field(key, field)?;
            if let Err(errors) = compiled.check(key, &compiled.default) {
                return Err(StoreError::InvalidSchema(format!(
                    "default for '{key}' is invalid: {}",
                    errors[0]
                )));
            }
            fields.insert(key.clone(), compiled);
        }

        Ok(Self { fields })
    }

    pub fn field(&self, key: &str) -> Option<&FieldSchema> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSchema)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Check a single value. Undeclared keys always pass.
    pub fn check_field(&self, key: &str, value: &Value) -> Result<(), Vec<FieldError>> {
        match self.fields.get(key) {
            Some(field) => field.check(key, value),
            None => Ok(()),
        }
    }

    /// Check a whole document, in key order.
    ///
    /// Missing non-optional fields are reported as required; keys the schema
    /// does not declare are ignored.
    pub fn check(&self, candidate: &SettingsMap) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        for (key, field) in &self.fields {
            match candidate.get(key) {
                Some(value) => field.kind.check(key, value, &mut errors),
                None if field.optional => {}
                None => errors.push(FieldError::new(
                    key,
                    format!("The '{key}' field is required."),
                )),
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn compile_field(key: &str, field: &Value) -> StoreResult<FieldSchema> {
    let Some(attrs) = field.as_object() else {
        return Err(StoreError::InvalidSchema(format!(
            "field '{key}' must be an object"
        )));
    };
    let Some(default) = attrs.get("default") else {
        return Err(StoreError::InvalidSchema(format!(
            "field '{key}' must declare a default"
        )));
    };
    let type_tag = attrs.get("type").and_then(Value::as_str).ok_or_else(|| {
        StoreError::InvalidSchema(format!("field '{key}' must declare a type"))
    })?;

    let kind = match type_tag {
        "number" => FieldKind::Number(NumberRules {
            min: opt_f64(key, attrs, "min")?,
            max: opt_f64(key, attrs, "max")?,
            equal: opt_f64(key, attrs, "equal")?,
            not_equal: opt_f64(key, attrs, "notEqual")?,
            integer: opt_bool(key, attrs, "integer")?.unwrap_or(false),
            positive: opt_bool(key, attrs, "positive")?.unwrap_or(false),
            negative: opt_bool(key, attrs, "negative")?.unwrap_or(false),
        }),
        "boolean" => FieldKind::Boolean,
        "string" => {
            let pattern = match attrs.get("pattern") {
                None => None,
                Some(Value::String(source)) => Some(Regex::new(source).map_err(|e| {
                    StoreError::InvalidSchema(format!("field '{key}' has a bad pattern: {e}"))
                })?),
                Some(_) => {
                    return Err(StoreError::InvalidSchema(format!(
                        "field '{key}': pattern must be a string"
                    )));
                }
            };
            FieldKind::String(StringRules {
                min: opt_usize(key, attrs, "min")?,
                max: opt_usize(key, attrs, "max")?,
                length: opt_usize(key, attrs, "length")?,
                pattern,
                empty: opt_bool(key, attrs, "empty")?.unwrap_or(true),
                alpha: opt_bool(key, attrs, "alpha")?.unwrap_or(false),
                numeric: opt_bool(key, attrs, "numeric")?.unwrap_or(false),
                alphanum: opt_bool(key, attrs, "alphanum")?.unwrap_or(false),
            })
        }
        "enum" => {
            let values = attrs
                .get("values")
                .and_then(Value::as_array)
                .filter(|values| !values.is_empty())
                .ok_or_else(|| {
                    StoreError::InvalidSchema(format!(
                        "enum field '{key}' must list its values"
                    ))
                })?;
            FieldKind::Enum(values.clone())
        }
        "email" => FieldKind::Email,
        "url" => FieldKind::Url,
        "uuid" => FieldKind::Uuid,
        other => {
            return Err(StoreError::InvalidSchema(format!(
                "field '{key}' has unknown type '{other}'"
            )));
        }
    };

    Ok(FieldSchema {
        default: default.clone(),
        optional: opt_bool(key, attrs, "optional")?.unwrap_or(false),
        kind,
    })
}

fn opt_f64(key: &str, attrs: &Map<String, Value>, name: &str) -> StoreResult<Option<f64>> {
    attrs.get(name)
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                StoreError::InvalidSchema(format!("field '{key}': {name} must be a number"))
            })
        })
        .transpose()
}

fn opt_usize(key: &str, attrs: &Map<String, Value>, name: &str) -> StoreResult<Option<usize>> {
    attrs.get(name)
        .map(|v| {
            v.as_u64().map(|n| n as usize).ok_or_else(|| {
                StoreError::InvalidSchema(format!(
                    "field '{key}': {name} must be a non-negative integer"
                ))
            })
        })
        .transpose()
}

fn opt_bool(key: &str, attrs: &Map<String, Value>, name: &str) -> StoreResult<Option<bool>> {
    attrs.get(name)
        .map(|v| {
            v.as_bool().ok_or_else(|| {
                StoreError::InvalidSchema(format!("field '{key}': {name} must be a boolean"))
            })
        })
        .transpose()
}

fn check_number(rules: &NumberRules, field: &str, value: &Value, errors: &mut Vec<FieldError>) {
    let Some(n) = value.as_f64() else {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be a number."),
        ));
        return;
    };

    if let Some(min) = rules.min
        && n < min
    {
        errors.push(FieldError::new(
            field,
            format!(
                "The '{field}' field must be greater than or equal to {}.",
                fmt_num(min)
            ),
        ));
    }
    if let Some(max) = rules.max
        && n > max
    {
        errors.push(FieldError::new(
            field,
            format!(
                "The '{field}' field must be less than or equal to {}.",
                fmt_num(max)
            ),
        ));
    }
    if let Some(equal) = rules.equal
        && n != equal
    {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be equal to {}.", fmt_num(equal)),
        ));
    }
    if let Some(not_equal) = rules.not_equal
        && n == not_equal
    {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field can't be equal to {}.", fmt_num(not_equal)),
        ));
    }
    if rules.integer && n.fract() != 0.0 {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be an integer."),
        ));
    }
    if rules.positive && n <= 0.0 {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be a positive number."),
        ));
    }
    if rules.negative && n >= 0.0 {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be a negative number."),
        ));
    }
}

fn check_string(rules: &StringRules, field: &str, value: &Value, errors: &mut Vec<FieldError>) {
    let Some(s) = value.as_str() else {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be a string."),
        ));
        return;
    };

    let len = s.chars().count();
    if !rules.empty && len == 0 {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must not be empty."),
        ));
    }
    if let Some(min) = rules.min
        && len < min
    {
        errors.push(FieldError::new(
            field,
            format!(
                "The '{field}' field length must be greater than or equal to {min} characters long."
            ),
        ));
    }
    if let Some(max) = rules.max
        && len > max
    {
        errors.push(FieldError::new(
            field,
            format!(
                "The '{field}' field length must be less than or equal to {max} characters long."
            ),
        ));
    }
    if let Some(length) = rules.length
        && len != length
    {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field length must be {length} characters long."),
        ));
    }
    if let Some(pattern) = &rules.pattern
        && !pattern.is_match(s)
    {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field fails to match the required pattern."),
        ));
    }
    if rules.alpha && !s.chars().all(|c| c.is_ascii_alphabetic()) {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be an alphabetic string."),
        ));
    }
    if rules.numeric && !NUMERIC_RE.is_match(s) {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be a numeric string."),
        ));
    }
    if rules.alphanum && !s.chars().all(|c| c.is_ascii_alphanumeric()) {
        errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be an alphanumeric string."),
        ));
    }
}

fn check_format(
    field: &str,
    value: &Value,
    errors: &mut Vec<FieldError>,
    label: &str,
    is_valid: impl Fn(&str) -> bool,
) {
    match value.as_str() {
        Some(s) if is_valid(s) => {}
        Some(_) => errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be a valid {label}."),
        )),
        None => errors.push(FieldError::new(
            field,
            format!("The '{field}' field must be a string."),
        )),
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Render a bound without a trailing `.0` for whole numbers.
fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn size_schema() -> Schema {
        Schema::compile(&json!({
            "size": { "type": "number", "default": 25, "min": 10, "max": 40 }
        }))
        .unwrap()
    }

    #[test]
    fn test_compile_rejects_non_object() {
        assert!(matches!(
            Schema::compile(&json!([1, 2])),
            Err(StoreError::InvalidSchema(_))
        ));
        assert!(matches!(
            Schema::compile(&json!("size")),
            Err(StoreError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_compile_rejects_empty() {
        assert!(matches!(
            Schema::compile(&json!({})),
            Err(StoreError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_compile_requires_default() {
        let err = Schema::compile(&json!({ "size": { "type": "number", "min": 1 } })).unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_compile_rejects_unknown_type() {
        let err =
            Schema::compile(&json!({ "size": { "type": "matrix", "default": 1 } })).unwrap_err();
        assert!(err.to_string().contains("matrix"));
    }

    #[test]
    fn test_compile_rejects_invalid_default() {
        let err = Schema::compile(&json!({
            "size": { "type": "number", "default": 99, "max": 40 }
        }))
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidSchema(_)));
    }

    #[test]
    fn test_compile_rejects_bad_pattern() {
        let err = Schema::compile(&json!({
            "name": { "type": "string", "default": "a", "pattern": "(" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("pattern"));
    }

    #[test]
    fn test_number_bounds() {
        let schema = size_schema();
        assert!(schema.check_field("size", &json!(22)).is_ok());

        let errors = schema.check_field("size", &json!(55)).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "The 'size' field must be less than or equal to 40."
        );
        assert_eq!(errors[0].field, "size");

        let errors = schema.check_field("size", &json!(5)).unwrap_err();
        assert!(errors[0].message.contains("greater than or equal to 10"));
    }

    #[test]
    fn test_number_type_mismatch() {
        let errors = size_schema().check_field("size", &json!("big")).unwrap_err();
        assert_eq!(errors[0].message, "The 'size' field must be a number.");
    }

    #[test]
    fn test_number_integer_and_sign() {
        let schema = Schema::compile(&json!({
            "count": { "type": "number", "default": 1, "integer": true, "positive": true }
        }))
        .unwrap();
        let errors = schema.check_field("count", &json!(-1.5)).unwrap_err();
        let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "The 'count' field must be an integer.",
                "The 'count' field must be a positive number.",
            ]
        );
    }

    #[test]
    fn test_string_rules() {
        let schema = Schema::compile(&json!({
            "name": { "type": "string", "default": "anon", "min": 2, "max": 5, "alpha": true }
        }))
        .unwrap();
        assert!(schema.check_field("name", &json!("bob")).is_ok());
        assert!(schema.check_field("name", &json!("b")).is_err());
        assert!(schema.check_field("name", &json!("bobbyt")).is_err());
        assert!(schema.check_field("name", &json!("b0b")).is_err());
        assert!(schema.check_field("name", &json!(3)).is_err());
    }

    #[test]
    fn test_string_length_counts_chars() {
        let schema = Schema::compile(&json!({
            "code": { "type": "string", "default": "ééé", "length": 3 }
        }))
        .unwrap();
        assert!(schema.check_field("code", &json!("äöü")).is_ok());
    }

    #[test]
    fn test_string_empty_flag() {
        let schema = Schema::compile(&json!({
            "title": { "type": "string", "default": "x", "empty": false }
        }))
        .unwrap();
        let errors = schema.check_field("title", &json!("")).unwrap_err();
        assert_eq!(errors[0].message, "The 'title' field must not be empty.");
    }

    #[test]
    fn test_enum() {
        let schema = Schema::compile(&json!({
            "mode": { "type": "enum", "default": "fast", "values": ["fast", "safe", 3] }
        }))
        .unwrap();
        assert!(schema.check_field("mode", &json!("safe")).is_ok());
        assert!(schema.check_field("mode", &json!(3.0)).is_ok());
        assert!(schema.check_field("mode", &json!("slow")).is_err());
    }

    #[test]
    fn test_enum_requires_values() {
        assert!(
            Schema::compile(&json!({ "mode": { "type": "enum", "default": "a", "values": [] } }))
                .is_err()
        );
    }

    #[test]
    fn test_formats() {
        let schema = Schema::compile(&json!({
            "email": { "type": "email", "default": "a@b.co" },
            "home": { "type": "url", "default": "https://example.com" },
            "id": { "type": "uuid", "default": "6f1c0e4e-3c3a-4d5c-9d4e-1f2a3b4c5d6e" }
        }))
        .unwrap();

        assert!(schema.check_field("email", &json!("me@host.org")).is_ok());
        assert!(schema.check_field("email", &json!("nope")).is_err());
        assert!(schema.check_field("home", &json!("http://www.rust-lang.org/learn")).is_ok());
        assert!(schema.check_field("home", &json!("ftp://x")).is_err());
        assert!(schema.check_field("id", &json!("not-a-uuid")).is_err());

        let errors = schema.check_field("home", &json!(1)).unwrap_err();
        assert_eq!(errors[0].message, "The 'home' field must be a string.");
    }

    #[test]
    fn test_unknown_field_passes() {
        assert!(size_schema().check_field("other", &json!(1000)).is_ok());
    }

    #[test]
    fn test_document_check_ignores_unknown_and_reports_required() {
        let schema = Schema::compile(&json!({
            "size": { "type": "number", "default": 25 },
            "dark": { "type": "boolean", "default": false },
            "note": { "type": "string", "default": "", "optional": true }
        }))
        .unwrap();

        let mut doc = SettingsMap::new();
        doc.insert("size".to_string(), json!(30));
        doc.insert("extra".to_string(), json!({"nested": true}));

        let errors = schema.check(&doc).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "dark");
        assert_eq!(errors[0].message, "The 'dark' field is required.");

        doc.insert("dark".to_string(), json!(true));
        assert!(schema.check(&doc).is_ok());
    }

    #[test]
    fn test_fmt_num() {
        assert_eq!(fmt_num(40.0), "40");
        assert_eq!(fmt_num(-3.0), "-3");
        assert_eq!(fmt_num(2.5), "2.5");
    }
}
