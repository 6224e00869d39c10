//! Result values carried across the owner/replica boundary.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Flat key -> scalar settings map. Ordered so documents serialize stably.
pub type SettingsMap = BTreeMap<String, Value>;

/// Error entry reported when an invalid value was replaced by its default.
pub const DEFAULT_APPLIED: &str = "default applied";

/// Errors half of a [`ValidationResult`].
///
/// Serializes as `false` when there are no errors and as a list of
/// human-readable messages otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValidationErrors {
    #[default]
    None,
    Messages(Vec<String>),
}

impl ValidationErrors {
    pub fn is_none(&self) -> bool {
        matches!(self, ValidationErrors::None)
    }

    /// Messages in report order (empty when valid).
    pub fn messages(&self) -> &[String] {
        match self {
            ValidationErrors::None => &[],
            ValidationErrors::Messages(messages) => messages,
        }
    }
}

impl Serialize for ValidationErrors {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ValidationErrors::None => serializer.serialize_bool(false),
            ValidationErrors::Messages(messages) => messages.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ValidationErrors {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            List(Vec<String>),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Flag(_) => ValidationErrors::None,
            Repr::List(messages) => ValidationErrors::Messages(messages),
        })
    }
}

/// Outcome of validating (or setting) a single value.
///
/// Validation problems are data problems, not failures of the store, so this
/// is returned rather than raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the value passed validation.
    pub status: bool,
    /// The schema default for the checked key (null for undeclared keys).
    #[serde(rename = "default")]
    pub default_value: Option<Value>,
    /// `false`, or the ordered error messages.
    pub errors: ValidationErrors,
}

impl ValidationResult {
    pub fn valid(default_value: Option<Value>) -> Self {
        Self {
            status: true,
            default_value,
            errors: ValidationErrors::None,
        }
    }

    pub fn invalid(default_value: Option<Value>, messages: Vec<String>) -> Self {
        Self {
            status: false,
            default_value,
            errors: ValidationErrors::Messages(messages),
        }
    }

    /// Soft failure: the value was rejected and the default stored instead.
    pub fn default_applied(default_value: Option<Value>) -> Self {
        Self::invalid(default_value, vec![DEFAULT_APPLIED.to_string()])
    }

    pub fn is_default_applied(&self) -> bool {
        !self.status && self.errors.messages() == [DEFAULT_APPLIED]
    }
}

/// Outcome of a write request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// The document was written with the current settings.
    Written,
    /// A write was already in flight; it will be followed by one more write
    /// that includes the current settings.
    Coalesced,
    /// The physical write failed.
    Failed(String),
}

impl WriteOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, WriteOutcome::Failed(_))
    }

    /// The failure reason, if any.
    pub fn failure(&self) -> Option<&str> {
        match self {
            WriteOutcome::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}
