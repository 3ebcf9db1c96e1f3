//! Constraint checking shared by the relational write path and the index
//! upsert path. Request and document structs derive `validator::Validate`;
//! the custom rules below plug into those derives. Failures are flattened into
//! `Violations`, each carrying a stable rule code so clients can render their
//! own translated message.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use uuid::Uuid;
use validator::{ValidationError, ValidationErrors};

/// Constraint that a field failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    Required,
    MaxLength { max: usize },
    NonNegative,
    Positive,
    Object,
    Uuid,
    Invalid,
}

impl Rule {
    /// Rule named by a validator error code. `max_length` reads its bound
    /// from the error params.
    pub fn from_error(error: &ValidationError) -> Self {
        match &*error.code {
            "required" => Rule::Required,
            "max_length" => Rule::MaxLength {
                max: error
                    .params
                    .get("max")
                    .and_then(Value::as_u64)
                    .unwrap_or_default() as usize,
            },
            "non_negative" => Rule::NonNegative,
            "positive" => Rule::Positive,
            "object" => Rule::Object,
            "uuid" => Rule::Uuid,
            _ => Rule::Invalid,
        }
    }

    fn describe(&self) -> String {
        match self {
            Rule::Required => "is required".into(),
            Rule::MaxLength { max } => format!("must be at most {} characters", max),
            Rule::NonNegative => "must not be negative".into(),
            Rule::Positive => "must be greater than zero".into(),
            Rule::Object => "must be a JSON object".into(),
            Rule::Uuid => "must be a valid UUID".into(),
            Rule::Invalid => "is invalid".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    #[serde(flatten)]
    pub rule: Rule,
    pub message: String,
}

/// Ordered collection of violations; empty means the input passed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Violations(Vec<FieldViolation>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: &str, rule: Rule) -> Self {
        let mut v = Self::new();
        v.push(field, rule);
        v
    }

    pub fn push(&mut self, field: &str, rule: Rule) {
        self.0.push(FieldViolation {
            field: field.to_string(),
            message: format!("{} {}", field, rule.describe()),
            rule,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldViolation> {
        self.0.iter()
    }
}

/// Fields come out sorted by name; within a field, in declaration order of
/// its rules.
impl From<ValidationErrors> for Violations {
    fn from(errors: ValidationErrors) -> Self {
        let mut fields: Vec<_> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| (field.to_string(), errors))
            .collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let mut v = Violations::new();
        for (field, errors) in fields {
            for error in errors.iter() {
                v.push(&field, Rule::from_error(error));
            }
        }
        v
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|v| v.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

/// Parse an identifier supplied by a caller.
pub fn parse_uuid(field: &str, raw: &str) -> Result<Uuid, Violations> {
    Uuid::parse_str(raw.trim()).map_err(|_| Violations::single(field, Rule::Uuid))
}

/// Whitespace-only text counts as missing.
pub fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("required"));
    }
    Ok(())
}

pub fn non_negative_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        return Err(ValidationError::new("non_negative"));
    }
    Ok(())
}

/// `specs` feeds `specs.<key>` filters, so anything but an object (or an
/// explicit null) is rejected.
pub fn json_object(value: &Value) -> Result<(), ValidationError> {
    if value.is_object() || value.is_null() {
        return Ok(());
    }
    Err(ValidationError::new("object"))
}

pub fn uuid_text(value: &str) -> Result<(), ValidationError> {
    Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| ValidationError::new("uuid"))
}
