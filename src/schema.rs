//! Declarative payload validation.
//!
//! A `Schema` names the fields a handler expects and the constraints on
//! each. Validation is a total function over JSON values: it never
//! panics and reports every violated field by name, so error replies can
//! point the caller at the offending input.
//!
//! Typed handlers get structural validation for free through serde
//! decoding; a `Schema` adds the value-level constraints (lengths,
//! ranges, presence) that a struct definition cannot express.

use serde_json::Value;

/// Constraint violations found while validating a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", violations.join("; "))]
pub struct ValidationFailure {
    /// One human-readable message per violated constraint.
    pub violations: Vec<String>,
}

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }
}

/// Constraints on a single named field.
#[derive(Debug, Clone)]
pub struct FieldRule {
    name: String,
    kind: FieldKind,
    required: bool,
    min_len: Option<usize>,
    max_len: Option<usize>,
    min: Option<f64>,
    max: Option<f64>,
}

impl FieldRule {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            min_len: None,
            max_len: None,
            min: None,
            max: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Object)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Array)
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Any)
    }

    /// The field must be present.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Minimum length for strings and arrays.
    pub fn min_len(mut self, len: usize) -> Self {
        self.min_len = Some(len);
        self
    }

    /// Maximum length for strings and arrays.
    pub fn max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }

    /// Minimum numeric value (inclusive).
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Maximum numeric value (inclusive).
    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    fn check(&self, value: &Value, violations: &mut Vec<String>) {
        if !self.kind.matches(value) {
            violations.push(format!("{}: expected {}", self.name, self.kind.name()));
            return;
        }

        let len = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            _ => None,
        };
        if let (Some(len), Some(min)) = (len, self.min_len) {
            if len < min {
                violations.push(format!(
                    "{}: length {} is less than minimum {}",
                    self.name, len, min
                ));
            }
        }
        if let (Some(len), Some(max)) = (len, self.max_len) {
            if len > max {
                violations.push(format!(
                    "{}: length {} exceeds maximum {}",
                    self.name, len, max
                ));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    violations.push(format!("{}: {} is less than minimum {}", self.name, n, min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    violations.push(format!("{}: {} exceeds maximum {}", self.name, n, max));
                }
            }
        }
    }
}

/// A named set of field rules validated against request payloads.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    fields: Vec<FieldRule>,
}

impl Schema {
    /// Create an empty schema with a tag name carried in envelopes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field rule.
    pub fn field(mut self, rule: FieldRule) -> Self {
        self.fields.push(rule);
        self
    }

    /// Schema tag carried in envelopes.
    pub fn tag(&self) -> &str {
        &self.name
    }

    /// Validate a payload, reporting every violated field.
    pub fn validate(&self, payload: &Value) -> Result<(), ValidationFailure> {
        let Some(object) = payload.as_object() else {
            return Err(ValidationFailure {
                violations: vec!["payload must be an object".to_string()],
            });
        };

        let mut violations = Vec::new();
        for rule in &self.fields {
            match object.get(&rule.name) {
                Some(Value::Null) | None if rule.required => {
                    violations.push(format!("{}: field is required", rule.name));
                }
                Some(Value::Null) | None => {}
                Some(value) => rule.check(value, &mut violations),
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure { violations })
        }
    }
}
