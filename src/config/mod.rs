//! Configuration document validation.
//!
//! After every successful source bind the platform pushes a JSON
//! configuration document. The framework validates it against the handler's
//! declared [`ConfigSpec`] before the handler sees it: a missing section or a
//! missing/mistyped required field is a rejection with a field-specific
//! message. Optional tuning fields are lenient; malformed values are logged
//! and defaulted instead of rejected.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Section consulted when a handler does not declare one.
pub const DEFAULT_SECTION: &str = "general";

pub const DEFAULT_MAX_ACTIVE_TASKS: usize = 5;
pub const DEFAULT_MAX_QUEUED_TASKS: usize = 10;
pub const DEFAULT_TASK_DEADLINE_SECS: u64 = 30;

/// Dispatcher bounds carried by each applied configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchLimits {
    pub max_active_tasks: usize,
    pub max_queued_tasks: usize,
    pub task_deadline: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        DispatchLimits {
            max_active_tasks: DEFAULT_MAX_ACTIVE_TASKS,
            max_queued_tasks: DEFAULT_MAX_QUEUED_TASKS,
            task_deadline: Duration::from_secs(DEFAULT_TASK_DEADLINE_SECS),
        }
    }
}

/// Primitive type expected of a required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "a string",
            FieldKind::Integer => "an integer",
            FieldKind::Number => "a number",
            FieldKind::Boolean => "a boolean",
        };
        write!(f, "{name}")
    }
}

/// One field a handler insists on receiving.
#[derive(Debug, Clone)]
pub struct RequiredField {
    pub name: String,
    pub kind: FieldKind,
}

/// What a handler demands of its configuration documents.
///
/// ```
/// use tether::config::{ConfigSpec, FieldKind};
///
/// let spec = ConfigSpec::section("modbus")
///     .require("host", FieldKind::String)
///     .require("port", FieldKind::Integer);
/// assert_eq!(spec.required.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigSpec {
    pub section: String,
    pub required: Vec<RequiredField>,
}

impl Default for ConfigSpec {
    fn default() -> Self {
        ConfigSpec {
            section: DEFAULT_SECTION.to_string(),
            required: Vec::new(),
        }
    }
}

impl ConfigSpec {
    pub fn section(name: impl Into<String>) -> Self {
        ConfigSpec {
            section: name.into(),
            required: Vec::new(),
        }
    }

    pub fn require(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.required.push(RequiredField {
            name: name.into(),
            kind,
        });
        self
    }
}

/// Why a configuration document was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("configuration document must be a JSON object")]
    NotAnObject,

    #[error("missing required section `{0}`")]
    MissingSection(String),

    #[error("section `{0}` must be a JSON object")]
    SectionNotObject(String),

    #[error("required field `{field}` missing from section `{section}`")]
    MissingField { section: String, field: String },

    #[error("field `{field}` must be {expected}, got {found}")]
    FieldType {
        field: String,
        expected: FieldKind,
        found: String,
    },
}

/// A validated document, installed wholesale; a later document replaces it
/// entirely rather than merging.
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    /// The full document as received.
    pub document: Value,
    /// The handler's own section.
    pub section: Map<String, Value>,
    pub limits: DispatchLimits,
    pub applied_at: DateTime<Utc>,
}

impl ActiveConfig {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.section.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }
}

/// Validates incoming documents against one handler's [`ConfigSpec`].
pub struct ConfigHandler {
    spec: ConfigSpec,
}

impl ConfigHandler {
    pub fn new(spec: ConfigSpec) -> Self {
        ConfigHandler { spec }
    }

    pub fn spec(&self) -> &ConfigSpec {
        &self.spec
    }

    /// Apply the validation policy in order, failing on the first violation.
    pub fn evaluate(&self, document: &Value) -> Result<ActiveConfig, ConfigError> {
        let root = document.as_object().ok_or(ConfigError::NotAnObject)?;

        let section_value = root
            .get(&self.spec.section)
            .ok_or_else(|| ConfigError::MissingSection(self.spec.section.clone()))?;
        let section = section_value
            .as_object()
            .ok_or_else(|| ConfigError::SectionNotObject(self.spec.section.clone()))?;

        for field in &self.spec.required {
            match section.get(&field.name) {
                None => {
                    return Err(ConfigError::MissingField {
                        section: self.spec.section.clone(),
                        field: field.name.clone(),
                    })
                }
                Some(value) if !field.kind.matches(value) => {
                    return Err(ConfigError::FieldType {
                        field: field.name.clone(),
                        expected: field.kind,
                        found: json_type_name(value).to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        Ok(ActiveConfig {
            document: document.clone(),
            section: section.clone(),
            limits: parse_limits(section),
            applied_at: Utc::now(),
        })
    }
}

/// Optional dispatcher bounds from the handler's section.
fn parse_limits(section: &Map<String, Value>) -> DispatchLimits {
    DispatchLimits {
        max_active_tasks: optional_u64(
            section,
            "maxActiveTasks",
            1,
            DEFAULT_MAX_ACTIVE_TASKS as u64,
        ) as usize,
        max_queued_tasks: optional_u64(
            section,
            "maxQueuedTasks",
            0,
            DEFAULT_MAX_QUEUED_TASKS as u64,
        ) as usize,
        task_deadline: Duration::from_secs(optional_u64(
            section,
            "taskDeadlineSecs",
            1,
            DEFAULT_TASK_DEADLINE_SECS,
        )),
    }
}

fn optional_u64(section: &Map<String, Value>, field: &str, min: u64, default: u64) -> u64 {
    match section.get(field) {
        None => default,
        Some(value) => match value.as_u64() {
            Some(n) if n >= min => n,
            _ => {
                warn!(field, value = %value, default, "malformed optional field, using default");
                default
            }
        },
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "an integer",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
