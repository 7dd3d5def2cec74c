//! Typed input properties for constraint checks.
//!
//! A property declares its type, display name, required flag, and an
//! optional inclusive range. Values arrive as strings (form fields,
//! deferral payloads) and are parsed at set time; parse failures and
//! out-of-range values are rejected immediately as `InvalidInput`.

use crate::errors::{KairosError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;
use time::Duration;

/// The declared type of a property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    /// Free-form text.
    String,
    /// `true` / `false`, case-insensitive.
    Bool,
    /// 64-bit signed integer.
    Long,
    /// Duration expressed as integer seconds.
    Duration,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Bool => write!(f, "bool"),
            Self::Long => write!(f, "long"),
            Self::Duration => write!(f, "duration"),
        }
    }
}

/// A parsed property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// Text value.
    String(String),
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Long(i64),
    /// Duration value.
    Duration(Duration),
}

impl PropertyValue {
    /// Serializes the value back to its string form.
    pub fn to_raw(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Long(n) => n.to_string(),
            Self::Duration(d) => d.whole_seconds().to_string(),
        }
    }
}

/// Declaration of a property: everything but the value.
///
/// Constraints carry declarations; each analysis instantiates them into
/// live [`Property`] instances (shared across constraints when names
/// collide).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDecl {
    /// Stable property name, used as the form-field key.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Declared value type.
    #[serde(rename = "type")]
    pub kind: PropertyType,
    /// Whether a value must be supplied before execution.
    #[serde(default)]
    pub required: bool,
    /// Inclusive lower bound (value for `Long`, seconds for `Duration`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_inclusive: Option<i64>,
    /// Inclusive upper bound (value for `Long`, seconds for `Duration`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inclusive: Option<i64>,
}

impl PropertyDecl {
    /// Creates a declaration without bounds.
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        kind: PropertyType,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            kind,
            required,
            min_inclusive: None,
            max_inclusive: None,
        }
    }

    /// Adds an inclusive range.
    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min_inclusive = Some(min);
        self.max_inclusive = Some(max);
        self
    }

    /// Instantiates an unset property from this declaration.
    pub fn instantiate(&self) -> Property {
        Property {
            decl: self.clone(),
            value: RwLock::new(None),
        }
    }
}

/// A live, settable property instance.
///
/// Interior mutability lets several checks of one analysis share the
/// same instance when their constraints declare the same input name.
#[derive(Debug)]
pub struct Property {
    decl: PropertyDecl,
    value: RwLock<Option<PropertyValue>>,
}

impl Property {
    /// The property name.
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// The human-readable name.
    pub fn display_name(&self) -> &str {
        &self.decl.display_name
    }

    /// The declared type.
    pub fn kind(&self) -> PropertyType {
        self.decl.kind
    }

    /// Whether a value must be supplied.
    pub fn is_required(&self) -> bool {
        self.decl.required
    }

    /// The declaration this instance was built from.
    pub fn decl(&self) -> &PropertyDecl {
        &self.decl
    }

    /// Parses and stores a value.
    ///
    /// The raw string is parsed according to the declared type; range
    /// bounds are validated at set time.
    pub fn set(&self, raw: &str) -> Result<()> {
        let value = self.parse(raw)?;
        self.check_range(&value)?;
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = Some(value);
        Ok(())
    }

    /// The current value, if set.
    pub fn get(&self) -> Option<PropertyValue> {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether a value has been set.
    pub fn is_set(&self) -> bool {
        self.value.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// The current value serialized back to its string form.
    pub fn get_raw(&self) -> Option<String> {
        self.get().map(|v| v.to_raw())
    }

    fn parse(&self, raw: &str) -> Result<PropertyValue> {
        let raw = raw.trim();
        match self.decl.kind {
            PropertyType::String => Ok(PropertyValue::String(raw.to_string())),
            PropertyType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" => Ok(PropertyValue::Bool(true)),
                "false" => Ok(PropertyValue::Bool(false)),
                _ => Err(KairosError::invalid_input(
                    &self.decl.name,
                    format!("'{raw}' is not a boolean"),
                )),
            },
            PropertyType::Long => raw
                .parse::<i64>()
                .map(PropertyValue::Long)
                .map_err(|_| {
                    KairosError::invalid_input(
                        &self.decl.name,
                        format!("'{raw}' is not an integer"),
                    )
                }),
            PropertyType::Duration => raw
                .parse::<i64>()
                .map(|secs| PropertyValue::Duration(Duration::seconds(secs)))
                .map_err(|_| {
                    KairosError::invalid_input(
                        &self.decl.name,
                        format!("'{raw}' is not a duration in seconds"),
                    )
                }),
        }
    }

    fn check_range(&self, value: &PropertyValue) -> Result<()> {
        let scalar = match value {
            PropertyValue::Long(n) => *n,
            PropertyValue::Duration(d) => d.whole_seconds(),
            _ => return Ok(()),
        };

        if let Some(min) = self.decl.min_inclusive {
            if scalar < min {
                return Err(KairosError::invalid_input(
                    &self.decl.name,
                    format!("{scalar} is below the minimum of {min}"),
                ));
            }
        }
        if let Some(max) = self.decl.max_inclusive {
            if scalar > max {
                return Err(KairosError::invalid_input(
                    &self.decl.name,
                    format!("{scalar} exceeds the maximum of {max}"),
                ));
            }
        }
        Ok(())
    }
}
