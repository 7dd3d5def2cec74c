//! Fully qualified JIT group identifiers.

use crate::errors::{KairosError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a JIT group as `(environment, system, name)`.
///
/// The canonical string form is `environment.system.name`. Identifiers
/// are case-insensitive; all components are canonicalized to lowercase
/// at construction so equality and hashing need no special casing.
///
/// # Example
///
/// ```rust
/// use kairos_core::policy::JitGroupId;
///
/// let id: JitGroupId = "Env-1.Sys-1.Admins".parse().unwrap();
/// assert_eq!(id.to_string(), "env-1.sys-1.admins");
/// assert_eq!(id, "ENV-1.SYS-1.ADMINS".parse().unwrap());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JitGroupId {
    environment: String,
    system: String,
    name: String,
}

impl JitGroupId {
    /// Creates an identifier from its components.
    pub fn new(
        environment: impl Into<String>,
        system: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into().to_ascii_lowercase(),
            system: system.into().to_ascii_lowercase(),
            name: name.into().to_ascii_lowercase(),
        }
    }

    /// The environment component.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The system component.
    pub fn system(&self) -> &str {
        &self.system
    }

    /// The group name component.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for JitGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.environment, self.system, self.name)
    }
}

impl FromStr for JitGroupId {
    type Err = KairosError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [env, sys, name] if !env.is_empty() && !sys.is_empty() && !name.is_empty() => {
                Ok(Self::new(*env, *sys, *name))
            }
            _ => Err(KairosError::invalid_input(
                "group",
                format!("'{s}' is not a valid group id, expected environment.system.name"),
            )),
        }
    }
}

impl From<JitGroupId> for String {
    fn from(id: JitGroupId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for JitGroupId {
    type Error = KairosError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}
