//! Expiry constraints bound the lifetime of a JIT membership.

use crate::constraint::property::{PropertyDecl, PropertyType, PropertyValue};
use crate::errors::{KairosError, Result};
use std::fmt;
use time::Duration;

/// Name of the duration input exposed by user-defined expiry
/// constraints, and the default constraint name.
pub const EXPIRY_PROPERTY: &str = "expiry";

/// Bounds the duration of a membership granted by a join.
///
/// A *fixed* constraint (`min == max`) always grants exactly its
/// duration and needs no input. A *user-defined* constraint exposes a
/// required `Duration` input and is satisfied iff the supplied value
/// falls within `[min, max]`.
#[derive(Clone)]
pub struct ExpiryConstraint {
    name: String,
    display_name: String,
    min: Duration,
    max: Duration,
    property: Option<PropertyDecl>,
}

impl ExpiryConstraint {
    /// Creates an expiry constraint with the given bounds.
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        min: Duration,
        max: Duration,
    ) -> Result<Self> {
        let name = name.into();
        if min <= Duration::ZERO {
            return Err(KairosError::InvalidPolicy(format!(
                "constraint '{name}': minimum expiry must be positive"
            )));
        }
        if max < min {
            return Err(KairosError::InvalidPolicy(format!(
                "constraint '{name}': maximum expiry is below the minimum"
            )));
        }

        let display_name = display_name.into();
        let property = (min != max).then(|| {
            PropertyDecl::new(
                EXPIRY_PROPERTY,
                display_name.clone(),
                PropertyType::Duration,
                true,
            )
            .with_range(min.whole_seconds(), max.whole_seconds())
        });

        Ok(Self {
            name,
            display_name,
            min,
            max,
            property,
        })
    }

    /// Creates a fixed expiry constraint.
    pub fn fixed(duration: Duration) -> Result<Self> {
        Self::new(EXPIRY_PROPERTY, "Expiry", duration, duration)
    }

    /// Creates a user-defined expiry constraint over `[min, max]`.
    pub fn range(min: Duration, max: Duration) -> Result<Self> {
        Self::new(EXPIRY_PROPERTY, "Expiry", min, max)
    }

    /// The constraint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human-readable name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The minimum membership duration.
    pub fn min(&self) -> Duration {
        self.min
    }

    /// The maximum membership duration.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Whether the duration is fixed rather than user-supplied.
    pub fn is_fixed(&self) -> bool {
        self.property.is_none()
    }

    /// The duration input, present only for user-defined constraints.
    pub fn property_decl(&self) -> Option<&PropertyDecl> {
        self.property.as_ref()
    }

    /// Whether the constraint is satisfied given the (possibly unset)
    /// expiry input value.
    ///
    /// Fixed constraints are always satisfied. User-defined constraints
    /// require a supplied value within bounds; range enforcement also
    /// happens at property set time, so an out-of-range value can only
    /// appear here if the property was built without bounds.
    pub fn is_satisfied(&self, input: Option<&PropertyValue>) -> bool {
        if self.is_fixed() {
            return true;
        }
        match input {
            Some(PropertyValue::Duration(d)) => *d >= self.min && *d <= self.max,
            _ => false,
        }
    }

    /// The membership duration this constraint grants, given the input.
    ///
    /// Returns `None` when a user-defined constraint has no valid input.
    pub fn duration(&self, input: Option<&PropertyValue>) -> Option<Duration> {
        if self.is_fixed() {
            return Some(self.min);
        }
        match input {
            Some(PropertyValue::Duration(d)) if self.is_satisfied(input) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Debug for ExpiryConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiryConstraint")
            .field("name", &self.name)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("fixed", &self.is_fixed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_constraint_needs_no_input() {
        let constraint = ExpiryConstraint::fixed(Duration::seconds(60)).unwrap();

        assert!(constraint.is_fixed());
        assert!(constraint.property_decl().is_none());
        assert!(constraint.is_satisfied(None));
        assert_eq!(constraint.duration(None), Some(Duration::seconds(60)));
    }

    #[test]
    fn test_user_defined_exposes_required_duration_input() {
        let constraint =
            ExpiryConstraint::range(Duration::seconds(60), Duration::days(3)).unwrap();

        let decl = constraint.property_decl().unwrap();
        assert_eq!(decl.name, EXPIRY_PROPERTY);
        assert_eq!(decl.kind, PropertyType::Duration);
        assert!(decl.required);
        assert_eq!(decl.min_inclusive, Some(60));
        assert_eq!(decl.max_inclusive, Some(259_200));
    }

    #[test]
    fn test_user_defined_satisfied_only_within_bounds() {
        let constraint =
            ExpiryConstraint::range(Duration::seconds(60), Duration::days(3)).unwrap();

        assert!(!constraint.is_satisfied(None));
        assert!(constraint.is_satisfied(Some(&PropertyValue::Duration(Duration::seconds(120)))));
        assert!(!constraint.is_satisfied(Some(&PropertyValue::Duration(Duration::seconds(30)))));
        assert!(!constraint.is_satisfied(Some(&PropertyValue::Duration(Duration::days(4)))));
    }

    #[test]
    fn test_duration_echoes_supplied_value() {
        let constraint =
            ExpiryConstraint::range(Duration::seconds(60), Duration::days(3)).unwrap();

        assert_eq!(
            constraint.duration(Some(&PropertyValue::Duration(Duration::seconds(120)))),
            Some(Duration::seconds(120))
        );
        assert_eq!(constraint.duration(None), None);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        assert!(ExpiryConstraint::range(Duration::seconds(0), Duration::seconds(60)).is_err());
        assert!(ExpiryConstraint::range(Duration::seconds(120), Duration::seconds(60)).is_err());
    }
}
