//! Field-constraint validation.
//!
//! Commands declare their constraints through [`Validate`]; a [`Validator`]
//! checks them and returns human-readable violations. [`RuleValidator`] is the
//! stock implementation.

use crate::error::CatalogError;
use uuid::Uuid;

/// A declared constraint on one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rule {
    /// Text must be non-blank, numbers non-zero, ids non-nil, lists non-empty.
    Required,
    /// Text length ceiling, in characters.
    MaxLen(usize),
    /// Numeric lower bound (inclusive). For lists, a minimum element count.
    Min(f64),
}

/// Borrowed value of a field under validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    /// Free text
    Text(&'a str),
    /// Numeric value
    Number(f64),
    /// Identifier
    Id(Uuid),
    /// Number of elements in a collection
    Count(usize),
}

/// One field and the rules it must satisfy.
#[derive(Debug, Clone, Copy)]
pub struct Field<'a> {
    /// Field name used in messages
    pub name: &'static str,
    /// Current value
    pub value: FieldValue<'a>,
    /// Constraints, checked in order
    pub rules: &'static [Rule],
}

impl<'a> Field<'a> {
    /// Declare a field.
    #[must_use]
    pub const fn new(name: &'static str, value: FieldValue<'a>, rules: &'static [Rule]) -> Self {
        Self { name, value, rules }
    }
}

/// Implemented by every command that carries field constraints.
pub trait Validate {
    /// The fields to check.
    fn fields(&self) -> Vec<Field<'_>>;
}

/// External validation collaborator.
pub trait Validator: Send + Sync {
    /// Check `fields`; an empty result means valid.
    fn validate(&self, fields: &[Field<'_>]) -> Vec<String>;
}

/// Validate `subject`, mapping violations to [`CatalogError::Validation`].
///
/// # Errors
///
/// Returns [`CatalogError::Validation`] listing every violation found.
pub fn ensure_valid<V: Validate + ?Sized>(
    validator: &dyn Validator,
    subject: &V,
) -> Result<(), CatalogError> {
    let violations = validator.validate(&subject.fields());
    if violations.is_empty() {
        Ok(())
    } else {
        Err(CatalogError::Validation(violations))
    }
}

/// Checks [`Rule`]s and reports the first violation of each field.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleValidator;

impl RuleValidator {
    #[allow(clippy::float_cmp, clippy::cast_precision_loss)]
    fn check(field: &Field<'_>, rule: Rule) -> Option<String> {
        let name = field.name;
        match (rule, field.value) {
            (Rule::Required, FieldValue::Text(text)) if text.trim().is_empty() => {
                Some(format!("{name} is required"))
            }
            (Rule::Required, FieldValue::Number(n)) if n == 0.0 => Some(format!("{name} is required")),
            (Rule::Required, FieldValue::Id(id)) if id.is_nil() => Some(format!("{name} is required")),
            (Rule::Required, FieldValue::Count(0)) => Some(format!("{name} is required")),
            (Rule::MaxLen(max), FieldValue::Text(text)) if text.chars().count() > max => {
                Some(format!("{name} must be at most {max} characters"))
            }
            (Rule::Min(min), FieldValue::Number(n)) if n < min => {
                Some(format!("{name} must be at least {min}"))
            }
            (Rule::Min(min), FieldValue::Count(n)) if (n as f64) < min => {
                Some(format!("{name} must contain at least {min} items"))
            }
            _ => None,
        }
    }
}

impl Validator for RuleValidator {
    fn validate(&self, fields: &[Field<'_>]) -> Vec<String> {
        fields
            .iter()
            .filter_map(|field| {
                field
                    .rules
                    .iter()
                    .find_map(|rule| Self::check(field, *rule))
            })
            .collect()
    }
}
