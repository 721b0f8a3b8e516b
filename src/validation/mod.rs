//! # Validation
//!
//! Field validators accumulate human-readable violations instead of failing
//! on the first problem; a value is rejected when any violation was recorded.

use thiserror::Error;

pub mod audience;
pub mod fields;

pub use audience::{AudienceBlobValidator, UpdatableDataValidator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{subject} is invalid: {}", .violations.join("; "))]
pub struct ValidationError {
    pub subject: String,
    pub violations: Vec<String>,
}

pub trait Validator<T: ?Sized> {
    /// Appends one message per violated constraint.
    fn add_violations(&self, value: &T, violations: &mut Vec<String>);

    fn validate(&self, subject: &str, value: &T) -> Result<(), ValidationError> {
        let mut violations = Vec::new();
        self.add_violations(value, &mut violations);
        into_result(subject, violations)
    }
}

pub(crate) fn into_result(subject: &str, violations: Vec<String>) -> Result<(), ValidationError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            subject: subject.to_string(),
            violations,
        })
    }
}
