//! Test identifiers and their filesystem rendering.
//!
//! Every task in a job carries a [`TestId`]. Its display form is
//! `"{uid}-{name}"` with `";{variant}"` appended when the test runs under a
//! variant. The same identity also names the task's artifact directory, so
//! it must be renderable as a single path component no longer than the
//! filesystem allows.
//!
//! # Shortening
//!
//! When the full rendering does not fit, [`TestId::filesystem_name_with_limit`]
//! gives up information in this order:
//!
//! 1. shrink the name, keeping the uid and the full variant
//! 2. drop the name, keeping the uid and as much of the variant as fits
//! 3. fail with [`IdentifierError::IdentifierTooLong`] when the uid alone
//!    does not fit
//!
//! # Example
//!
//! ```
//! use avocado_pipeline::identifier::TestId;
//!
//! let id = TestId::new("1", "passtest.py:PassTest.test").with_variant("short-beaf");
//! assert_eq!(id.to_string(), "1-passtest.py:PassTest.test;short-beaf");
//! assert_eq!(
//!     id.filesystem_name().unwrap(),
//!     "1-passtest.py_PassTest.test_short-beaf"
//! );
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::layout::{FS_NAME_MAX, replace_unsafe_chars, truncate_to_bytes};

/// Name used when a runner does not provide one.
pub const UNKNOWN_NAME: &str = "<unknown>";

/// Name given to identifiers built from an opaque uid.
pub const OPAQUE_NAME: &str = "test";

/// Result type for identifier operations.
pub type IdentifierResult<T> = Result<T, IdentifierError>;

/// Errors produced while rendering identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    /// Even the uid cannot be represented within the filesystem limit.
    #[error("test uid '{uid}' does not fit in a {limit}-byte filesystem name")]
    IdentifierTooLong { uid: String, limit: usize },
}

/// Identity of a single test within a job.
///
/// Equality compares every field. Identifiers are immutable once built;
/// the builder methods consume and return `self`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestId {
    uid: String,
    name: String,
    variant: Option<String>,
    uid_digits: Option<usize>,
}

impl TestId {
    /// Creates an identifier. An empty name becomes `"<unknown>"`.
    pub fn new(uid: impl fmt::Display, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uid: uid.to_string(),
            name: if name.is_empty() {
                UNKNOWN_NAME.to_string()
            } else {
                name
            },
            variant: None,
            uid_digits: None,
        }
    }

    /// Sets the variant. An empty variant is treated as absent.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        let variant = variant.into();
        self.variant = if variant.is_empty() {
            None
        } else {
            Some(variant)
        };
        self
    }

    /// Left-pads the uid with zeros to `digits` characters.
    pub fn with_uid_digits(mut self, digits: usize) -> Self {
        self.uid = format!("{:0>width$}", self.uid, width = digits);
        self.uid_digits = Some(digits);
        self
    }

    /// Treats `identifier` as an opaque uid named `"test"`.
    ///
    /// Use this when a runner reports a task identity that was not produced
    /// by this crate.
    pub fn from_identifier(identifier: impl fmt::Display) -> Self {
        Self::new(identifier, OPAQUE_NAME)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    pub fn uid_digits(&self) -> Option<usize> {
        self.uid_digits
    }

    /// Renders the identifier as a single safe path component of at most
    /// [`FS_NAME_MAX`] bytes.
    pub fn filesystem_name(&self) -> IdentifierResult<String> {
        self.filesystem_name_with_limit(FS_NAME_MAX)
    }

    /// Like [`filesystem_name`](Self::filesystem_name) with an explicit limit.
    pub fn filesystem_name_with_limit(&self, limit: usize) -> IdentifierResult<String> {
        let full = replace_unsafe_chars(&self.to_string());
        if full.len() <= limit {
            return Ok(full);
        }

        let uid = replace_unsafe_chars(&self.uid);
        let variant = self
            .variant
            .as_deref()
            .map(|v| replace_unsafe_chars(&format!(";{v}")))
            .unwrap_or_default();

        // uid + '-' + at least one byte of name + variant
        let fixed = uid.len() + 1 + variant.len();
        if fixed < limit {
            let name = replace_unsafe_chars(&self.name);
            let name = truncate_to_bytes(&name, limit - fixed);
            return Ok(format!("{uid}-{name}{variant}"));
        }

        if uid.len() <= limit {
            let combined = format!("{uid}{variant}");
            return Ok(truncate_to_bytes(&combined, limit).to_string());
        }

        Err(IdentifierError::IdentifierTooLong {
            uid: self.uid.clone(),
            limit,
        })
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.uid, self.name)?;
        if let Some(variant) = &self.variant {
            write!(f, ";{variant}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_variant() {
        let id = TestId::new(1, "examples/tests/passtest.py:PassTest.test");
        assert_eq!(id.to_string(), "1-examples/tests/passtest.py:PassTest.test");
        assert!(id.variant().is_none());
    }

    #[test]
    fn test_missing_name_and_variant_are_normalized() {
        let id = TestId::new("7", "").with_variant("");
        assert_eq!(id.name(), UNKNOWN_NAME);
        assert_eq!(id.variant(), None);
        assert_eq!(id.to_string(), "7-<unknown>");
    }

    #[test]
    fn test_uid_padding() {
        let id = TestId::new(3, "t").with_uid_digits(3);
        assert_eq!(id.uid(), "003");
        assert_eq!(id.uid_digits(), Some(3));
        assert_eq!(id.to_string(), "003-t");
    }

    #[test]
    fn test_from_identifier() {
        let id = TestId::from_identifier("external-42");
        assert_eq!(id.uid(), "external-42");
        assert_eq!(id.name(), "test");
    }

    #[test]
    fn test_equality_compares_all_fields() {
        let a = TestId::new(1, "t").with_variant("v");
        let b = TestId::new(1, "t").with_variant("v");
        let c = TestId::new(1, "t");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_filesystem_name_substitutes_unsafe_chars() {
        let id = TestId::new(1, "a/b:c").with_variant("x*y");
        assert_eq!(id.filesystem_name().unwrap(), "1-a_b_c_x_y");
    }

    #[test]
    fn test_filesystem_name_shrinks_name_first() {
        let id = TestId::new("1", "t".repeat(300)).with_variant("v".repeat(10));
        let name = id.filesystem_name_with_limit(255).unwrap();
        assert_eq!(name.len(), 255);
        assert!(name.starts_with("1-"));
        assert!(name.ends_with("_vvvvvvvvvv"));
    }

    #[test]
    fn test_filesystem_name_drops_name_and_truncates_variant() {
        let id = TestId::new("12345", "name").with_variant("v".repeat(20));
        let name = id.filesystem_name_with_limit(10).unwrap();
        assert_eq!(name, "12345_vvvv");
    }

    #[test]
    fn test_filesystem_name_uid_too_long() {
        let id = TestId::new("x".repeat(20), "name");
        let err = id.filesystem_name_with_limit(10).unwrap_err();
        assert!(matches!(err, IdentifierError::IdentifierTooLong { limit: 10, .. }));
    }

    #[test]
    fn test_filesystem_name_multibyte_name_stays_on_char_boundary() {
        let id = TestId::new("1", "é".repeat(200));
        let name = id.filesystem_name_with_limit(255).unwrap();
        assert!(name.len() <= 255);
        assert!(name.starts_with("1-é"));
    }
}
