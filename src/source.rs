//! Source and display references
//!
//! A [`SourceReference`] is the caller-owned locator of an unprocessed image.
//! A [`DisplayReference`] is whatever the renderer should bind to: either the
//! original source or a published, processed result.

use crate::publish::PublishedReference;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque, immutable locator of an image to process
///
/// Cloning is cheap; the string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceReference(Arc<str>);

impl SourceReference {
    pub fn new<S: AsRef<str>>(locator: S) -> Self {
        Self(Arc::from(locator.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheme of the locator (`https`, `file`, `data`, ...), if it has one
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.0.split_once(':')?;
        let valid = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        valid.then_some(scheme)
    }

    /// Short label for logs and file names: the last path segment, or the whole
    /// locator for `data:` URIs (truncated)
    #[must_use]
    pub fn short_name(&self) -> &str {
        if self.scheme() == Some("data") {
            return self.0.get(..self.0.len().min(24)).unwrap_or("data");
        }
        let without_query = self.0.split(['?', '#']).next().unwrap_or(&self.0);
        without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.0)
    }
}

impl std::fmt::Display for SourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // data: payloads can be megabytes long
        if self.scheme() == Some("data") && self.0.len() > 64 {
            write!(f, "{}...({} bytes)", self.0.get(..48).unwrap_or(""), self.0.len())
        } else {
            f.write_str(&self.0)
        }
    }
}

impl AsRef<str> for SourceReference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceReference {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SourceReference {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// The reference a renderer should currently display
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DisplayReference {
    /// The unprocessed source (before completion, or after fallback)
    Original(SourceReference),
    /// A processed image held in the resource table
    Published(PublishedReference),
}

impl DisplayReference {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Original(source) => source.as_str(),
            Self::Published(published) => published.as_str(),
        }
    }

    #[must_use]
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published(_))
    }

    #[must_use]
    pub fn published(&self) -> Option<&PublishedReference> {
        match self {
            Self::Published(published) => Some(published),
            Self::Original(_) => None,
        }
    }
}

impl std::fmt::Display for DisplayReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
