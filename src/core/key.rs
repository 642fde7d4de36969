//! Namespaced key construction
//!
//! Every stored entry is addressed by a `Key` built from a `Namespace`.
//! The namespace prefix isolates tenants and primitives sharing one
//! backend; the optional group adds a second level of scoping used by
//! the cache facade.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default separator between key segments.
pub const DEFAULT_SEPARATOR: &str = "/";

/// A key prefix shared by all entries of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    prefix: String,
    separator: String,
}

impl Namespace {
    /// Create a namespace with the default `/` separator.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }

    /// Create a namespace with an explicit separator.
    pub fn with_separator(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: separator.into(),
        }
    }

    /// The namespace prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The segment separator.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Derive a child namespace by appending a segment to the prefix.
    pub fn child(&self, segment: &str) -> Namespace {
        Namespace {
            prefix: format!("{}{}{}", self.prefix, self.separator, segment),
            separator: self.separator.clone(),
        }
    }

    /// Build a key rooted at this namespace.
    pub fn key(&self, user_key: impl Into<String>) -> Key {
        Key {
            prefix: self.prefix.clone(),
            separator: self.separator.clone(),
            group: None,
            key: user_key.into(),
        }
    }
}

/// A structured storage key: namespace prefix, optional group, user key.
///
/// Keys are immutable; `with_group` derives a new key sharing the
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    prefix: String,
    separator: String,
    group: Option<String>,
    key: String,
}

impl Key {
    /// The user-visible projection, omitting the namespace prefix.
    pub fn resolved(&self) -> String {
        match &self.group {
            Some(group) => format!("{}{}{}", group, self.separator, self.key),
            None => self.key.clone(),
        }
    }

    /// The fully-qualified storage string.
    pub fn namespaced(&self) -> String {
        format!("{}{}{}", self.prefix, self.separator, self.resolved())
    }

    /// The raw user key segment.
    pub fn user_key(&self) -> &str {
        &self.key
    }

    /// The group segment, when present.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// The namespace prefix this key is rooted at.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive a new key in `group`, sharing the prefix.
    pub fn with_group(&self, group: impl Into<String>) -> Key {
        Key {
            prefix: self.prefix.clone(),
            separator: self.separator.clone(),
            group: Some(group.into()),
            key: self.key.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespaced())
    }
}
