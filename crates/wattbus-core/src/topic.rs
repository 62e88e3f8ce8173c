//! Hierarchical topic paths
//!
//! Topics are bounded slash-delimited paths. The final character may be a
//! reserved suffix: `$` metadata, `?` query, `#` return code. Components
//! starting with `!` are commands or events and are never retained; the `_`
//! prefix marks broker-local control topics and `@` marks broadcast topics.

use crate::error::{Error, Result};

/// Maximum total topic length in bytes
pub const TOPIC_LENGTH_MAX: usize = 64;
/// Maximum number of components
pub const TOPIC_COMPONENTS_MAX: usize = 32;
/// Maximum length of one component in bytes
pub const TOPIC_COMPONENT_MAX: usize = 8;

/// Broker-local subscribe control topic
pub const TOPIC_SUB: &str = "_/!sub";
/// Broker-local unsubscribe control topic
pub const TOPIC_UNSUB: &str = "_/!unsub";
/// Broker-local unsubscribe-all control topic
pub const TOPIC_UNSUB_ALL: &str = "_/!unsub+";
/// Broker-local query control topic
pub const TOPIC_QUERY: &str = "_/!query";
/// Broadcast device-add event topic
pub const TOPIC_DEVICE_ADD: &str = "@/!add";
/// Broadcast device-remove event topic
pub const TOPIC_DEVICE_REMOVE: &str = "@/!remove";

/// Reserved one-character topic suffixes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suffix {
    /// `$` — metadata request or response
    Metadata,
    /// `?` — query request or response
    Query,
    /// `#` — return code
    ReturnCode,
}

impl Suffix {
    /// Classify a suffix character.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '$' => Some(Suffix::Metadata),
            '?' => Some(Suffix::Query),
            '#' => Some(Suffix::ReturnCode),
            _ => None,
        }
    }

    /// The suffix character.
    pub fn as_char(&self) -> char {
        match self {
            Suffix::Metadata => '$',
            Suffix::Query => '?',
            Suffix::ReturnCode => '#',
        }
    }
}

/// A bounded, slash-delimited topic path
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Topic {
    path: String,
}

impl Topic {
    /// Parse and validate a topic path.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate(&path)?;
        Ok(Self { path })
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.path.len()
    }

    /// Whether the path is empty.
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// Append one component, returning the new total length.
    pub fn append(&mut self, component: &str) -> Result<usize> {
        if component.is_empty() || component.len() > TOPIC_COMPONENT_MAX {
            return Err(Error::ParameterInvalid(format!("component {component:?}")));
        }
        if component.contains('/') {
            return Err(Error::ParameterInvalid(format!("component {component:?}")));
        }
        let sep = usize::from(!self.path.is_empty());
        if self.path.len() + sep + component.len() > TOPIC_LENGTH_MAX {
            return Err(Error::TooBig);
        }
        if self.components().count() + 1 > TOPIC_COMPONENTS_MAX {
            return Err(Error::TooBig);
        }
        if sep == 1 {
            self.path.push('/');
        }
        self.path.push_str(component);
        Ok(self.path.len())
    }

    /// Remove the final component, returning the number of bytes removed
    /// (component plus separator).
    pub fn remove(&mut self) -> usize {
        let before = self.path.len();
        match self.path.rfind('/') {
            Some(idx) => self.path.truncate(idx),
            None => self.path.clear(),
        }
        before - self.path.len()
    }

    /// Truncate the path to `len` bytes. Used with a length saved before
    /// [`append`](Self::append) to restore the original path.
    pub fn truncate(&mut self, len: usize) {
        self.path.truncate(len);
    }

    /// The reserved suffix, when the final character is one.
    pub fn suffix(&self) -> Option<Suffix> {
        self.path.chars().next_back().and_then(Suffix::from_char)
    }

    /// The path without its reserved suffix character.
    pub fn base(&self) -> &str {
        match self.suffix() {
            Some(_) => &self.path[..self.path.len() - 1],
            None => &self.path,
        }
    }

    /// The final component (suffix character excluded).
    pub fn leaf(&self) -> &str {
        let base = self.base();
        match base.rfind('/') {
            Some(idx) => &base[idx + 1..],
            None => base,
        }
    }

    /// Iterate components of the suffix-stripped path.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        let base = self.base();
        base.split('/').filter(|c| !c.is_empty())
    }

    /// Whether this is a broker-local control topic (`_` prefix).
    pub fn is_broker_local(&self) -> bool {
        self.path.starts_with('_')
    }

    /// Whether this is a broadcast topic (`@` prefix).
    pub fn is_broadcast(&self) -> bool {
        self.path.starts_with('@')
    }

    /// Whether the leaf is a command or event component (`!` prefix);
    /// such publications are never retained.
    pub fn leaf_is_event(&self) -> bool {
        self.leaf().starts_with('!')
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

impl std::str::FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Topic::new(s)
    }
}

fn validate(path: &str) -> Result<()> {
    if path.len() > TOPIC_LENGTH_MAX {
        return Err(Error::TooBig);
    }
    // The suffix character is not part of the final component.
    let base = match path.chars().next_back().and_then(Suffix::from_char) {
        Some(_) => &path[..path.len() - 1],
        None => path,
    };
    let mut count = 0;
    for component in base.split('/') {
        if component.is_empty() {
            continue;
        }
        count += 1;
        if component.len() > TOPIC_COMPONENT_MAX {
            return Err(Error::ParameterInvalid(format!("component {component:?}")));
        }
    }
    if count > TOPIC_COMPONENTS_MAX {
        return Err(Error::TooBig);
    }
    Ok(())
}
