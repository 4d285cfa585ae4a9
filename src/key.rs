//! Cache key namespacing.

/// Separator placed between the namespace and the caller's key.
pub const SEPARATOR: char = ':';

/// Namespace applied to every key the facade sends to a backend.
///
/// Cache entries and lock entries share the backend keyspace; the prefix is
/// the only thing that separates one application's entries from another's.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyPrefix {
    prefix: String,
}

impl KeyPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        KeyPrefix {
            prefix: prefix.into(),
        }
    }

    /// The raw prefix, without separator.
    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }

    /// Build the backend key: `"{prefix}:{key}"`, or `key` unchanged when no
    /// prefix is configured. Pure, no I/O.
    pub fn apply(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}{}", self.prefix, SEPARATOR, key)
        }
    }

    /// Apply the prefix to a batch of keys.
    pub fn apply_all<S: AsRef<str>>(&self, keys: &[S]) -> Vec<String> {
        keys.iter().map(|k| self.apply(k.as_ref())).collect()
    }

    /// Recover the caller's key from a backend key.
    ///
    /// Returns `None` when `full` does not belong to this namespace.
    pub fn strip<'a>(&self, full: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(full);
        }
        full.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
    }

    /// Namespace marker used by backends to select every key under this
    /// prefix (`"{prefix}:"`), or empty when unprefixed.
    pub fn namespace(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}{}", self.prefix, SEPARATOR)
        }
    }
}
