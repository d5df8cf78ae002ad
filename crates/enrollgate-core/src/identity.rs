use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Opaque id of the chat session a request arrived from.
pub type CallerId = i64;

fn identity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9._-]+$").expect("identity pattern is valid"))
}

/// A directory account name, normalized to lowercase and restricted to
/// `[a-z0-9._-]`.
///
/// Holding an `Identity` means the shape check has already passed, so the
/// value is safe to embed in directory filters (after escaping) and in the
/// issuer's shell script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Normalize raw message text (trim + lowercase) and validate its shape.
    ///
    /// Returns `None` for empty input or any character outside the allowed set.
    pub fn parse(raw: &str) -> Option<Self> {
        let candidate = raw.trim().to_lowercase();
        if candidate.is_empty() || !identity_re().is_match(&candidate) {
            return None;
        }
        Some(Self(candidate))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
