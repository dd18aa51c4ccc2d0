//! Capability grammar
//!
//! Up to three `>`-separated levels; each level at most 100 characters, 200
//! total; the first level is slug-safe (`[A-Za-z0-9_-]`) because it becomes
//! the URI category, later levels may be any printable text without `>`.

use crate::errors::{RegistryError, Result};

pub const MAX_LEVELS: usize = 3;
pub const MAX_LEVEL_LEN: usize = 100;
pub const MAX_TOTAL_LEN: usize = 200;

/// A validated capability path plus the pieces the URI needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    /// Canonical `>`-joined node, e.g. `finance>accounting>reconciliation`.
    pub node: String,
    /// First level; appears in the agent URI.
    pub category: String,
}

/// Normalise (trim, lowercase, `/` -> `>`) and validate a raw capability.
pub fn parse_capability(raw: &str) -> Result<Capability> {
    let normalised = raw.trim().to_lowercase().replace('/', ">");
    if normalised.is_empty() {
        return Err(RegistryError::Validation("capability must not be empty".into()));
    }
    if normalised.len() > MAX_TOTAL_LEN {
        return Err(RegistryError::Validation(format!(
            "capability exceeds {MAX_TOTAL_LEN} characters"
        )));
    }

    let levels: Vec<&str> = normalised.split('>').map(str::trim).collect();
    if levels.len() > MAX_LEVELS {
        return Err(RegistryError::Validation(format!(
            "capability has more than {MAX_LEVELS} levels"
        )));
    }
    for (i, level) in levels.iter().enumerate() {
        if level.is_empty() {
            return Err(RegistryError::Validation(
                "capability levels must not be empty".into(),
            ));
        }
        if level.len() > MAX_LEVEL_LEN {
            return Err(RegistryError::Validation(format!(
                "capability level {} exceeds {MAX_LEVEL_LEN} characters",
                i + 1
            )));
        }
        if i == 0 {
            if !level
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(RegistryError::Validation(
                    "top-level capability may only contain [a-z0-9_-]".into(),
                ));
            }
        } else if level.chars().any(|c| c.is_control()) {
            return Err(RegistryError::Validation(
                "capability levels must be printable".into(),
            ));
        }
    }

    let node = levels.join(">");
    let category = levels[0].to_string();

    Ok(Capability { node, category })
}

/// Whether a stored capability node falls under the queried prefix: an agent
/// stored as `finance>accounting>reconciliation` matches a query of
/// `finance`.
pub fn node_matches_prefix(stored: &str, query: &str) -> bool {
    stored == query || stored.starts_with(&format!("{query}>"))
}

/// Reduce free text to a URI-safe slug; used for the optional primary-skill
/// URI segment a registrant may supply.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = false;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c);
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}
