//! Requirement strings
//!
//! `name[extras] specifiers ; marker`, e.g.
//! `"foo>=1.0,<2.0; sys_platform=='win32'"`.

mod marker;
mod version;

pub use marker::*;
pub use version::*;

use crate::error::{WheelhouseError, WheelhouseResult};
use std::fmt;
use std::str::FromStr;

/// Canonical form of a package name: lowercase, with runs of `-`, `_`
/// and `.` collapsed to a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut pending_separator = false;

    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            pending_separator = true;
            continue;
        }
        if pending_separator && !normalized.is_empty() {
            normalized.push('-');
        }
        pending_separator = false;
        normalized.push(c.to_ascii_lowercase());
    }

    normalized
}

/// A parsed requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequirement {
    /// Name as written
    pub name: String,
    pub extras: Vec<String>,
    pub specifiers: VersionSpecifiers,
    /// Direct reference (`name @ url`)
    pub url: Option<String>,
    pub marker: Option<MarkerTree>,
}

impl PackageRequirement {
    pub fn parse(input: &str) -> WheelhouseResult<Self> {
        let invalid = |reason: &str| WheelhouseError::InvalidRequirement {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (head, marker_text) = split_marker(input);

        let head = head.trim();
        let name_end = head
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(head.len());
        let name = &head[..name_end];

        if name.is_empty() {
            return Err(invalid("missing package name"));
        }
        let bounded_by_alnum = name.starts_with(|c: char| c.is_ascii_alphanumeric())
            && name.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !bounded_by_alnum {
            return Err(invalid("name must start and end with a letter or digit"));
        }

        let mut rest = head[name_end..].trim_start();

        let mut extras = Vec::new();
        if let Some(after) = rest.strip_prefix('[') {
            let (inside, tail) = after.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            extras = inside
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
            rest = tail.trim_start();
        }

        let mut url = None;
        let specifiers = if let Some(reference) = rest.strip_prefix('@') {
            let reference = reference.trim();
            if reference.is_empty() {
                return Err(invalid("missing URL after '@'"));
            }
            url = Some(reference.to_string());
            VersionSpecifiers::default()
        } else if let Some(inner) = rest.strip_prefix('(') {
            let inner = inner.strip_suffix(')').ok_or_else(|| invalid("unclosed '('"))?;
            VersionSpecifiers::parse(inner).map_err(|e| invalid(&e.to_string()))?
        } else {
            VersionSpecifiers::parse(rest).map_err(|e| invalid(&e.to_string()))?
        };

        let marker = match marker_text.map(str::trim) {
            Some("") => return Err(invalid("empty marker after ';'")),
            Some(text) => Some(MarkerTree::parse(text)?),
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            extras,
            specifiers,
            url,
            marker,
        })
    }

    /// Normalized name, the identity used for deduplication
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }

    /// Whether the requirement applies in `env`; unconditional ones always do
    pub fn applies_to(&self, env: &MarkerEnvironment) -> bool {
        self.marker.as_ref().map_or(true, |m| m.evaluate(env))
    }
}

/// Split off the marker. With a URL reference the separator needs
/// whitespace before it, since `;` may be part of the URL.
fn split_marker(input: &str) -> (&str, Option<&str>) {
    let is_url = input.contains('@');
    let position = if is_url {
        input.find(" ;").map(|i| (i, i + 2))
    } else {
        input.find(';').map(|i| (i, i + 1))
    };

    match position {
        Some((head_end, marker_start)) => (&input[..head_end], Some(&input[marker_start..])),
        None => (input, None),
    }
}

impl FromStr for PackageRequirement {
    type Err = WheelhouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PackageRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(url) = &self.url {
            write!(f, " @ {}", url)?;
        } else {
            write!(f, "{}", self.specifiers)?;
        }
        Ok(())
    }
}

/// Requirement lines of a requirements file.
///
/// Blank lines, comments and option lines (`-r`, `--index-url`, ...) are
/// skipped.
pub fn parse_requirements_file(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| match line.find(" #") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .map(str::to_string)
        .collect()
}
