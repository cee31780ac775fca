//! Release versions and version specifiers
//!
//! A practical subset of the Python packaging version scheme: epochs,
//! dotted releases, pre/post/dev segments and local labels, plus the
//! comparison operators used in requirement strings.

use crate::error::{WheelhouseError, WheelhouseResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Pre-release phase, ordered alpha < beta < rc
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
}

impl PreRelease {
    fn label(self) -> &'static str {
        match self {
            PreRelease::Alpha => "a",
            PreRelease::Beta => "b",
            PreRelease::Rc => "rc",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Segment {
    Pre(PreRelease),
    Post,
    Dev,
}

/// Longer spellings come first so prefixes don't shadow them
const SEGMENT_LABELS: &[(&str, Segment)] = &[
    ("alpha", Segment::Pre(PreRelease::Alpha)),
    ("a", Segment::Pre(PreRelease::Alpha)),
    ("beta", Segment::Pre(PreRelease::Beta)),
    ("b", Segment::Pre(PreRelease::Beta)),
    ("preview", Segment::Pre(PreRelease::Rc)),
    ("pre", Segment::Pre(PreRelease::Rc)),
    ("rc", Segment::Pre(PreRelease::Rc)),
    ("c", Segment::Pre(PreRelease::Rc)),
    ("post", Segment::Post),
    ("rev", Segment::Post),
    ("r", Segment::Post),
    ("dev", Segment::Dev),
];

/// A release version such as `2.31.0`, `1.0rc1` or `1!2.0.post3.dev1`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub epoch: u64,
    pub release: Vec<u64>,
    pub pre: Option<(PreRelease, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
    /// Local label after `+`; ignored for ordering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
}

impl Version {
    /// Parse a version string
    pub fn parse(input: &str) -> WheelhouseResult<Self> {
        let invalid = || WheelhouseError::InvalidVersion(input.to_string());

        let lowered = input.trim().to_ascii_lowercase();
        let s = lowered.strip_prefix('v').unwrap_or(&lowered);

        let (s, local) = match s.split_once('+') {
            Some((v, l)) if !l.is_empty() => (v, Some(l.to_string())),
            Some(_) => return Err(invalid()),
            None => (s, None),
        };

        let (epoch, rest) = match s.split_once('!') {
            Some((e, r)) => (e.parse().map_err(|_| invalid())?, r),
            None => (0, s),
        };

        let release_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let release_str = rest[..release_end].trim_end_matches('.');
        if release_str.is_empty() {
            return Err(invalid());
        }

        let release = release_str
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;

        let (pre, post, dev) = parse_segments(&rest[release_end..]).ok_or_else(invalid)?;

        Ok(Self {
            epoch,
            release,
            pre,
            post,
            dev,
            local,
        })
    }

    /// Pre-releases and dev releases
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    /// The release number at `index`, zero-padded
    pub fn release_at(&self, index: usize) -> u64 {
        self.release.get(index).copied().unwrap_or(0)
    }

    /// The same release without pre/post/dev/local segments
    pub fn base(&self) -> Version {
        Version {
            epoch: self.epoch,
            release: self.release.clone(),
            pre: None,
            post: None,
            dev: None,
            local: None,
        }
    }

    fn sort_key(&self) -> (u64, &[u64], (u8, u64), (u8, u64), (u8, u64)) {
        let mut release: &[u64] = &self.release;
        while let [head @ .., 0] = release {
            release = head;
        }

        // A bare dev release sorts before every pre-release of the same version
        let pre = match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => (0, 0),
            (Some((phase, n)), _, _) => (phase as u8 + 1, n),
            _ => (4, 0),
        };
        let post = self.post.map_or((0, 0), |n| (1, n));
        let dev = self.dev.map_or((1, 0), |n| (0, n));

        (self.epoch, release, pre, post, dev)
    }
}

fn parse_segments(mut s: &str) -> Option<(Option<(PreRelease, u64)>, Option<u64>, Option<u64>)> {
    let mut pre = None;
    let mut post = None;
    let mut dev = None;

    while !s.is_empty() {
        // Implicit post release: "1.0-1"
        if let Some(rest) = s.strip_prefix('-') {
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                if post.is_some() || dev.is_some() {
                    return None;
                }
                let (n, rest) = take_number(rest)?;
                post = Some(n);
                s = rest;
                continue;
            }
        }

        let trimmed = s.trim_start_matches(is_separator);
        let (segment, rest) = SEGMENT_LABELS
            .iter()
            .find_map(|(label, seg)| trimmed.strip_prefix(label).map(|r| (*seg, r)))?;
        let (n, rest) = take_number(rest.trim_start_matches(is_separator))?;

        match segment {
            Segment::Pre(phase) if pre.is_none() && post.is_none() && dev.is_none() => {
                pre = Some((phase, n))
            }
            Segment::Post if post.is_none() && dev.is_none() => post = Some(n),
            Segment::Dev if dev.is_none() => dev = Some(n),
            _ => return None,
        }
        s = rest;
    }

    Some((pre, post, dev))
}

fn is_separator(c: char) -> bool {
    matches!(c, '-' | '_' | '.')
}

/// Leading digits of `s`, 0 when there are none; `None` if they overflow
fn take_number(s: &str) -> Option<(u64, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let n = if end == 0 { 0 } else { s[..end].parse().ok()? };
    Some((n, &s[end..]))
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let release: Vec<String> = self.release.iter().map(|n| n.to_string()).collect();
        f.write_str(&release.join("."))?;
        if let Some((phase, n)) = self.pre {
            write!(f, "{}{}", phase.label(), n)?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{}", n)?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{}", n)?;
        }
        if let Some(local) = &self.local {
            write!(f, "+{}", local)?;
        }
        Ok(())
    }
}

// ============================================================================
// Specifiers
// ============================================================================

/// Comparison operator of a version specifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Compatible,
    ArbitraryEqual,
}

/// Checked in this order so `===` wins over `==` and `<=` over `<`
const OPERATORS: &[(&str, Operator)] = &[
    ("===", Operator::ArbitraryEqual),
    ("==", Operator::Equal),
    ("!=", Operator::NotEqual),
    ("~=", Operator::Compatible),
    ("<=", Operator::LessThanEqual),
    (">=", Operator::GreaterThanEqual),
    ("<", Operator::LessThan),
    (">", Operator::GreaterThan),
];

impl Operator {
    pub fn as_str(self) -> &'static str {
        OPERATORS
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(s, _)| *s)
            .unwrap_or("==")
    }
}

/// One clause such as `>=1.0` or `==2.*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpecifier {
    pub operator: Operator,
    pub version: Version,
    /// `==X.*` / `!=X.*` prefix form
    pub wildcard: bool,
    raw: String,
}

impl VersionSpecifier {
    pub fn parse(input: &str) -> WheelhouseResult<Self> {
        let s = input.trim();
        let (operator, rest) = OPERATORS
            .iter()
            .find_map(|(text, op)| s.strip_prefix(text).map(|r| (*op, r.trim())))
            .ok_or_else(|| WheelhouseError::InvalidVersion(format!("missing operator in '{}'", s)))?;

        if rest.is_empty() {
            return Err(WheelhouseError::InvalidVersion(format!(
                "missing version in '{}'",
                s
            )));
        }

        let (version_text, wildcard) = match rest.strip_suffix(".*") {
            Some(prefix) if matches!(operator, Operator::Equal | Operator::NotEqual) => {
                (prefix, true)
            }
            Some(_) => {
                return Err(WheelhouseError::InvalidVersion(format!(
                    "wildcard not allowed in '{}'",
                    s
                )))
            }
            None => (rest, false),
        };

        let version = match operator {
            // Arbitrary equality compares text, but keep a parsed form when possible
            Operator::ArbitraryEqual => {
                Version::parse(version_text).unwrap_or_else(|_| Version {
                    epoch: 0,
                    release: vec![0],
                    pre: None,
                    post: None,
                    dev: None,
                    local: Some(version_text.to_string()),
                })
            }
            _ => Version::parse(version_text)?,
        };

        if operator == Operator::Compatible && version.release.len() < 2 {
            return Err(WheelhouseError::InvalidVersion(format!(
                "'~=' needs at least two release numbers in '{}'",
                s
            )));
        }

        Ok(Self {
            operator,
            version,
            wildcard,
            raw: rest.to_string(),
        })
    }

    /// Whether `candidate` satisfies this clause
    pub fn contains(&self, candidate: &Version) -> bool {
        let spec = &self.version;
        match self.operator {
            Operator::Equal if self.wildcard => prefix_matches(candidate, spec, spec.release.len()),
            Operator::NotEqual if self.wildcard => {
                !prefix_matches(candidate, spec, spec.release.len())
            }
            Operator::Equal => candidate == spec,
            Operator::NotEqual => candidate != spec,
            Operator::LessThanEqual => candidate <= spec,
            Operator::GreaterThanEqual => candidate >= spec,
            // `<V` excludes pre-releases of V itself unless V is one
            Operator::LessThan => {
                candidate < spec
                    && (spec.is_prerelease()
                        || !candidate.is_prerelease()
                        || candidate.base() != spec.base())
            }
            // `>V` excludes post-releases of V itself unless V is one
            Operator::GreaterThan => {
                candidate > spec
                    && (spec.post.is_some()
                        || candidate.post.is_none()
                        || candidate.base() != spec.base())
            }
            Operator::Compatible => {
                candidate >= spec && prefix_matches(candidate, spec, spec.release.len() - 1)
            }
            Operator::ArbitraryEqual => candidate.to_string() == self.raw,
        }
    }
}

fn prefix_matches(candidate: &Version, spec: &Version, len: usize) -> bool {
    candidate.epoch == spec.epoch && (0..len).all(|i| candidate.release_at(i) == spec.release_at(i))
}

impl fmt::Display for VersionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.operator.as_str(), self.raw)
    }
}

/// Comma-separated clauses, all of which must hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSpecifiers(Vec<VersionSpecifier>);

impl VersionSpecifiers {
    pub fn parse(input: &str) -> WheelhouseResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::default());
        }
        input
            .split(',')
            .map(VersionSpecifier::parse)
            .collect::<WheelhouseResult<Vec<_>>>()
            .map(Self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionSpecifier> {
        self.0.iter()
    }

    pub fn contains(&self, candidate: &Version) -> bool {
        self.0.iter().all(|spec| spec.contains(candidate))
    }

    /// The constraint itself names a pre-release
    pub fn mentions_prerelease(&self) -> bool {
        self.0
            .iter()
            .any(|spec| spec.operator != Operator::NotEqual && spec.version.is_prerelease())
    }

    /// Pick the highest version satisfying every clause.
    ///
    /// Pre-releases are only chosen when the constraint names one or when
    /// no final release matches. Unparsable versions are ignored.
    pub fn select_best<'a, I>(&self, versions: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let matching: Vec<(Version, &'a str)> = versions
            .into_iter()
            .filter_map(|text| Version::parse(text).ok().map(|v| (v, text)))
            .filter(|(v, _)| self.contains(v))
            .collect();

        let best_final = matching
            .iter()
            .filter(|(v, _)| !v.is_prerelease())
            .max_by(|a, b| a.0.cmp(&b.0));

        let best = if self.mentions_prerelease() || best_final.is_none() {
            matching.iter().max_by(|a, b| a.0.cmp(&b.0))
        } else {
            best_final
        };

        best.map(|(_, text)| *text)
    }
}

impl fmt::Display for VersionSpecifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_release_segments() {
        let version = v("1!2.0.3rc1.post2.dev4+local.7");
        assert_eq!(version.epoch, 1);
        assert_eq!(version.release, vec![2, 0, 3]);
        assert_eq!(version.pre, Some((PreRelease::Rc, 1)));
        assert_eq!(version.post, Some(2));
        assert_eq!(version.dev, Some(4));
        assert_eq!(version.local.as_deref(), Some("local.7"));

        assert_eq!(v("1.0-1").post, Some(1));
        assert_eq!(v("2.0.0-alpha.1").pre, Some((PreRelease::Alpha, 1)));
        assert_eq!(v("v1.2").release, vec![1, 2]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("latest").is_err());
        assert!(Version::parse("1.0.zeta").is_err());
        assert!(Version::parse("1..0").is_err());
        assert!(Version::parse("1.0a99999999999999999999").is_err());
        assert!(Version::parse("1.0.post99999999999999999999").is_err());
        assert!(Version::parse("1.0-99999999999999999999").is_err());
        assert_eq!(v("1.0a").pre, Some((PreRelease::Alpha, 0)));
    }

    #[test]
    fn test_ordering() {
        let ordered = [
            "1.0.dev0", "1.0a1", "1.0a2.dev1", "1.0a2", "1.0b1", "1.0rc1", "1.0", "1.0.post1.dev0",
            "1.0.post1", "1.1", "1!0.1",
        ];
        for pair in ordered.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        }
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("1.0+abc"), v("1.0"));
        assert!(v("1.10") > v("1.9"));
    }

    #[test]
    fn test_specifier_operators() {
        let specs = VersionSpecifiers::parse(">=1.0,<2.0").unwrap();
        assert!(specs.contains(&v("1.0")));
        assert!(specs.contains(&v("1.9.9")));
        assert!(!specs.contains(&v("2.0")));
        assert!(!specs.contains(&v("0.9")));
        // pre-release of the upper bound is excluded
        assert!(!specs.contains(&v("2.0rc1")));

        let compat = VersionSpecifier::parse("~=1.4.2").unwrap();
        assert!(compat.contains(&v("1.4.5")));
        assert!(!compat.contains(&v("1.5.0")));

        let wildcard = VersionSpecifier::parse("==2.*").unwrap();
        assert!(wildcard.contains(&v("2.31.0")));
        assert!(!wildcard.contains(&v("3.0")));

        let excluded = VersionSpecifier::parse("!=1.5.*").unwrap();
        assert!(!excluded.contains(&v("1.5.2")));
        assert!(excluded.contains(&v("1.6")));

        let greater = VersionSpecifier::parse(">1.0").unwrap();
        assert!(!greater.contains(&v("1.0.post1")));
        assert!(greater.contains(&v("1.0.1")));
    }

    #[test]
    fn test_specifier_errors() {
        assert!(VersionSpecifier::parse("1.0").is_err());
        assert!(VersionSpecifier::parse(">=").is_err());
        assert!(VersionSpecifier::parse("~=1").is_err());
        assert!(VersionSpecifier::parse(">=1.*").is_err());
    }

    #[test]
    fn test_select_best_prefers_final_releases() {
        let releases = ["1.0", "1.5", "2.0", "2.1rc1", "not-a-version"];

        let any = VersionSpecifiers::default();
        assert_eq!(any.select_best(releases), Some("2.0"));

        let capped = VersionSpecifiers::parse("<2.0").unwrap();
        assert_eq!(capped.select_best(releases), Some("1.5"));

        let pre = VersionSpecifiers::parse(">=2.1rc1").unwrap();
        assert_eq!(pre.select_best(releases), Some("2.1rc1"));

        let none = VersionSpecifiers::parse(">=5").unwrap();
        assert_eq!(none.select_best(releases), None);
    }

    #[test]
    fn test_select_best_falls_back_to_prerelease() {
        let releases = ["0.9", "1.0b2"];
        let specs = VersionSpecifiers::parse(">=1.0b1").unwrap();
        assert_eq!(specs.select_best(releases), Some("1.0b2"));

        let only_pre = VersionSpecifiers::parse(">0.9").unwrap();
        assert_eq!(only_pre.select_best(releases), Some("1.0b2"));
    }
}
