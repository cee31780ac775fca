//! Artifact selection
//!
//! Filters a release's files down to the wheels that fit a [`Target`] and
//! picks the best one. Compatibility comes from the tags embedded in the
//! wheel filename: `name-version[-build]-python-abi-platform.whl`.

use wheelhouse_types::{ArtifactDescriptor, Target};

const EXACT_PLATFORM: u32 = 100;
const EXACT_INTERPRETER: u32 = 50;
const RUNTIME_FAMILY: u32 = 40;
const STABLE_ABI: u32 = 30;
const GENERIC: u32 = 20;

const ANY_TAG: &str = "any";
const STABLE_ABI_TAG: &str = "abi3";

/// Compatibility tags parsed from a wheel filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelTags {
    pub name: String,
    pub version: String,
    pub python: Vec<String>,
    pub abi: Vec<String>,
    pub platform: Vec<String>,
}

impl WheelTags {
    /// Parse a wheel filename; `None` if it does not follow the grammar
    pub fn parse(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".whl")?;
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() != 5 && parts.len() != 6 {
            return None;
        }
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        let n = parts.len();
        let tag_set = |field: &str| field.split('.').map(str::to_string).collect::<Vec<_>>();

        Some(Self {
            name: parts[0].to_string(),
            version: parts[1].to_string(),
            python: tag_set(parts[n - 3]),
            abi: tag_set(parts[n - 2]),
            platform: tag_set(parts[n - 1]),
        })
    }
}

/// `major.minor` of a runtime version string such as "3.11" or "3.11.4"
fn runtime(python_version: &str) -> Option<(u32, u32)> {
    let mut parts = python_version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// `cp37` -> (3, 7), `cp310` -> (3, 10)
fn cpython_version(tag: &str) -> Option<(u32, u32)> {
    let digits = tag.strip_prefix("cp")?;
    if digits.len() < 2 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (major, minor) = digits.split_at(1);
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Interpreter score of one python/abi tag pair, if compatible
fn interpreter_score(python: &str, abi: &str, runtime: Option<(u32, u32)>) -> Option<u32> {
    if let Some((major, minor)) = runtime {
        let compact = format!("{}{}", major, minor);

        if abi != STABLE_ABI_TAG && python == format!("cp{}", compact) {
            return Some(EXACT_INTERPRETER);
        }
        if python == format!("py{}", compact) {
            return Some(RUNTIME_FAMILY);
        }
        if abi == STABLE_ABI_TAG {
            if let Some((tag_major, tag_minor)) = cpython_version(python) {
                if tag_major == major && tag_minor <= minor {
                    return Some(STABLE_ABI);
                }
            }
        }
        if python == format!("py{}", major) {
            return Some(GENERIC);
        }
    }

    (python == "py").then_some(GENERIC)
}

/// Score of a candidate for `target`, `None` when it is not eligible
pub fn score(artifact: &ArtifactDescriptor, target: &Target) -> Option<u32> {
    if !artifact.is_wheel() {
        return None;
    }
    let tags = WheelTags::parse(&artifact.filename)?;

    let platform_bonus = if target.is_any_platform() {
        0
    } else if tags.platform.iter().any(|p| p == &target.platform) {
        EXACT_PLATFORM
    } else if tags.platform.iter().any(|p| p == ANY_TAG) {
        0
    } else {
        return None;
    };

    let runtime = runtime(&target.python_version);
    let interpreter = tags
        .python
        .iter()
        .flat_map(|python| {
            tags.abi
                .iter()
                .filter_map(move |abi| interpreter_score(python, abi, runtime))
        })
        .max()?;

    Some(platform_bonus + interpreter)
}

/// Pick the highest-scoring eligible wheel; the first one wins ties
pub fn select<'a>(
    candidates: &'a [ArtifactDescriptor],
    target: &Target,
) -> Option<&'a ArtifactDescriptor> {
    let mut best: Option<(&ArtifactDescriptor, u32)> = None;

    for candidate in candidates {
        let Some(points) = score(candidate, target) else {
            continue;
        };
        if best.map_or(true, |(_, top)| points > top) {
            best = Some((candidate, points));
        }
    }

    best.map(|(artifact, _)| artifact)
}
