use std::cmp::Ordering;
use std::fmt;

use anyhow::Context;

use crate::error::BrokerError;

/// A deployable software version.
///
/// Release versions are calendar-style (`2026.1.29`), so ordering is numeric
/// per component rather than lexicographic. Strict semver strings, including
/// pre-release tags, keep semver precedence.
#[derive(Clone, Debug)]
pub struct SoftwareVersion {
    raw: String,
    parsed: semver::Version,
}

impl SoftwareVersion {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let trimmed = raw.trim();
        let body = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        anyhow::ensure!(!body.is_empty(), "version must be non-empty");

        let parsed = match semver::Version::parse(body) {
            Ok(parsed) => parsed,
            Err(_) => parse_numeric(body).with_context(|| format!("parse version {raw:?}"))?,
        };
        Ok(Self {
            raw: trimmed.to_string(),
            parsed,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_numeric(body: &str) -> anyhow::Result<semver::Version> {
    let components: Vec<&str> = body.split('.').collect();
    anyhow::ensure!(
        components.len() <= 3,
        "expected at most three dotted components"
    );
    let mut numbers = [0u64; 3];
    for (slot, component) in numbers.iter_mut().zip(&components) {
        *slot = component
            .parse::<u64>()
            .with_context(|| format!("component {component:?} is not a number"))?;
    }
    Ok(semver::Version::new(numbers[0], numbers[1], numbers[2]))
}

impl PartialEq for SoftwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parsed == other.parsed
    }
}

impl Eq for SoftwareVersion {}

impl PartialOrd for SoftwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SoftwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp(&other.parsed)
    }
}

impl fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Security floor for deployable versions: anything older is refused.
#[derive(Clone, Debug)]
pub struct VersionPolicy {
    floor: SoftwareVersion,
}

impl VersionPolicy {
    pub fn new(floor: SoftwareVersion) -> Self {
        Self { floor }
    }

    pub fn floor(&self) -> &SoftwareVersion {
        &self.floor
    }

    pub fn check(&self, requested: &str) -> Result<SoftwareVersion, BrokerError> {
        let version = SoftwareVersion::parse(requested)
            .map_err(|err| BrokerError::BadRequest(format!("{err:#}")))?;
        if version < self.floor {
            return Err(BrokerError::VersionRejected {
                requested: version.to_string(),
                floor: self.floor.to_string(),
            });
        }
        Ok(version)
    }
}
