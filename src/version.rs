//! Companion server version strings such as `1.19-ws6`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::protocol::AdbError;

/// Suffix marking builds that speak the web companion protocol
const COMPANION_SUFFIX: &str = "ws";

/// Parsed companion version: dotted numeric parts plus an optional suffix
#[derive(Debug, Clone)]
pub struct ServerVersion {
    parts: Vec<u32>,
    suffix: String,
}

impl ServerVersion {
    pub fn parse(version: &str) -> Result<Self, AdbError> {
        version.parse()
    }

    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Whether this build speaks the companion protocol at all
    pub fn is_companion(&self) -> bool {
        self.parts.len() >= 2 && self.suffix_revision().is_some()
    }

    /// Same major.minor line and both speak the companion protocol.
    pub fn is_compatible_with(&self, other: &ServerVersion) -> bool {
        self.is_companion() && other.is_companion() && self.parts[..2] == other.parts[..2]
    }

    /// Strictly newer than `other`
    pub fn gt(&self, other: &ServerVersion) -> bool {
        self.cmp(other) == Ordering::Greater
    }

    /// Numeric revision in a `ws<N>` suffix
    fn suffix_revision(&self) -> Option<u32> {
        let rest = self.suffix.strip_prefix(COMPANION_SUFFIX)?;
        if rest.is_empty() {
            return Some(0);
        }
        rest.parse().ok()
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Missing trailing parts sort lower: 1.19 < 1.19.1
        self.parts
            .cmp(&other.parts)
            .then_with(|| match (self.suffix_revision(), other.suffix_revision()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => self.suffix.cmp(&other.suffix),
            })
    }
}

impl PartialEq for ServerVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ServerVersion {}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ServerVersion {
    type Err = AdbError;

    fn from_str(version: &str) -> Result<Self, AdbError> {
        let invalid = || AdbError::InvalidMessage(format!("Malformed server version: {:?}", version));

        let (main, suffix) = match version.split_once('-') {
            Some((main, suffix)) => (main, suffix),
            None => (version, ""),
        };
        if main.is_empty() || (version.contains('-') && suffix.is_empty()) {
            return Err(invalid());
        }

        let parts = main
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                part.parse::<u32>().map_err(|_| invalid())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            parts,
            suffix: suffix.to_string(),
        })
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let main = self
            .parts
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        if self.suffix.is_empty() {
            write!(f, "{}", main)
        } else {
            write!(f, "{}-{}", main, self.suffix)
        }
    }
}

/// `compatible("1.19-ws6", "1.19-ws7")`; false when either fails to parse.
pub fn compatible(a: &str, b: &str) -> bool {
    match (ServerVersion::parse(a), ServerVersion::parse(b)) {
        (Ok(a), Ok(b)) => a.is_compatible_with(&b),
        _ => false,
    }
}

/// `greater_than("1.20-ws1", "1.19-ws6")`
pub fn greater_than(a: &str, b: &str) -> Result<bool, AdbError> {
    Ok(ServerVersion::parse(a)?.gt(&ServerVersion::parse(b)?))
}
