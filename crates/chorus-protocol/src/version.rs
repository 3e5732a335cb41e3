//! Protocol versioning for Chorus.
//!
//! Clients may announce the version they speak when connecting; the server
//! accepts any version sharing its major number.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version. Breaking envelope changes increment this.
    pub major: u8,
    /// Minor version. New event types increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Negotiate against a client-announced version string.
    ///
    /// A missing announcement selects the server version.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is malformed or incompatible.
    pub fn negotiate(client: Option<&str>) -> Result<Version, &'static str> {
        let Some(raw) = client else {
            return Ok(PROTOCOL_VERSION);
        };
        let requested: Version = raw.parse()?;
        if !PROTOCOL_VERSION.is_compatible_with(&requested) {
            return Err("Incompatible protocol version");
        }
        Ok(Version::new(
            PROTOCOL_VERSION.major,
            PROTOCOL_VERSION.minor.min(requested.minor),
        ))
    }
}

impl FromStr for Version {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        let major = major.trim().parse().map_err(|_| "Invalid major version")?;
        let minor = minor.trim().parse().map_err(|_| "Invalid minor version")?;
        Ok(Version::new(major, minor))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
