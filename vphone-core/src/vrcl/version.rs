//! VRCL API versions and notification gating.

use std::fmt;
use std::str::FromStr;

use crate::error::VpError;

/// `major.minor`, ordered major first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
}

impl ApiVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Baseline every peer speaks; assumed until negotiation completes.
    pub const BASELINE: ApiVersion = ApiVersion::new(1, 0);

    /// Version this build implements.
    pub const CURRENT: ApiVersion = ApiVersion::new(1, 3);

    /// Both sides use the lower of the two versions.
    pub fn negotiate(self, peer: ApiVersion) -> ApiVersion {
        self.min(peer)
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::BASELINE
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = VpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| VpError::UnsupportedVersion(s.to_string()))
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

// ── Feature gates ────────────────────────────────────────────────

/// Minimum negotiated version for each notification family.
pub mod gates {
    use super::ApiVersion;

    pub const CALL_EVENTS: ApiVersion = ApiVersion::new(1, 0);
    pub const TEXT_MESSAGES: ApiVersion = ApiVersion::new(1, 0);
    pub const DTMF: ApiVersion = ApiVersion::new(1, 1);
    pub const BRIDGE: ApiVersion = ApiVersion::new(1, 2);
    pub const VIDEO_PRIVACY: ApiVersion = ApiVersion::new(1, 3);
}
