//! PD version gate.

use semver::Version;
use tracing::warn;

use crate::controller::error::{Error, Result};
use crate::crd::MODE_MICRO_SERVICE;

/// Floating tags that always track the newest release.
const FLOATING_TAGS: [&str; 2] = ["nightly", "latest"];

/// Whether the PD version is 4.0 or newer.
///
/// Floating tags count as new enough. Any other tag that is not a version
/// is a configuration error.
pub fn cluster_version_at_least_4(version: &str, mode: &str) -> Result<bool> {
    if mode == MODE_MICRO_SERVICE && version == "nightly" {
        return Ok(true);
    }
    if FLOATING_TAGS.contains(&version) {
        warn!(version = %version, "PD version is a floating tag, assuming >= v4");
        return Ok(true);
    }
    let parsed = parse_lenient(version).map_err(|source| Error::Version {
        version: version.to_string(),
        source,
    })?;
    Ok(parsed.major >= 4)
}

/// Parse `v4`, `v4.0` and `v4.0.1-rc` style tags.
fn parse_lenient(version: &str) -> std::result::Result<Version, semver::Error> {
    let trimmed = version.trim().trim_start_matches(['v', 'V']);
    if let Ok(v) = Version::parse(trimmed) {
        return Ok(v);
    }
    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded)
}
