// node version parsing and capability checks

use anyhow::{Context, anyhow};

/// First Kubo release with `pin ls --stream`
/// (<https://github.com/ipfs/kubo/blob/master/CHANGELOG.md#050-2020-04-28>).
pub const STREAMING_PIN_LS_VERSION: semver::Version = semver::Version::new(0, 5, 0);

/// Parses a version string as reported by a node's `version` endpoint.
///
/// Accepts a leading `v` and short forms such as `0.5`, which are padded with zeros.
///
/// # Errors
///
/// Returns an error if the string is not a version at all.
pub fn parse_node_version(raw: &str) -> anyhow::Result<semver::Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if let Ok(version) = semver::Version::parse(trimmed) {
        return Ok(version);
    }
    // pad "0.5" / "0.5-dev" into "0.5.0" / "0.5.0-dev"
    let (core, suffix) = match trimmed.find(['-', '+']) {
        Some(pos) => trimmed.split_at(pos),
        None => (trimmed, ""),
    };
    let components = core.split('.').count();
    if components == 0 || components > 3 {
        return Err(anyhow!("invalid node version {:?}", raw));
    }
    let padded = format!("{}{}{}", core, ".0".repeat(3 - components), suffix);
    semver::Version::parse(&padded).with_context(|| format!("invalid node version {raw:?}"))
}

/// Whether a node of `version` can stream its pin set instead of returning it in one response.
#[must_use]
pub fn has_streaming_pin_listing(version: &semver::Version) -> bool {
    *version >= STREAMING_PIN_LS_VERSION
}
