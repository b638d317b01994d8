//! Reconciliation version file contract
//!
//! Each worker keeps `<remoteDir>/.version`, a UTF-8 file holding exactly the
//! hex-encoded aggregate SHA-256 of the coordinator's codebase snapshot, with
//! no trailing newline. An absent, empty or unreadable file reads as
//! [`NONE_SENTINEL`].

use std::fmt;

use crate::command::shell_quote;
use crate::error::ProtocolError;

/// Name of the version file under the worker's remote directory
pub const VERSION_FILE: &str = ".version";

/// Printed by the read command when the version file is missing or unreadable
pub const NONE_SENTINEL: &str = "<none>";

/// Length of a hex-encoded SHA-256 digest
const HEX_DIGEST_LEN: usize = 64;

/// What a worker reported as its installed version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionStamp {
    /// No usable version file
    Missing,
    /// A well-formed aggregate hash
    Hash(String),
    /// Something else (stale marker, truncated write, ...)
    Unrecognized(String),
}

impl VersionStamp {
    /// Interpret the stdout of [`read_command`]
    pub fn parse(output: &str) -> Self {
        let trimmed = output.trim();
        if trimmed.is_empty() || trimmed == NONE_SENTINEL {
            return VersionStamp::Missing;
        }
        if is_hex_digest(trimmed) {
            VersionStamp::Hash(trimmed.to_ascii_lowercase())
        } else {
            VersionStamp::Unrecognized(trimmed.to_string())
        }
    }

    /// Whether this stamp equals the given aggregate hash
    pub fn matches(&self, aggregate: &str) -> bool {
        matches!(self, VersionStamp::Hash(h) if h.eq_ignore_ascii_case(aggregate))
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionStamp::Missing => f.write_str(NONE_SENTINEL),
            VersionStamp::Hash(h) => f.write_str(h),
            VersionStamp::Unrecognized(s) => write!(f, "{:?}", s),
        }
    }
}

/// Remote path of the version file for a worker directory
pub fn version_path(remote_dir: &str) -> String {
    format!("{}/{}", remote_dir.trim_end_matches('/'), VERSION_FILE)
}

/// Shell command printing the version file, or the sentinel when it is unusable
pub fn read_command(remote_dir: &str) -> String {
    format!(
        "cat {} 2>/dev/null || printf '%s' {}",
        shell_quote(&version_path(remote_dir)),
        shell_quote(NONE_SENTINEL)
    )
}

/// File body to write for an aggregate hash
pub fn file_contents(aggregate: &str) -> Result<Vec<u8>, ProtocolError> {
    if !is_hex_digest(aggregate) {
        return Err(ProtocolError::MalformedVersion(aggregate.to_string()));
    }
    Ok(aggregate.to_ascii_lowercase().into_bytes())
}

fn is_hex_digest(s: &str) -> bool {
    s.len() == HEX_DIGEST_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_parse_missing() {
        assert_eq!(VersionStamp::parse(""), VersionStamp::Missing);
        assert_eq!(VersionStamp::parse("<none>"), VersionStamp::Missing);
        assert_eq!(VersionStamp::parse("  \n"), VersionStamp::Missing);
    }

    #[test]
    fn test_parse_hash() {
        let stamp = VersionStamp::parse(DIGEST);
        assert!(stamp.matches(DIGEST));
        assert!(stamp.matches(&DIGEST.to_uppercase()));
    }

    #[test]
    fn test_parse_stale() {
        let stamp = VersionStamp::parse("stale");
        assert_eq!(stamp, VersionStamp::Unrecognized("stale".to_string()));
        assert!(!stamp.matches(DIGEST));
    }

    #[test]
    fn test_file_contents_has_no_newline() {
        let body = file_contents(DIGEST).unwrap();
        assert_eq!(body.len(), 64);
        assert!(!body.ends_with(b"\n"));
        assert!(file_contents("stale").is_err());
    }

    #[test]
    fn test_read_command() {
        assert_eq!(
            read_command("/srv/bt/"),
            "cat /srv/bt/.version 2>/dev/null || printf '%s' '<none>'"
        );
    }
}
