//! Engine version arithmetic and feature gates.

use super::rpc::{CriuFeatures, CriuOpts, CriuVersion};
use crate::error::CriuError;

/// Oldest engine the orchestrator drives (3.0).
pub const CRIU_MIN_VERSION: i32 = 30000;

/// LSM profile and mount context options need 3.16.
pub const CRIU_LSM_VERSION: i32 = 31600;

/// Collapses a version reply into `major * 10000 + minor * 100 + sublevel`.
///
/// Git snapshots count as the next minor release, since they carry
/// everything from the last tag.
pub fn version_number(version: &CriuVersion) -> i32 {
    let mut number = version.major_number * 10000 + version.minor_number * 100;
    number += version.sublevel();
    if !version.gitid().is_empty() {
        number -= number % 100;
        number += 100;
    }
    number
}

/// Fails iff `version < min`.
pub fn compare_version(version: i32, min: i32) -> Result<(), CriuError> {
    if version < min {
        return Err(CriuError::VersionTooOld { version, min });
    }
    Ok(())
}

/// Rejects option combinations the given engine version cannot honour.
pub fn check_options(version: i32, opts: &CriuOpts) -> Result<(), CriuError> {
    compare_version(version, CRIU_MIN_VERSION).map_err(|e| CriuError::Incompatible {
        reason: e.to_string(),
    })?;

    let needs_lsm = !opts.lsm_profile().is_empty() || !opts.lsm_mount_context().is_empty();
    if needs_lsm && version < CRIU_LSM_VERSION {
        return Err(CriuError::Incompatible {
            reason: format!(
                "LSM options need CRIU {} or newer, found {}",
                CRIU_LSM_VERSION, version
            ),
        });
    }
    Ok(())
}

/// Names of the `wanted` features the engine reported as unsupported.
///
/// Only features set to `true` in `wanted` are considered; a feature the
/// engine leaves unset counts as missing.
pub fn missing_features(wanted: &CriuFeatures, reported: &CriuFeatures) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if wanted.mem_track() && !reported.mem_track() {
        missing.push("MemTrack");
    }
    if wanted.lazy_pages() && !reported.lazy_pages() {
        missing.push("LazyPages");
    }
    if wanted.pidfd_store() && !reported.pidfd_store() {
        missing.push("PidfdStore");
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(major: i32, minor: i32, sublevel: Option<i32>, gitid: Option<&str>) -> CriuVersion {
        CriuVersion {
            major_number: major,
            minor_number: minor,
            sublevel,
            gitid: gitid.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_release_version_number() {
        assert_eq!(version_number(&version(3, 19, None, None)), 31900);
        assert_eq!(version_number(&version(3, 17, Some(1), None)), 31701);
    }

    #[test]
    fn test_git_snapshot_rounds_up_minor() {
        assert_eq!(
            version_number(&version(3, 19, Some(1), Some("v3.19-12-gabc"))),
            32000
        );
        assert_eq!(version_number(&version(3, 19, None, Some("abc"))), 32000);
    }

    #[test]
    fn test_compare_version_is_inclusive() {
        assert!(compare_version(30000, 30000).is_ok());
        assert!(compare_version(31900, 30000).is_ok());
        let err = compare_version(21500, 30000).unwrap_err();
        assert!(matches!(err, CriuError::VersionTooOld { version: 21500, min: 30000 }));
    }

    #[test]
    fn test_lsm_options_gate() {
        let opts = CriuOpts {
            lsm_profile: Some("apparmor:unconfined".into()),
            ..Default::default()
        };
        let err = check_options(31500, &opts).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("compatibility check failed"));
        assert!(check_options(31600, &opts).is_ok());
        assert!(check_options(31500, &CriuOpts::default()).is_ok());
    }

    #[test]
    fn test_missing_features_only_checks_wanted() {
        let wanted = CriuFeatures {
            mem_track: Some(true),
            ..Default::default()
        };
        let reported = CriuFeatures {
            mem_track: Some(false),
            lazy_pages: Some(false),
            ..Default::default()
        };
        assert_eq!(missing_features(&wanted, &reported), vec!["MemTrack"]);
        assert!(missing_features(&CriuFeatures::default(), &reported).is_empty());
    }
}
