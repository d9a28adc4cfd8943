//! Durability configuration: WAL archive window and write throttling.
//!
//! Options are plain structs with `Default` values and can be loaded from TOML:
//!
//! ```toml
//! [wal]
//! max_wal_archive_size = 1073741824   # -1 or "unlimited" disables the window
//! min_wal_archive_size = 536870912
//! serializer_version = 2
//!
//! [throttle]
//! policy = "speed_based"
//! cp_buffer_fill_threshold = 0.6666
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::wal::codec::SerializerVersion;

/// Default maximum archive size: 1 GiB.
pub const DEFAULT_MAX_WAL_ARCHIVE_SIZE: u64 = 1024 * 1024 * 1024;

/// Errors raised while loading or validating options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read durability config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for these options.
    #[error("failed to parse durability config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// An inline TOML document is not valid for these options.
    #[error("failed to parse durability config: {0}")]
    ParseInline(#[from] toml::de::Error),
    /// Values parsed but are inconsistent.
    #[error("invalid durability config: {0}")]
    Invalid(String),
}

/// WAL archive settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalOptions {
    /// Archive size the cleaner truncates down to. `None` uses half of the maximum.
    pub min_wal_archive_size: Option<u64>,
    /// Archive size that forces old reservations to be released. `None` is unlimited.
    #[serde(deserialize_with = "archive_limit")]
    pub max_wal_archive_size: Option<u64>,
    /// Record serializer version used for new segments.
    pub serializer_version: SerializerVersion,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            min_wal_archive_size: None,
            max_wal_archive_size: Some(DEFAULT_MAX_WAL_ARCHIVE_SIZE),
            serializer_version: SerializerVersion::V2,
        }
    }
}

impl WalOptions {
    /// Minimum archive size with the default applied.
    pub fn effective_min_wal_archive_size(&self) -> u64 {
        self.min_wal_archive_size
            .unwrap_or_else(|| self.max_wal_archive_size.map_or(0, |max| max / 2))
    }
}

/// Which throttling policy guards page memory during checkpoints.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlingPolicy {
    /// Never throttle.
    Disabled,
    /// Dirty-ratio threshold that grows with checkpoint progress.
    TargetRatio,
    /// Throttle only pages in checkpoint when the checkpoint buffer fills up.
    CheckpointBufferOnly,
    /// Checkpoint buffer protection plus speed-based clean pages protection.
    #[default]
    SpeedBased,
}

/// Write throttle tuning.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleOptions {
    /// Active policy.
    pub policy: ThrottlingPolicy,
    /// Checkpoint buffer occupancy above which in-checkpoint pages are throttled.
    pub cp_buffer_fill_threshold: f64,
    /// Throttle weight above which the pressure warning is logged.
    pub warn_threshold: f64,
    /// Minimum spacing of pressure warnings.
    pub warn_min_delay_ms: u64,
    /// First backoff delay in nanoseconds.
    pub starting_park_nanos: u64,
    /// Backoff growth per call.
    pub backoff_ratio: f64,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            policy: ThrottlingPolicy::SpeedBased,
            cp_buffer_fill_threshold: 2.0 / 3.0,
            warn_threshold: 0.2,
            warn_min_delay_ms: 10_000,
            starting_park_nanos: 4_000,
            backoff_ratio: 1.05,
        }
    }
}

impl ThrottleOptions {
    /// [`warn_min_delay_ms`](Self::warn_min_delay_ms) as a duration.
    pub fn warn_min_delay(&self) -> Duration {
        Duration::from_millis(self.warn_min_delay_ms)
    }
}

/// All durability options.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DurabilityOptions {
    /// `[wal]` table.
    pub wal: WalOptions,
    /// `[throttle]` table.
    pub throttle: ThrottleOptions,
}

impl DurabilityOptions {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(contents)?;
        options.validate()?;
        Ok(options)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let throttle = &self.throttle;
        if !(throttle.backoff_ratio > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "backoff_ratio must be greater than 1, got {}",
                throttle.backoff_ratio
            )));
        }
        for (name, value) in [
            ("cp_buffer_fill_threshold", throttle.cp_buffer_fill_threshold),
            ("warn_threshold", throttle.warn_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.wal.min_wal_archive_size, self.wal.max_wal_archive_size) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "min_wal_archive_size ({min}) exceeds max_wal_archive_size ({max})"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArchiveLimit {
    Bytes(i64),
    Keyword(String),
}

fn archive_limit<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match RawArchiveLimit::deserialize(deserializer)? {
        RawArchiveLimit::Bytes(bytes) if bytes < 0 => Ok(None),
        RawArchiveLimit::Bytes(bytes) => Ok(Some(bytes.unsigned_abs())),
        RawArchiveLimit::Keyword(word) if word.eq_ignore_ascii_case("unlimited") => Ok(None),
        RawArchiveLimit::Keyword(word) => Err(D::Error::custom(format!(
            "invalid wal archive size '{word}', expected bytes or \"unlimited\""
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<(), ConfigError> {
        let options = DurabilityOptions::default();
        options.validate()?;
        assert_eq!(
            options.wal.effective_min_wal_archive_size(),
            DEFAULT_MAX_WAL_ARCHIVE_SIZE / 2
        );
        assert_eq!(options.throttle.policy, ThrottlingPolicy::SpeedBased);
        Ok(())
    }

    #[test]
    fn parses_full_document() -> Result<(), ConfigError> {
        let options = DurabilityOptions::from_toml_str(
            r#"
            [wal]
            max_wal_archive_size = 1000
            min_wal_archive_size = 400
            serializer_version = 1

            [throttle]
            policy = "target_ratio"
            warn_min_delay_ms = 5
            "#,
        )?;
        assert_eq!(options.wal.max_wal_archive_size, Some(1000));
        assert_eq!(options.wal.effective_min_wal_archive_size(), 400);
        assert_eq!(options.wal.serializer_version, SerializerVersion::V1);
        assert_eq!(options.throttle.policy, ThrottlingPolicy::TargetRatio);
        assert_eq!(options.throttle.warn_min_delay(), Duration::from_millis(5));
        assert_eq!(options.throttle.backoff_ratio, 1.05);
        Ok(())
    }

    #[test]
    fn unlimited_archive_spellings() -> Result<(), ConfigError> {
        for doc in ["[wal]\nmax_wal_archive_size = -1", "[wal]\nmax_wal_archive_size = \"unlimited\""] {
            let options = DurabilityOptions::from_toml_str(doc)?;
            assert_eq!(options.wal.max_wal_archive_size, None);
            assert_eq!(options.wal.effective_min_wal_archive_size(), 0);
        }
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_values() {
        let err = DurabilityOptions::from_toml_str(
            "[wal]\nmax_wal_archive_size = 10\nmin_wal_archive_size = 20",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = DurabilityOptions::from_toml_str("[throttle]\nbackoff_ratio = 1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = DurabilityOptions::from_toml_str("[wal]\nserializer_version = 7").unwrap_err();
        assert!(matches!(err, ConfigError::ParseInline(_)));

        let err = DurabilityOptions::from_toml_str("[throttle]\npolicy = \"sometimes\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseInline(_)));
    }

    #[test]
    fn loads_from_file() -> Result<(), ConfigError> {
        let dir = tempfile::tempdir().map_err(|err| ConfigError::Invalid(err.to_string()))?;
        let path = dir.path().join("durability.toml");
        fs::write(&path, "[throttle]\npolicy = \"checkpoint_buffer_only\"\n")
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        let options = DurabilityOptions::from_path(&path)?;
        assert_eq!(options.throttle.policy, ThrottlingPolicy::CheckpointBufferOnly);

        fs::write(&path, "[throttle]\nunknown_knob = 1\n").map_err(|err| ConfigError::Invalid(err.to_string()))?;
        let err = DurabilityOptions::from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        Ok(())
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = DurabilityOptions::from_path(Path::new("/nonexistent/walden.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
