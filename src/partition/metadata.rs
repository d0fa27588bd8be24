use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File holding a partition's [`PartitionMetadata`], inside both its data and
/// temp directories.
pub const METADATA_FILE_NAME: &str = ".cache_metadata.json";

/// Expiry of the credential a partition belongs to.
///
/// A partition without this file never expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    #[serde(with = "rfc3339_seconds")]
    pub expires_at: DateTime<Utc>,
}

mod rfc3339_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

impl PartitionMetadata {
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self { expires_at }
    }

    /// Read the metadata file in `partition_dir`.
    pub fn read(partition_dir: &Path) -> Result<Self> {
        let raw = std::fs::read(partition_dir.join(METADATA_FILE_NAME))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Write the metadata file into every directory in `dirs`, creating them
    /// as needed. Every directory is attempted even when an earlier one fails.
    pub fn write_to(&self, dirs: &[&Path]) -> Result<()> {
        let serialized = serde_json::to_vec(self)?;
        let mut failures = Vec::new();
        for dir in dirs {
            let dest = dir.join(METADATA_FILE_NAME);
            let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&dest, &serialized));
            if let Err(e) = written {
                failures.push(format!("{}: {}", dest.display(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::storage_with_context(
                "failed to write partition metadata",
                ErrorContext::new()
                    .with_details(failures.join("; "))
                    .with_source("partition_metadata"),
            ))
        }
    }
}

/// Record `expires_at` for a new partition in its data and temp directories.
/// Nothing is written for credentials without an expiry.
pub fn write_partition_metadata(
    base_path: &Path,
    temp_dir: &Path,
    expires_at: Option<DateTime<Utc>>,
) -> Result<()> {
    match expires_at {
        Some(expires_at) => PartitionMetadata::new(expires_at).write_to(&[base_path, temp_dir]),
        None => Ok(()),
    }
}
