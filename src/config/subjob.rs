//! Subjob descriptors: the `subjobs` section of the job input.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use super::{de, ConfigError, JobConfig};
use crate::pipeline::types::{CollectionTask, SelectionMode};
use crate::storage::StorageLocator;

/// Contents of `vf_input/config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobInput {
    pub config: JobConfig,
    #[serde(default)]
    pub subjobs: BTreeMap<String, SubjobConfig>,
}

impl JobInput {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// One subjob: the collections it processes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubjobConfig {
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionEntry>,
}

/// One collection entry as written by the job generator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionEntry {
    #[serde(default)]
    pub s3_download_path: Option<String>,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub sharedfs_path: Option<PathBuf>,
    /// `standard`, `named` or `prescreen_mode`.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub ligands: Vec<String>,
    #[serde(default, deserialize_with = "de::optional_number")]
    pub prescreen_ligands_per_tranche: Option<u64>,
    #[serde(default, deserialize_with = "de::number")]
    pub dockings: u64,
}

impl CollectionEntry {
    /// Converts the entry into a download task for `collection_key`.
    ///
    /// `default_bucket` is used when the entry names an object path without
    /// its own bucket.
    pub fn to_task(
        &self,
        collection_key: &str,
        default_bucket: &str,
    ) -> Result<CollectionTask, ConfigError> {
        let locator = if let Some(path) = &self.s3_download_path {
            StorageLocator::Object {
                bucket: self
                    .s3_bucket
                    .clone()
                    .unwrap_or_else(|| default_bucket.to_string()),
                key: path.clone(),
            }
        } else if let Some(path) = &self.sharedfs_path {
            StorageLocator::SharedFs(path.clone())
        } else {
            return Err(ConfigError::InvalidValue {
                key: format!("subjobs.collections.{}", collection_key),
                message: "neither s3_download_path nor sharedfs_path is set".to_string(),
            });
        };

        let selection = match self.mode.as_deref() {
            Some("prescreen_mode") | Some("prescreen") => {
                let cutoff = self.prescreen_ligands_per_tranche.ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: format!("subjobs.collections.{}", collection_key),
                        message: "prescreen mode requires prescreen_ligands_per_tranche"
                            .to_string(),
                    }
                })?;
                SelectionMode::Prescreen { cutoff }
            }
            Some("named") => SelectionMode::Named(self.ligands.clone()),
            _ => SelectionMode::Full,
        };

        Ok(CollectionTask {
            collection_key: collection_key.to_string(),
            locator,
            selection,
            expected_dockings: self.dockings,
        })
    }
}

impl SubjobConfig {
    /// Download tasks for every collection, in key order.
    pub fn tasks(&self, default_bucket: &str) -> Result<Vec<CollectionTask>, ConfigError> {
        self.collections
            .iter()
            .map(|(key, entry)| entry.to_task(key, default_bucket))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_modes() {
        let entries: BTreeMap<String, CollectionEntry> = serde_json::from_str(
            r#"{
                "AAAA_1": {"sharedfs_path": "/lib/AAAA/1.tar.gz", "dockings": "8"},
                "AABB_2": {"s3_download_path": "lib/AABB/2.tar.gz", "mode": "named",
                           "ligands": ["Z100"], "dockings": 2},
                "CCDD_3": {"s3_download_path": "lib/CCDD/3.tar.gz", "s3_bucket": "other",
                           "mode": "prescreen_mode", "prescreen_ligands_per_tranche": "5"}
            }"#,
        )
        .unwrap();
        let subjob = SubjobConfig {
            collections: entries,
        };

        let tasks = subjob.tasks("screens").unwrap();
        assert_eq!(tasks.len(), 3);

        assert_eq!(tasks[0].collection_key, "AAAA_1");
        assert_eq!(tasks[0].selection, SelectionMode::Full);
        assert_eq!(tasks[0].expected_dockings, 8);
        assert!(matches!(tasks[0].locator, StorageLocator::SharedFs(_)));

        assert_eq!(tasks[1].selection, SelectionMode::Named(vec!["Z100".to_string()]));
        assert_eq!(
            tasks[1].locator,
            StorageLocator::Object {
                bucket: "screens".to_string(),
                key: "lib/AABB/2.tar.gz".to_string(),
            }
        );

        assert_eq!(tasks[2].selection, SelectionMode::Prescreen { cutoff: 5 });
        assert!(matches!(
            &tasks[2].locator,
            StorageLocator::Object { bucket, .. } if bucket == "other"
        ));
    }

    #[test]
    fn test_entry_without_location_is_rejected() {
        let entry = CollectionEntry::default();
        let err = entry.to_task("AAAA_1", "screens").unwrap_err();
        assert!(err.to_string().contains("AAAA_1"));
    }
}
