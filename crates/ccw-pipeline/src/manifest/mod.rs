//! Manifest model
//!
//! A manifest describes one batch of RIF files dropped into the bucket: the
//! descriptor object plus the data files it lists. Where a batch lives is given
//! by its [`DataSetLocation`]; the regular and synthetic streams each have a
//! pending and a completed prefix.

pub mod filter;
pub mod key;
mod xml;

use ccw_common::types::RifFileType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{PipelineError, PipelineResult};

pub use filter::FileTypeFilter;
pub use key::{ManifestKey, ManifestKeyPattern};

pub const S3_PREFIX_PENDING_DATA_SETS: &str = "Incoming";
pub const S3_PREFIX_COMPLETED_DATA_SETS: &str = "Done";
pub const S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS: &str = "Synthetic/Incoming";
pub const S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS: &str = "Synthetic/Done";

/// Pending/completed prefix pair for one stream of batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSetLocation {
    pub pending_prefix: String,
    pub completed_prefix: String,
}

impl DataSetLocation {
    pub fn regular() -> Self {
        Self {
            pending_prefix: S3_PREFIX_PENDING_DATA_SETS.to_string(),
            completed_prefix: S3_PREFIX_COMPLETED_DATA_SETS.to_string(),
        }
    }

    pub fn synthetic() -> Self {
        Self {
            pending_prefix: S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS.to_string(),
            completed_prefix: S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS.to_string(),
        }
    }
}

/// Id ranges and identifiers a synthetic batch is about to insert.
///
/// Zero numeric fields and absent strings mean "not supplied".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreValidationProperties {
    pub bene_id_start: i64,
    pub bene_id_end: i64,
    pub carr_clm_cntl_num_start: i64,
    pub clm_grp_id_start: i64,
    pub clm_id_start: i64,
    pub pde_id_start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hicn_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mbi_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fi_doc_cntl_num_start: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetManifestEntry {
    pub name: String,
    pub file_type: RifFileType,
}

/// A parsed manifest together with where it lives in the bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSetManifest {
    key: ManifestKey,
    location: DataSetLocation,
    synthetic: bool,
    entries: Vec<DataSetManifestEntry>,
    pre_validation_properties: Option<PreValidationProperties>,
}

impl DataSetManifest {
    pub fn new(
        key: ManifestKey,
        location: DataSetLocation,
        synthetic: bool,
        entries: Vec<DataSetManifestEntry>,
    ) -> Self {
        Self {
            key,
            location,
            synthetic,
            entries,
            pre_validation_properties: None,
        }
    }

    pub fn with_pre_validation_properties(mut self, props: PreValidationProperties) -> Self {
        self.pre_validation_properties = Some(props);
        self
    }

    /// Decode a descriptor fetched from `key`.
    ///
    /// The timestamp and sequence id inside the document must agree with the
    /// object key, and entry names must be unique.
    pub fn from_xml(
        key: ManifestKey,
        location: DataSetLocation,
        bytes: &[u8],
    ) -> PipelineResult<Self> {
        let object_key = key.object_key();
        let doc = xml::ManifestDocument::from_bytes(bytes)
            .map_err(|reason| PipelineError::manifest_parse(&object_key, reason))?;

        let declared = ManifestKey::new(key.prefix(), &doc.timestamp, doc.sequence_id)?;
        if declared.timestamp() != key.timestamp() || declared.sequence_id() != key.sequence_id() {
            return Err(PipelineError::manifest_parse(
                &object_key,
                format!(
                    "descriptor declares timestamp {} sequence {}",
                    doc.timestamp, doc.sequence_id
                ),
            ));
        }

        if doc.entries.is_empty() {
            return Err(PipelineError::manifest_parse(&object_key, "no entries"));
        }

        let mut seen = HashSet::new();
        for entry in &doc.entries {
            if entry.name.is_empty() || entry.name.contains('/') {
                return Err(PipelineError::manifest_parse(
                    &object_key,
                    format!("invalid entry name '{}'", entry.name),
                ));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(PipelineError::manifest_parse(
                    &object_key,
                    format!("duplicate entry '{}'", entry.name),
                ));
            }
        }

        Ok(Self {
            key,
            location,
            synthetic: doc.synthetic_data,
            entries: doc
                .entries
                .into_iter()
                .map(|e| DataSetManifestEntry {
                    name: e.name,
                    file_type: e.file_type,
                })
                .collect(),
            pre_validation_properties: doc.pre_validation_properties,
        })
    }

    pub fn to_xml(&self) -> PipelineResult<String> {
        let doc = xml::ManifestDocument {
            timestamp: self.key.timestamp_text().to_string(),
            sequence_id: self.key.sequence_id(),
            synthetic_data: self.synthetic,
            entries: self
                .entries
                .iter()
                .map(|e| xml::EntryElement {
                    name: e.name.clone(),
                    file_type: e.file_type,
                })
                .collect(),
            pre_validation_properties: self.pre_validation_properties.clone(),
        };

        doc.to_xml()
            .map_err(|reason| PipelineError::manifest_parse(self.manifest_key(), reason))
    }

    pub fn key(&self) -> &ManifestKey {
        &self.key
    }

    /// Descriptor object key, also the identity used in the status store.
    pub fn manifest_key(&self) -> String {
        self.key.object_key()
    }

    pub fn location(&self) -> &DataSetLocation {
        &self.location
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn entries(&self) -> &[DataSetManifestEntry] {
        &self.entries
    }

    pub fn pre_validation_properties(&self) -> Option<&PreValidationProperties> {
        self.pre_validation_properties.as_ref()
    }

    pub fn entry_key(&self, entry: &DataSetManifestEntry) -> String {
        self.key.entry_key(&entry.name)
    }

    /// Pending and completed object keys for the descriptor and every entry,
    /// data files first and the descriptor last.
    pub fn relocation_pairs(&self) -> Vec<(String, String)> {
        let done = self.key.with_prefix(&self.location.completed_prefix);
        let mut pairs: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|e| (self.key.entry_key(&e.name), done.entry_key(&e.name)))
            .collect();
        pairs.push((self.key.object_key(), done.object_key()));
        pairs
    }
}
