//! Which RIF file types this deployment loads

use ccw_common::types::RifFileType;
use std::collections::BTreeSet;

use super::{DataSetManifest, DataSetManifestEntry};

/// Allow/deny list over [`RifFileType`].
///
/// With no allow list every type is allowed unless denied. A manifest is
/// eligible when at least one of its entries is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTypeFilter {
    allowed: Option<BTreeSet<RifFileType>>,
    denied: BTreeSet<RifFileType>,
}

impl FileTypeFilter {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new(
        allowed: Option<impl IntoIterator<Item = RifFileType>>,
        denied: impl IntoIterator<Item = RifFileType>,
    ) -> Self {
        Self {
            allowed: allowed.map(|types| types.into_iter().collect()),
            denied: denied.into_iter().collect(),
        }
    }

    pub fn accepts(&self, file_type: RifFileType) -> bool {
        if self.denied.contains(&file_type) {
            return false;
        }
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&file_type))
    }

    pub fn accepts_entry(&self, entry: &DataSetManifestEntry) -> bool {
        self.accepts(entry.file_type)
    }

    pub fn accepts_manifest(&self, manifest: &DataSetManifest) -> bool {
        manifest.entries().iter().any(|e| self.accepts_entry(e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{DataSetLocation, ManifestKey};

    fn manifest(types: &[RifFileType]) -> DataSetManifest {
        DataSetManifest::new(
            ManifestKey::new("Incoming", "2024-01-01T00:00:00Z", 0).unwrap(),
            DataSetLocation::regular(),
            false,
            types
                .iter()
                .enumerate()
                .map(|(i, t)| DataSetManifestEntry {
                    name: format!("{}.rif", i),
                    file_type: *t,
                })
                .collect(),
        )
    }

    #[test]
    fn test_allow_all() {
        let filter = FileTypeFilter::allow_all();
        assert!(RifFileType::ALL.iter().all(|t| filter.accepts(*t)));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let filter = FileTypeFilter::new(
            Some([RifFileType::Carrier, RifFileType::Pde]),
            [RifFileType::Pde],
        );
        assert!(filter.accepts(RifFileType::Carrier));
        assert!(!filter.accepts(RifFileType::Pde));
        assert!(!filter.accepts(RifFileType::Beneficiary));
    }

    #[test]
    fn test_manifest_needs_one_accepted_entry() {
        let filter = FileTypeFilter::new(None::<Vec<RifFileType>>, [RifFileType::Beneficiary]);
        assert!(!filter.accepts_manifest(&manifest(&[RifFileType::Beneficiary])));
        assert!(filter.accepts_manifest(&manifest(&[
            RifFileType::Beneficiary,
            RifFileType::Dme
        ])));
    }
}
