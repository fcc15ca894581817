//! XML form of manifest descriptors
//!
//! ```xml
//! <dataSetManifest timestamp="2024-03-01T10:00:00Z" sequenceId="0" syntheticData="false">
//!   <entry name="beneficiaries.rif" type="BENEFICIARY"/>
//!   <entry name="carrier.rif" type="CARRIER"/>
//! </dataSetManifest>
//! ```

use ccw_common::types::RifFileType;
use serde::{Deserialize, Serialize};

use super::PreValidationProperties;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "dataSetManifest")]
pub(crate) struct ManifestDocument {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,

    #[serde(rename = "@sequenceId")]
    pub sequence_id: u32,

    #[serde(rename = "@syntheticData", default)]
    pub synthetic_data: bool,

    #[serde(rename = "entry", default)]
    pub entries: Vec<EntryElement>,

    #[serde(
        rename = "preValidationProperties",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pre_validation_properties: Option<PreValidationProperties>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EntryElement {
    #[serde(rename = "@name")]
    pub name: String,

    #[serde(rename = "@type")]
    pub file_type: RifFileType,
}

impl ManifestDocument {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(bytes).map_err(|e| format!("not UTF-8: {}", e))?;
        quick_xml::de::from_str(text).map_err(|e| e.to_string())
    }

    pub fn to_xml(&self) -> Result<String, String> {
        quick_xml::se::to_string(self).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<dataSetManifest timestamp="2024-03-01T10:00:00Z" sequenceId="1" syntheticData="true">
  <entry name="beneficiaries.rif" type="BENEFICIARY"/>
  <entry name="carrier.rif" type="CARRIER"/>
  <preValidationProperties>
    <bene_id_start>-1000</bene_id_start>
    <bene_id_end>-2000</bene_id_end>
    <hicn_start>T00000000</hicn_start>
  </preValidationProperties>
</dataSetManifest>"#;

        let doc = ManifestDocument::from_bytes(xml.as_bytes()).unwrap();
        assert_eq!(doc.timestamp, "2024-03-01T10:00:00Z");
        assert_eq!(doc.sequence_id, 1);
        assert!(doc.synthetic_data);
        assert_eq!(doc.entries.len(), 2);
        assert_eq!(doc.entries[1].file_type, RifFileType::Carrier);

        let props = doc.pre_validation_properties.unwrap();
        assert_eq!(props.bene_id_start, -1000);
        assert_eq!(props.bene_id_end, -2000);
        assert_eq!(props.clm_grp_id_start, 0);
        assert_eq!(props.hicn_start.as_deref(), Some("T00000000"));
        assert_eq!(props.mbi_start, None);
    }

    #[test]
    fn test_synthetic_flag_defaults_to_false() {
        let xml = r#"<dataSetManifest timestamp="2024-03-01T10:00:00Z" sequenceId="0">
  <entry name="pde.rif" type="PDE"/>
</dataSetManifest>"#;

        let doc = ManifestDocument::from_bytes(xml.as_bytes()).unwrap();
        assert!(!doc.synthetic_data);
        assert!(doc.pre_validation_properties.is_none());
    }

    #[test]
    fn test_unknown_entry_type_is_rejected() {
        let xml = r#"<dataSetManifest timestamp="2024-03-01T10:00:00Z" sequenceId="0">
  <entry name="x.rif" type="NOT_A_TYPE"/>
</dataSetManifest>"#;

        assert!(ManifestDocument::from_bytes(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_written_document_reads_back() {
        let doc = ManifestDocument {
            timestamp: "2024-03-01T10:00:00Z".to_string(),
            sequence_id: 4,
            synthetic_data: false,
            entries: vec![EntryElement {
                name: "inpatient.rif".to_string(),
                file_type: RifFileType::Inpatient,
            }],
            pre_validation_properties: None,
        };

        let xml = doc.to_xml().unwrap();
        assert!(xml.starts_with("<dataSetManifest"));
        assert!(xml.contains(r#"type="INPATIENT""#));
        assert_eq!(ManifestDocument::from_bytes(xml.as_bytes()).unwrap(), doc);
    }
}
