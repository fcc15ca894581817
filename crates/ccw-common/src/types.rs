//! Record types shared by the pipeline components

use serde::{Deserialize, Serialize};

use crate::error::CcwError;

/// The kinds of RIF files an extract can contain.
///
/// The textual form (`BENEFICIARY`, `CARRIER`, ...) is what appears in manifest
/// descriptors, configuration and the status tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RifFileType {
    Beneficiary,
    BeneficiaryHistory,
    MedicareBeneficiaryIdHistory,
    Pde,
    Carrier,
    Inpatient,
    Outpatient,
    Hha,
    Hospice,
    Snf,
    Dme,
}

impl RifFileType {
    pub const ALL: [RifFileType; 11] = [
        RifFileType::Beneficiary,
        RifFileType::BeneficiaryHistory,
        RifFileType::MedicareBeneficiaryIdHistory,
        RifFileType::Pde,
        RifFileType::Carrier,
        RifFileType::Inpatient,
        RifFileType::Outpatient,
        RifFileType::Hha,
        RifFileType::Hospice,
        RifFileType::Snf,
        RifFileType::Dme,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RifFileType::Beneficiary => "BENEFICIARY",
            RifFileType::BeneficiaryHistory => "BENEFICIARY_HISTORY",
            RifFileType::MedicareBeneficiaryIdHistory => "MEDICARE_BENEFICIARY_ID_HISTORY",
            RifFileType::Pde => "PDE",
            RifFileType::Carrier => "CARRIER",
            RifFileType::Inpatient => "INPATIENT",
            RifFileType::Outpatient => "OUTPATIENT",
            RifFileType::Hha => "HHA",
            RifFileType::Hospice => "HOSPICE",
            RifFileType::Snf => "SNF",
            RifFileType::Dme => "DME",
        }
    }

    /// Whether records of this type belong to a claims table rather than
    /// beneficiary tables.
    pub fn is_claim(&self) -> bool {
        !matches!(
            self,
            RifFileType::Beneficiary
                | RifFileType::BeneficiaryHistory
                | RifFileType::MedicareBeneficiaryIdHistory
        )
    }
}

impl std::fmt::Display for RifFileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RifFileType {
    type Err = CcwError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        RifFileType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| CcwError::Parse(format!("Unknown RIF file type: {}", s)))
    }
}
