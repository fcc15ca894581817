//! Collision checks for synthetic batches
//!
//! Each check counts warehouse rows that a synthetic batch would collide with.
//! Which checks run depends on which properties the manifest supplies.

use crate::manifest::PreValidationProperties;

/// Lower bound (exclusive) of the claim group id range reserved for
/// synthetic data.
pub const CLM_GRP_ID_END: i64 = -99_999_831_003;

const CLAIM_GROUP_TABLES: [&str; 7] = [
    "carrier_claims",
    "inpatient_claims",
    "outpatient_claims",
    "snf_claims",
    "dme_claims",
    "hha_claims",
    "hospice_claims",
];

const FI_DOC_TABLES: [&str; 5] = [
    "inpatient_claims",
    "outpatient_claims",
    "snf_claims",
    "hha_claims",
    "hospice_claims",
];

const MBI_DUPES_SQL: &str = "\
SELECT COUNT(*) FROM (
    SELECT COUNT(*) FROM (
        SELECT DISTINCT bene_id, mbi_num FROM public.beneficiaries_history
        WHERE bene_id < 0 AND mbi_num IS NOT NULL
        UNION
        SELECT DISTINCT bene_id, mbi_num FROM public.medicare_beneficiaryid_history
        WHERE bene_id < 0 AND mbi_num IS NOT NULL
    ) AS synthetic_mbis
    GROUP BY mbi_num
    HAVING COUNT(*) > 1
) AS dupes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bind {
    BigInt(i64),
    Text(String),
}

/// One counting query. The batch collides when the count is at least one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionCheck {
    pub name: String,
    pub sql: String,
    pub binds: Vec<Bind>,
}

impl CollisionCheck {
    fn new(name: impl Into<String>, sql: impl Into<String>, binds: Vec<Bind>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            binds,
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Checks to run for `props`, in execution order.
pub fn collision_checks(props: &PreValidationProperties) -> Vec<CollisionCheck> {
    let mut checks = Vec::new();

    if props.bene_id_start != 0 && props.bene_id_end != 0 {
        checks.push(CollisionCheck::new(
            "beneficiary_id_range",
            "SELECT COUNT(bene_id) FROM beneficiaries WHERE bene_id <= $1 AND bene_id > $2",
            vec![Bind::BigInt(props.bene_id_start), Bind::BigInt(props.bene_id_end)],
        ));
    }

    if props.carr_clm_cntl_num_start != 0 {
        checks.push(CollisionCheck::new(
            "carrier_claim_control_number",
            "SELECT COUNT(clm_id) FROM carrier_claims WHERE clm_id <= $1 AND carr_clm_cntl_num <= $2",
            vec![
                Bind::BigInt(props.clm_id_start),
                Bind::Text(props.carr_clm_cntl_num_start.to_string()),
            ],
        ));
    }

    if props.clm_grp_id_start != 0 {
        for table in CLAIM_GROUP_TABLES {
            checks.push(CollisionCheck::new(
                format!("claim_group_id:{}", table),
                format!(
                    "SELECT COUNT(clm_id) FROM {} WHERE clm_grp_id <= $1 AND clm_grp_id > $2",
                    table
                ),
                vec![Bind::BigInt(props.clm_grp_id_start), Bind::BigInt(CLM_GRP_ID_END)],
            ));
        }
    }

    if props.pde_id_start != 0 && props.clm_grp_id_start != 0 {
        checks.push(CollisionCheck::new(
            "part_d_event_id",
            "SELECT COUNT(pde_id) FROM partd_events \
             WHERE pde_id <= $1 AND clm_grp_id <= $2 AND clm_grp_id > $3",
            vec![
                Bind::BigInt(props.pde_id_start),
                Bind::BigInt(props.clm_grp_id_start),
                Bind::BigInt(CLM_GRP_ID_END),
            ],
        ));
    }

    if let (Some(hicn), Some(mbi)) = (present(&props.hicn_start), present(&props.mbi_start)) {
        checks.push(CollisionCheck::new(
            "hicn_or_mbi",
            "SELECT COUNT(bene_id) FROM beneficiaries WHERE (hicn_unhashed = $1 OR mbi_num = $2)",
            vec![Bind::Text(hicn.to_string()), Bind::Text(mbi.to_string())],
        ));
    }

    if let Some(doc_num) = present(&props.fi_doc_cntl_num_start) {
        for table in FI_DOC_TABLES {
            checks.push(CollisionCheck::new(
                format!("fi_document_control_number:{}", table),
                format!("SELECT COUNT(clm_id) FROM {} WHERE fi_doc_clm_cntl_num = $1", table),
                vec![Bind::Text(doc_num.to_string())],
            ));
        }
    }

    checks.push(CollisionCheck::new("duplicate_synthetic_mbi", MBI_DUPES_SQL, vec![]));

    checks
}
