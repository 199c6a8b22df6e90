//! Clinical/claims bundle model
//!
//! Typed resources extracted from pages (Patient, Condition, Encounter,
//! DiagnosticReport, Claim), the bundle collections they travel in, and the
//! deduplication keys the merge engine works with.
//!
//! Dedup keys decide when two resources describe the same real-world entity:
//! - Patient: (family name, birth date)
//! - Condition: ICD-10 code
//! - Claim: hash of its first line item
//! - DiagnosticReport: (code, effective date-time)
//! - Encounter: id or period

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: String,
    /// Reference to the patient this diagnosis belongs to
    #[serde(default)]
    pub patient_id: Option<String>,
    /// ICD-10 diagnosis code
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub onset_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encounter {
    pub id: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub period_start: Option<String>,
    #[serde(default)]
    pub period_end: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub id: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub effective_date_time: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimLineItem {
    #[serde(default)]
    pub service_code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub service_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub line_items: Vec<ClaimLineItem>,
}

/// The per-page / per-document bundle of typed collections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBundle {
    #[serde(default)]
    pub patients: Vec<Patient>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub encounters: Vec<Encounter>,
    #[serde(default)]
    pub diagnostic_reports: Vec<DiagnosticReport>,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

impl ResourceBundle {
    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
            && self.conditions.is_empty()
            && self.encounters.is_empty()
            && self.diagnostic_reports.is_empty()
            && self.claims.is_empty()
    }

    /// Flatten into typed entries, in collection order
    pub fn entries(&self) -> Vec<Resource> {
        let mut out = Vec::new();
        out.extend(self.patients.iter().cloned().map(Resource::Patient));
        out.extend(self.conditions.iter().cloned().map(Resource::Condition));
        out.extend(self.encounters.iter().cloned().map(Resource::Encounter));
        out.extend(
            self.diagnostic_reports
                .iter()
                .cloned()
                .map(Resource::DiagnosticReport),
        );
        out.extend(self.claims.iter().cloned().map(Resource::Claim));
        out
    }
}

/// A typed resource, tagged for flat bundle entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource_type")]
pub enum Resource {
    Patient(Patient),
    Condition(Condition),
    Encounter(Encounter),
    DiagnosticReport(DiagnosticReport),
    Claim(Claim),
}

impl Resource {
    pub fn id(&self) -> &str {
        match self {
            Resource::Patient(r) => &r.id,
            Resource::Condition(r) => &r.id,
            Resource::Encounter(r) => &r.id,
            Resource::DiagnosticReport(r) => &r.id,
            Resource::Claim(r) => &r.id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Resource::Patient(_) => "Patient",
            Resource::Condition(_) => "Condition",
            Resource::Encounter(_) => "Encounter",
            Resource::DiagnosticReport(_) => "DiagnosticReport",
            Resource::Claim(_) => "Claim",
        }
    }

    /// Synthetic stable URI derived from type and id
    pub fn stable_uri(&self) -> String {
        format!("urn:casetrace:{}:{}", self.type_name().to_lowercase(), self.id())
    }
}

/// An entry of the flat case-level bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub full_url: String,
    pub resource: Resource,
}

/// The case-level merged output: a flat list of typed entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseBundle {
    pub entries: Vec<BundleEntry>,
}

// ============================================================================
// Dedup keys
// ============================================================================

/// Patient key: (family name, birth date), case-insensitive on the name.
/// Patients carrying neither field fall back to their id.
pub fn patient_key(p: &Patient) -> String {
    match (&p.family_name, &p.birth_date) {
        (None, None) => format!("id:{}", p.id),
        (family, birth) => format!(
            "{}|{}",
            family.as_deref().unwrap_or("").trim().to_lowercase(),
            birth.as_deref().unwrap_or("").trim()
        ),
    }
}

/// Condition key: the diagnosis code, falling back to the id when uncoded
pub fn condition_key(c: &Condition) -> String {
    match c.code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => code.to_uppercase(),
        _ => format!("id:{}", c.id),
    }
}

/// Claim key: SHA-256 over the serialized first line item
pub fn claim_key(c: &Claim) -> String {
    match c.line_items.first() {
        Some(item) => {
            let serialized = serde_json::to_string(item).unwrap_or_default();
            let digest = Sha256::digest(serialized.as_bytes());
            hex::encode(digest)
        }
        None => format!("id:{}", c.id),
    }
}

/// DiagnosticReport key: (code, effective date-time)
pub fn report_key(r: &DiagnosticReport) -> String {
    format!(
        "{}|{}",
        r.code.as_deref().unwrap_or("").trim().to_uppercase(),
        r.effective_date_time.as_deref().unwrap_or("").trim()
    )
}

/// Encounter key: id, or the period when the id is synthetic-empty
pub fn encounter_key(e: &Encounter) -> String {
    if !e.id.trim().is_empty() {
        return e.id.trim().to_string();
    }
    format!(
        "{}|{}",
        e.period_start.as_deref().unwrap_or(""),
        e.period_end.as_deref().unwrap_or("")
    )
}

// ============================================================================
// ICD-10 validation
// ============================================================================

fn icd10_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-TV-Z][0-9][0-9A-Z](\.[0-9A-Z]{1,4})?$").expect("valid ICD-10 pattern")
    })
}

/// Syntactic ICD-10 code check (category + optional subcategory)
pub fn is_valid_icd10(code: &str) -> bool {
    icd10_regex().is_match(code.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient(family: Option<&str>, birth: Option<&str>) -> Patient {
        Patient {
            id: "p-1".to_string(),
            family_name: family.map(Into::into),
            given_name: None,
            birth_date: birth.map(Into::into),
            gender: None,
        }
    }

    #[test]
    fn test_patient_key_is_case_insensitive_on_name() {
        let a = patient(Some("Nguyen"), Some("1975-03-02"));
        let b = patient(Some("NGUYEN"), Some("1975-03-02"));
        assert_eq!(patient_key(&a), patient_key(&b));
    }

    #[test]
    fn test_patient_without_identity_falls_back_to_id() {
        let a = patient(None, None);
        assert_eq!(patient_key(&a), "id:p-1");
    }

    #[test]
    fn test_condition_key_uses_code() {
        let c = Condition {
            id: "c-1".to_string(),
            patient_id: None,
            code: Some("e11.9".to_string()),
            description: None,
            onset_date: None,
        };
        assert_eq!(condition_key(&c), "E11.9");
    }

    #[test]
    fn test_claim_key_hashes_first_line_item() {
        let item = ClaimLineItem {
            service_code: Some("99213".to_string()),
            description: Some("Office visit".to_string()),
            amount: Some(125.0),
            service_date: Some("2024-01-15".to_string()),
        };
        let a = Claim {
            id: "claim-1".to_string(),
            patient_id: None,
            provider: None,
            total_amount: Some(125.0),
            line_items: vec![item.clone()],
        };
        let b = Claim {
            id: "claim-2".to_string(),
            patient_id: None,
            provider: Some("Different Provider".to_string()),
            total_amount: Some(300.0),
            line_items: vec![item],
        };
        // Same first line item: same identity, regardless of other fields
        assert_eq!(claim_key(&a), claim_key(&b));
    }

    #[test]
    fn test_encounter_key_prefers_id_over_period() {
        let e = Encounter {
            id: "enc-1".to_string(),
            patient_id: None,
            class: None,
            period_start: Some("2024-01-01".to_string()),
            period_end: Some("2024-01-02".to_string()),
            provider: None,
        };
        assert_eq!(encounter_key(&e), "enc-1");

        let anonymous = Encounter { id: "  ".to_string(), ..e };
        assert_eq!(encounter_key(&anonymous), "2024-01-01|2024-01-02");
    }

    #[test]
    fn test_icd10_validation() {
        assert!(is_valid_icd10("E11.9"));
        assert!(is_valid_icd10("S72.001A"));
        assert!(is_valid_icd10("Z99"));
        assert!(!is_valid_icd10("11.9"));
        assert!(!is_valid_icd10("EE1"));
        assert!(!is_valid_icd10(""));
    }

    #[test]
    fn test_stable_uri() {
        let r = Resource::Condition(Condition {
            id: "c-9".to_string(),
            patient_id: None,
            code: Some("I10".to_string()),
            description: None,
            onset_date: None,
        });
        assert_eq!(r.stable_uri(), "urn:casetrace:condition:c-9");
    }

    #[test]
    fn test_bundle_json_round_trip() {
        let bundle = ResourceBundle {
            patients: vec![patient(Some("Okafor"), Some("1988-11-23"))],
            conditions: vec![],
            encounters: vec![],
            diagnostic_reports: vec![],
            claims: vec![],
        };
        let json = serde_json::to_value(&bundle).unwrap();
        let parsed: ResourceBundle = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn test_empty_collections_deserialize_when_missing() {
        let parsed: ResourceBundle = serde_json::from_str(r#"{"patients": []}"#).unwrap();
        assert!(parsed.is_empty());
    }
}
