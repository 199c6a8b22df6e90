//! Bundle merge engine
//!
//! Two scopes, same first-seen-wins policy:
//! - Document scope: per-page bundles merge into one document bundle, with
//!   entity-level dedup keys and patient-reference rewriting.
//! - Case scope: per-document bundles merge into a flat case bundle, keyed
//!   by (resource type, resource id).
//!
//! Pages are iterated in page order and documents in insertion order, so the
//! result is deterministic regardless of the order jobs happened to finish.

use casetrace_common::bundle::{
    claim_key, condition_key, encounter_key, patient_key, report_key, BundleEntry, CaseBundle,
    Resource, ResourceBundle,
};
use casetrace_common::errors::{AppError, Result};
use casetrace_common::queue::{Job, JobOptions, JobProcessor, JobStore, QUEUE_DOCUMENT_MERGE};
use casetrace_common::Repository;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Payload of a document-merge job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeJob {
    pub document_id: Uuid,
    pub case_id: Uuid,
}

// ============================================================================
// Document-scope merge (pure)
// ============================================================================

/// Merge per-page bundles into one document bundle.
///
/// Pages are sorted by page number first, so the same set of bundles always
/// produces the same result whatever order they arrive in. Within the sorted
/// sequence, the first resource holding a dedup key wins; later duplicates
/// are discarded whole, not merged field by field. Every cross-referencing
/// resource is rewritten to point at the resolved patient.
pub fn merge_page_bundles(pages: &[(i32, ResourceBundle)]) -> ResourceBundle {
    let mut ordered: Vec<&(i32, ResourceBundle)> = pages.iter().collect();
    ordered.sort_by_key(|(page_number, _)| *page_number);

    let mut merged = ResourceBundle::default();

    // Pass 1: patients. Track which id each duplicate resolved to.
    let mut patient_ids: HashMap<String, String> = HashMap::new(); // key -> kept id
    let mut resolved: HashMap<String, String> = HashMap::new(); // any seen id -> kept id

    for (_, bundle) in &ordered {
        for patient in &bundle.patients {
            let key = patient_key(patient);
            match patient_ids.get(&key) {
                Some(kept_id) => {
                    resolved.insert(patient.id.clone(), kept_id.clone());
                }
                None => {
                    patient_ids.insert(key, patient.id.clone());
                    resolved.insert(patient.id.clone(), patient.id.clone());
                    merged.patients.push(patient.clone());
                }
            }
        }
    }

    let primary_patient = merged.patients.first().map(|p| p.id.clone());
    let resolve = |reference: &Option<String>| -> Option<String> {
        reference
            .as_ref()
            .and_then(|id| resolved.get(id).cloned())
            .or_else(|| primary_patient.clone())
    };

    // Pass 2: cross-referencing resources, first seen wins per key.
    let mut seen = HashSet::new();
    for (_, bundle) in &ordered {
        for condition in &bundle.conditions {
            if seen.insert(format!("condition:{}", condition_key(condition))) {
                let mut condition = condition.clone();
                condition.patient_id = resolve(&condition.patient_id);
                merged.conditions.push(condition);
            }
        }
        for encounter in &bundle.encounters {
            if seen.insert(format!("encounter:{}", encounter_key(encounter))) {
                let mut encounter = encounter.clone();
                encounter.patient_id = resolve(&encounter.patient_id);
                merged.encounters.push(encounter);
            }
        }
        for report in &bundle.diagnostic_reports {
            if seen.insert(format!("report:{}", report_key(report))) {
                let mut report = report.clone();
                report.patient_id = resolve(&report.patient_id);
                merged.diagnostic_reports.push(report);
            }
        }
        for claim in &bundle.claims {
            if seen.insert(format!("claim:{}", claim_key(claim))) {
                let mut claim = claim.clone();
                claim.patient_id = resolve(&claim.patient_id);
                merged.claims.push(claim);
            }
        }
    }

    merged
}

// ============================================================================
// Case-scope merge (pure)
// ============================================================================

/// Merge per-document bundles into the flat case bundle.
///
/// Documents must be passed in insertion order. Dedup key is
/// (resource type, resource id); resources without an id are dropped. Each
/// kept entry is tagged with its synthetic stable URI.
pub fn merge_document_bundles(documents: &[ResourceBundle]) -> CaseBundle {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut entries = Vec::new();

    for bundle in documents {
        for resource in bundle.entries() {
            let id = resource.id().trim();
            if id.is_empty() {
                debug!(resource_type = resource.type_name(), "Dropping resource without id");
                continue;
            }
            let key = (resource.type_name().to_string(), id.to_string());
            if seen.insert(key) {
                entries.push(BundleEntry {
                    full_url: resource.stable_uri(),
                    resource,
                });
            }
        }
    }

    CaseBundle { entries }
}

// ============================================================================
// Readiness check
// ============================================================================

/// Re-evaluate a document's pending work; when every page is resolved and
/// structured, enqueue the document merge. The merge job is dedup-keyed per
/// document, so concurrent completions cannot double-enqueue it.
pub async fn maybe_enqueue_document_merge(
    repository: &Repository,
    store: &Arc<dyn JobStore>,
    document_id: Uuid,
    case_id: Uuid,
) -> Result<bool> {
    let document = repository
        .find_document(document_id)
        .await?
        .ok_or_else(|| AppError::RecordNotFound {
            entity: "document",
            id: document_id.to_string(),
        })?;

    if document.is_terminal() {
        return Ok(false);
    }

    let pages = repository.pages_for_document(document_id).await?;
    let Some(first) = pages.first() else {
        return Ok(false);
    };

    // Not every page job has created its record yet
    if (pages.len() as i32) < first.total_pages {
        return Ok(false);
    }

    // A failed page blocks the document permanently; the failure path
    // already flipped the document status.
    if pages.iter().any(|p| p.is_failed) {
        return Ok(false);
    }

    if !pages.iter().all(|p| p.is_completed && p.structuring_done) {
        return Ok(false);
    }

    let job = MergeJob {
        document_id,
        case_id,
    };
    let enqueued = store
        .enqueue(
            QUEUE_DOCUMENT_MERGE,
            "merge-document",
            serde_json::to_value(&job)?,
            JobOptions::with_dedup_key(format!("merge:{}", document_id)),
        )
        .await?;

    Ok(enqueued.is_some())
}

// ============================================================================
// Queue processor
// ============================================================================

/// Document-merge queue processor. Also owns case finalization: the last
/// document to finalize triggers the case-level merge.
pub struct MergeProcessor {
    repository: Repository,
}

impl MergeProcessor {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn merge(&self, job: &Job) -> Result<()> {
        let payload: MergeJob = job.parse_payload()?;

        let document = self
            .repository
            .find_document(payload.document_id)
            .await?
            .ok_or_else(|| AppError::RecordNotFound {
                entity: "document",
                id: payload.document_id.to_string(),
            })?;

        if document.is_terminal() {
            debug!(document_id = %document.id, "Document already terminal, merge is a no-op");
            return Ok(());
        }

        let pages = self.repository.pages_for_document(document.id).await?;
        if pages.is_empty()
            || pages.iter().any(|p| p.is_failed)
            || !pages.iter().all(|p| p.is_completed && p.structuring_done)
        {
            // Stale merge job; readiness will re-trigger when the document
            // actually finishes.
            warn!(document_id = %document.id, "Merge job arrived before document was ready");
            return Ok(());
        }

        let mut page_bundles: Vec<(i32, ResourceBundle)> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        for page in &pages {
            if let Some(raw) = &page.bundle {
                let bundle: ResourceBundle = serde_json::from_value(raw.clone())?;
                page_bundles.push((page.page_number, bundle));
            }
            if let Some(text) = &page.page_text {
                if !text.is_empty() {
                    texts.push(text.clone());
                }
            }
        }

        let merged = merge_page_bundles(&page_bundles);
        info!(
            document_id = %document.id,
            pages = pages.len(),
            patients = merged.patients.len(),
            conditions = merged.conditions.len(),
            claims = merged.claims.len(),
            "Document bundle merged"
        );

        self.repository
            .finalize_document(document.id, serde_json::to_value(&merged)?, texts.join("\n\n"))
            .await?;

        metrics::counter!("casetrace_documents_merged_total").increment(1);

        finalize_case_if_ready(&self.repository, payload.case_id).await
    }
}

/// When the last document of a case finalizes: merge document bundles, purge
/// page-level artifacts, set 100% and `processed`. Safe to call on any case;
/// it no-ops while unfinalized documents remain.
pub async fn finalize_case_if_ready(repository: &Repository, case_id: Uuid) -> Result<()> {
    let remaining = repository.unfinalized_document_count(case_id).await?;
    if remaining > 0 {
        debug!(case_id = %case_id, remaining, "Case still has unfinalized documents");
        return Ok(());
    }

    let documents = repository.documents_for_case(case_id).await?;
    let mut bundles = Vec::new();
    for document in &documents {
        if let Some(raw) = &document.merged_bundle {
            bundles.push(serde_json::from_value::<ResourceBundle>(raw.clone())?);
        }
    }

    let case_bundle = merge_document_bundles(&bundles);
    info!(
        case_id = %case_id,
        documents = documents.len(),
        entries = case_bundle.entries.len(),
        "Case bundle merged"
    );

    // Ephemeral page artifacts go away before the case reports done
    repository.purge_case_artifacts(case_id).await?;
    repository
        .finalize_case(case_id, serde_json::to_value(&case_bundle)?)
        .await?;

    metrics::counter!("casetrace_cases_finalized_total").increment(1);
    Ok(())
}

#[async_trait::async_trait]
impl JobProcessor for MergeProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        self.merge(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casetrace_common::bundle::{Claim, ClaimLineItem, Condition, DiagnosticReport, Encounter, Patient};
    use rand::seq::SliceRandom;

    fn patient(id: &str, family: &str, birth: &str) -> Patient {
        Patient {
            id: id.to_string(),
            family_name: Some(family.to_string()),
            given_name: None,
            birth_date: Some(birth.to_string()),
            gender: None,
        }
    }

    fn condition(id: &str, patient_id: Option<&str>, code: &str) -> Condition {
        Condition {
            id: id.to_string(),
            patient_id: patient_id.map(Into::into),
            code: Some(code.to_string()),
            description: None,
            onset_date: None,
        }
    }

    fn claim(id: &str, patient_id: Option<&str>, service_code: &str) -> Claim {
        Claim {
            id: id.to_string(),
            patient_id: patient_id.map(Into::into),
            provider: None,
            total_amount: None,
            line_items: vec![ClaimLineItem {
                service_code: Some(service_code.to_string()),
                description: None,
                amount: None,
                service_date: None,
            }],
        }
    }

    /// Three pages of one document, page 1 native and pages 2-3 OCR, all
    /// mentioning the same patient under different per-page ids.
    fn three_page_bundles() -> Vec<(i32, ResourceBundle)> {
        let page1 = ResourceBundle {
            patients: vec![patient("p1", "Diaz", "1960-01-31")],
            conditions: vec![condition("c1", Some("p1"), "I10")],
            claims: vec![claim("cl1", Some("p1"), "99213")],
            ..Default::default()
        };
        let page2 = ResourceBundle {
            patients: vec![patient("p2", "DIAZ", "1960-01-31")],
            conditions: vec![
                condition("c2", Some("p2"), "I10"),  // duplicate diagnosis
                condition("c3", Some("p2"), "E11.9"),
            ],
            ..Default::default()
        };
        let page3 = ResourceBundle {
            patients: vec![patient("p3", "Diaz", "1960-01-31")],
            claims: vec![
                claim("cl2", Some("p3"), "99213"), // duplicate first line item
                claim("cl3", Some("p3"), "71046"),
            ],
            ..Default::default()
        };
        vec![(1, page1), (2, page2), (3, page3)]
    }

    #[test]
    fn test_document_merge_dedups_and_rewrites_patient_refs() {
        let merged = merge_page_bundles(&three_page_bundles());

        // One resolved patient
        assert_eq!(merged.patients.len(), 1);
        assert_eq!(merged.patients[0].id, "p1");

        // I10 deduplicated by code, E11.9 kept
        assert_eq!(merged.conditions.len(), 2);
        let codes: Vec<_> = merged.conditions.iter().map(|c| c.code.as_deref().unwrap()).collect();
        assert_eq!(codes, vec!["I10", "E11.9"]);

        // Claims deduplicated by first line item
        assert_eq!(merged.claims.len(), 2);

        // Every cross-referencing resource points at the resolved patient
        assert!(merged.conditions.iter().all(|c| c.patient_id.as_deref() == Some("p1")));
        assert!(merged.claims.iter().all(|c| c.patient_id.as_deref() == Some("p1")));
    }

    #[test]
    fn test_document_merge_is_order_independent() {
        let baseline = merge_page_bundles(&three_page_bundles());

        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let mut shuffled = three_page_bundles();
            shuffled.shuffle(&mut rng);
            assert_eq!(merge_page_bundles(&shuffled), baseline);
        }
    }

    #[test]
    fn test_document_merge_is_idempotent() {
        let once = merge_page_bundles(&three_page_bundles());
        let pages = vec![(1, once.clone())];
        let twice = merge_page_bundles(&pages);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_first_seen_wins_keeps_earliest_page_fields() {
        let pages = vec![
            (
                2,
                ResourceBundle {
                    patients: vec![Patient {
                        gender: Some("unknown".to_string()),
                        ..patient("late", "Okafor", "1988-11-23")
                    }],
                    ..Default::default()
                },
            ),
            (
                1,
                ResourceBundle {
                    patients: vec![Patient {
                        gender: Some("female".to_string()),
                        ..patient("early", "Okafor", "1988-11-23")
                    }],
                    ..Default::default()
                },
            ),
        ];

        // Page order, not vec order, decides who is first
        let merged = merge_page_bundles(&pages);
        assert_eq!(merged.patients.len(), 1);
        assert_eq!(merged.patients[0].id, "early");
        assert_eq!(merged.patients[0].gender.as_deref(), Some("female"));
    }

    #[test]
    fn test_unreferenced_resources_adopt_primary_patient() {
        let pages = vec![(
            1,
            ResourceBundle {
                patients: vec![patient("p1", "Diaz", "1960-01-31")],
                diagnostic_reports: vec![DiagnosticReport {
                    id: "r1".to_string(),
                    patient_id: None,
                    code: Some("CBC".to_string()),
                    effective_date_time: Some("2024-02-01T09:00:00Z".to_string()),
                    conclusion: None,
                }],
                ..Default::default()
            },
        )];

        let merged = merge_page_bundles(&pages);
        assert_eq!(merged.diagnostic_reports[0].patient_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_encounters_dedup_by_id_or_period() {
        let e = |id: &str, start: &str| Encounter {
            id: id.to_string(),
            patient_id: None,
            class: None,
            period_start: Some(start.to_string()),
            period_end: None,
            provider: None,
        };
        let pages = vec![
            (1, ResourceBundle { encounters: vec![e("enc-1", "2024-01-01")], ..Default::default() }),
            (2, ResourceBundle { encounters: vec![e("enc-1", "2024-06-06")], ..Default::default() }),
            (3, ResourceBundle { encounters: vec![e("", "2024-01-01")], ..Default::default() }),
        ];

        let merged = merge_page_bundles(&pages);
        // "enc-1" twice dedups to one; the id-less one keys on its period
        assert_eq!(merged.encounters.len(), 2);
    }

    #[test]
    fn test_case_merge_retains_one_instance_per_type_and_id() {
        let doc1 = ResourceBundle {
            patients: vec![patient("p1", "Diaz", "1960-01-31")],
            conditions: vec![condition("c1", Some("p1"), "I10")],
            ..Default::default()
        };
        let doc2 = ResourceBundle {
            patients: vec![patient("p1", "Diaz", "1960-01-31")],
            conditions: vec![condition("c1", Some("p1"), "I10"), condition("c9", Some("p1"), "M54.5")],
            ..Default::default()
        };

        let case = merge_document_bundles(&[doc1, doc2]);
        let keys: Vec<_> = case
            .entries
            .iter()
            .map(|e| (e.resource.type_name(), e.resource.id()))
            .collect();
        assert_eq!(
            keys,
            vec![("Patient", "p1"), ("Condition", "c1"), ("Condition", "c9")]
        );
    }

    #[test]
    fn test_case_merge_drops_resources_without_id() {
        let doc = ResourceBundle {
            conditions: vec![condition("", None, "I10")],
            ..Default::default()
        };
        let case = merge_document_bundles(&[doc]);
        assert!(case.entries.is_empty());
    }

    #[test]
    fn test_case_merge_tags_stable_uris() {
        let doc = ResourceBundle {
            patients: vec![patient("p1", "Diaz", "1960-01-31")],
            ..Default::default()
        };
        let case = merge_document_bundles(&[doc]);
        assert_eq!(case.entries[0].full_url, "urn:casetrace:patient:p1");
    }
}
