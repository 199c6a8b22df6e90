//! Case entity - a claim/matter owned by an organization and a user

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Case status enum (persisted as an integer)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum CaseStatus {
    New = 0,
    InProgress = 1,
}

impl From<i32> for CaseStatus {
    fn from(v: i32) -> Self {
        match v {
            1 => CaseStatus::InProgress,
            _ => CaseStatus::New,
        }
    }
}

/// Orchestration guard for single-case processing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronStatus {
    Pending,
    Processing,
    Processed,
}

impl From<String> for CronStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "processing" => CronStatus::Processing,
            "processed" => CronStatus::Processed,
            _ => CronStatus::Pending,
        }
    }
}

impl From<CronStatus> for String {
    fn from(status: CronStatus) -> Self {
        match status {
            CronStatus::Pending => "pending".to_string(),
            CronStatus::Processing => "processing".to_string(),
            CronStatus::Processed => "processed".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cases")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub organization_id: Uuid,

    pub owner_id: Uuid,

    /// CaseStatus as integer
    pub status: i32,

    /// CronStatus as text
    #[sea_orm(column_type = "Text")]
    pub cron_status: String,

    /// 0-100, monotonic non-decreasing, capped at 95 until finalization
    pub percentage_completion: i32,

    /// Human-readable current pipeline stage
    #[sea_orm(column_type = "Text", nullable)]
    pub current_extraction_state: Option<String>,

    /// Merged case-level bundle, present once the final merge ran
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub merged_bundle: Option<Json>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the case status as an enum
    pub fn case_status(&self) -> CaseStatus {
        CaseStatus::from(self.status)
    }

    /// Get the cron status as an enum
    pub fn cron(&self) -> CronStatus {
        CronStatus::from(self.cron_status.clone())
    }

    /// Whether the pipeline finished this case
    pub fn is_processed(&self) -> bool {
        self.cron() == CronStatus::Processed
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::document::Entity")]
    Documents,
}

impl Related<super::document::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Documents.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_status_round_trip() {
        for s in [CronStatus::Pending, CronStatus::Processing, CronStatus::Processed] {
            let text: String = s.clone().into();
            assert_eq!(CronStatus::from(text), s);
        }
    }

    #[test]
    fn test_unknown_cron_status_defaults_to_pending() {
        assert_eq!(CronStatus::from("garbage".to_string()), CronStatus::Pending);
    }
}
