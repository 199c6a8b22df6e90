//! Document entity - one source file belonging to a Case

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Document status enum
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Success,
    Failed,
}

impl From<String> for DocumentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => DocumentStatus::Success,
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Pending,
        }
    }
}

impl From<DocumentStatus> for String {
    fn from(status: DocumentStatus) -> Self {
        match status {
            DocumentStatus::Pending => "pending".to_string(),
            DocumentStatus::Success => "success".to_string(),
            DocumentStatus::Failed => "failed".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub case_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub source_url: String,

    /// DocumentStatus as text
    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub is_completed: bool,

    /// Merged per-document bundle
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub merged_bundle: Option<Json>,

    /// Concatenated page text, kept for downstream surfaces
    #[sea_orm(column_type = "Text", nullable)]
    pub raw_text: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub failure_reason: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the document status as an enum
    pub fn document_status(&self) -> DocumentStatus {
        DocumentStatus::from(self.status.clone())
    }

    /// A document is finalized once it succeeded and all its pages completed
    pub fn is_finalized(&self) -> bool {
        self.document_status() == DocumentStatus::Success && self.is_completed
    }

    /// Terminal means no further pipeline work will touch this document
    pub fn is_terminal(&self) -> bool {
        self.is_finalized() || self.document_status() == DocumentStatus::Failed
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::case::Entity",
        from = "Column::CaseId",
        to = "super::case::Column::Id"
    )]
    Case,

    #[sea_orm(has_many = "super::page_record::Entity")]
    PageRecords,
}

impl Related<super::case::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Case.def()
    }
}

impl Related<super::page_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PageRecords.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
