//! SeaORM entity models
//!
//! Database entities for the Casetrace pipeline

mod case;
mod document;
mod page_embedding;
mod page_record;

pub use case::{
    ActiveModel as CaseActiveModel, CaseStatus, Column as CaseColumn, CronStatus,
    Entity as CaseEntity, Model as Case,
};

pub use document::{
    ActiveModel as DocumentActiveModel, Column as DocumentColumn, DocumentStatus,
    Entity as DocumentEntity, Model as Document,
};

pub use page_record::{
    ActiveModel as PageRecordActiveModel, Column as PageRecordColumn, Entity as PageRecordEntity,
    Model as PageRecord,
};

pub use page_embedding::{
    ActiveModel as PageEmbeddingActiveModel, Column as PageEmbeddingColumn,
    Entity as PageEmbeddingEntity, Model as PageEmbedding,
};
