use sea_orm::entity::prelude::*;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "acquisition_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub canonical_id: String,
    pub raw_reference: String,
    pub kind: String,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub audio_complete: bool,
    pub metadata_complete: bool,
    pub transcript_path: Option<String>,
    pub summary_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
