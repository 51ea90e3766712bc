pub use super::acquisition_records::Entity as AcquisitionRecords;
pub use super::alias_records::Entity as AliasRecords;
pub use super::failure_log::Entity as FailureLog;
pub use super::stage_status::Entity as StageStatus;
