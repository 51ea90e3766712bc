pub mod prelude;

pub mod acquisition_records;
pub mod alias_records;
pub mod failure_log;
pub mod stage_status;
