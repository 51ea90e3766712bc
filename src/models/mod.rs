pub mod stage;
pub mod target;

pub use stage::{Stage, StageState, StageStatusInput};
pub use target::{AcquisitionTarget, TargetKind};
