pub mod acquisition;
pub mod alias;
pub mod failure;
pub mod stage;
