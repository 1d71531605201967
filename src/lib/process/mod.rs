pub mod supervisor;
pub mod tracker;
pub mod types;
