pub mod local;
pub mod types;
